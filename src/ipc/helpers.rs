use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::config::{self, GradingConfig};
use crate::ipc::error::{calc_err, err};
use crate::ipc::types::{AppState, Request};

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    match req.params.get(key) {
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
        Some(v) => v.as_f64().ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be a number", key),
                Some(json!({ "field": key, "value": v })),
            )
        }),
    }
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(_) => required_f64(req, key).map(Some),
    }
}

/// Deserializes `params[key]`, or `default` when the key is absent or null.
pub fn parse_param<T: DeserializeOwned>(
    req: &Request,
    key: &str,
    default: Option<T>,
) -> Result<T, serde_json::Value> {
    match req.params.get(key).filter(|v| !v.is_null()) {
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            err(
                &req.id,
                "bad_params",
                format!("invalid {}: {}", key, e),
                None,
            )
        }),
        None => default.ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// Workspace configuration when a workspace is open, built-in defaults
/// otherwise.
pub fn effective_config(state: &AppState, req: &Request) -> Result<GradingConfig, serde_json::Value> {
    match state.db.as_ref() {
        Some(conn) => config::load(conn).map_err(|e| calc_err(&req.id, e)),
        None => Ok(GradingConfig::default()),
    }
}
