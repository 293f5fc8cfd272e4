use serde_json::json;
use tracing::info;

use crate::config;
use crate::ipc::error::{calc_err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match config::load(conn) {
        Ok(cfg) => ok(&req.id, json!(cfg)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current = match config::load(conn) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let next = match current.merged(&req.params) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    if let Err(e) = config::save(conn, &next) {
        return calc_err(&req.id, e);
    }
    info!(
        bands = next.grade_bands.len(),
        pass_threshold = next.pass_threshold,
        "grading config updated"
    );
    ok(&req.id, json!(next))
}

fn handle_config_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match config::reset(conn) {
        Ok(cfg) => {
            info!("grading config reset to defaults");
            ok(&req.id, json!(cfg))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.config.get" => Some(handle_config_get(state, req)),
        "grading.config.update" => Some(handle_config_update(state, req)),
        "grading.config.reset" => Some(handle_config_reset(state, req)),
        _ => None,
    }
}
