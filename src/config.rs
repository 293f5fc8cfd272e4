use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bands::{default_grade_bands, validate_grade_bands, GradeBand};
use crate::calc::{CalcError, PROJECT_MAX};
use crate::db;
use crate::promotion::EligibilityRule;
use crate::report::ReportContext;

pub const CONFIG_KEY: &str = "grading.config";
pub const DEFAULT_PASS_THRESHOLD: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GradingConfig {
    pub grade_bands: Vec<GradeBand>,
    pub project_max: f64,
    pub pass_threshold: f64,
    pub eligibility_rule: EligibilityRule,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            grade_bands: default_grade_bands(),
            project_max: PROJECT_MAX,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            eligibility_rule: EligibilityRule::default(),
        }
    }
}

impl GradingConfig {
    pub fn validate(&self) -> Result<(), CalcError> {
        validate_grade_bands(&self.grade_bands)?;
        if !self.project_max.is_finite() || self.project_max < 0.0 {
            return Err(CalcError::new(
                "validation_error",
                "projectMax must be a non-negative number",
            ));
        }
        if !self.pass_threshold.is_finite() || !(0.0..=100.0).contains(&self.pass_threshold) {
            return Err(CalcError::new(
                "validation_error",
                "passThreshold must be between 0 and 100",
            ));
        }
        if let EligibilityRule::MinimumPassed { count: 0 } = self.eligibility_rule {
            return Err(CalcError::new(
                "validation_error",
                "minimumPassed count must be at least 1",
            ));
        }
        Ok(())
    }

    /// Applies the keys present in `patch`; absent or null keys keep their
    /// current value.
    pub fn merged(&self, patch: &serde_json::Value) -> Result<GradingConfig, CalcError> {
        if patch.is_null() {
            return Ok(self.clone());
        }
        let Some(obj) = patch.as_object() else {
            return Err(CalcError::new("bad_params", "config patch must be an object"));
        };
        let mut merged = json!(self);
        for key in ["gradeBands", "projectMax", "passThreshold", "eligibilityRule"] {
            if let Some(v) = obj.get(key).filter(|v| !v.is_null()) {
                merged[key] = v.clone();
            }
        }
        let next: GradingConfig = serde_json::from_value(merged)
            .map_err(|e| CalcError::new("bad_params", e.to_string()))?;
        next.validate()?;
        Ok(next)
    }

    pub fn report_context(&self) -> ReportContext<'_> {
        ReportContext {
            bands: &self.grade_bands,
            project_max: self.project_max,
            pass_threshold: self.pass_threshold,
        }
    }
}

pub fn load(conn: &Connection) -> Result<GradingConfig, CalcError> {
    let stored = db::settings_get_json(conn, CONFIG_KEY)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    match stored {
        None => Ok(GradingConfig::default()),
        Some(v) => serde_json::from_value(v).map_err(|e| {
            CalcError::new("db_query_failed", format!("stored grading config is invalid: {e}"))
        }),
    }
}

pub fn save(conn: &Connection, cfg: &GradingConfig) -> Result<(), CalcError> {
    cfg.validate()?;
    db::settings_set_json(conn, CONFIG_KEY, &json!(cfg))
        .map_err(|e| CalcError::new("db_update_failed", e.to_string()))
}

pub fn reset(conn: &Connection) -> Result<GradingConfig, CalcError> {
    db::settings_delete(conn, CONFIG_KEY)
        .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    Ok(GradingConfig::default())
}
