use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::calc::CalcError;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, effective_config, optional_str, parse_param, required_str};
use crate::ipc::types::{AppState, Request};
use crate::promotion::{
    self, EligibilityRule, PromotionAction, PromotionDecision, PromotionPolicy, PromotionStatus,
    SubjectTotal, MIN_OVERRIDE_REASON_LEN,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectTotalInput {
    subject_name: String,
    total: f64,
    #[serde(default)]
    pass_threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageInput {
    student_id: String,
    current_class_id: String,
    suggested_class_id: String,
    #[serde(default)]
    subjects: Option<Vec<SubjectTotalInput>>,
    #[serde(default)]
    qualifies_for_promotion: Option<bool>,
}

/// A student ready to stage, eligibility already decided.
#[derive(Debug, Clone)]
struct StagedStudent {
    student_id: String,
    current_class_id: String,
    suggested_class_id: String,
    qualifies: bool,
}

fn subject_totals(raw: Vec<SubjectTotalInput>, default_threshold: f64) -> Vec<SubjectTotal> {
    raw.into_iter()
        .map(|s| SubjectTotal {
            subject_name: s.subject_name,
            total: s.total,
            pass_threshold: s.pass_threshold.unwrap_or(default_threshold),
        })
        .collect()
}

/// Subject totals go through the eligibility rule; an upstream flag is
/// taken as given only when no subjects are sent.
fn resolve_stage_input(
    input: StageInput,
    rule: &EligibilityRule,
    default_threshold: f64,
) -> Result<StagedStudent, CalcError> {
    let qualifies = match (input.subjects, input.qualifies_for_promotion) {
        (Some(raw), _) => rule.is_eligible(&subject_totals(raw, default_threshold)),
        (None, Some(q)) => q,
        (None, None) => {
            return Err(CalcError::new(
                "bad_params",
                "each student needs subjects or qualifiesForPromotion",
            )
            .with_details(json!({ "studentId": input.student_id })))
        }
    };
    Ok(StagedStudent {
        student_id: input.student_id,
        current_class_id: input.current_class_id,
        suggested_class_id: input.suggested_class_id,
        qualifies,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PromotionRecord {
    id: String,
    cycle_id: String,
    student_id: String,
    current_class_id: String,
    suggested_class_id: String,
    qualifies_for_promotion: bool,
    action: PromotionAction,
    target_class_id: String,
    status: PromotionStatus,
    overridden: bool,
    override_reason: Option<String>,
    created_at: String,
    decided_at: Option<String>,
}

impl PromotionRecord {
    fn decision(&self) -> PromotionDecision {
        PromotionDecision {
            student_id: self.student_id.clone(),
            action: self.action,
            target_class_id: self.target_class_id.clone(),
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn db_query_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

fn db_update_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_update_failed", e.to_string())
}

const RECORD_COLUMNS: &str = "id, cycle_id, student_id, current_class_id, suggested_class_id,
    qualifies, action, target_class_id, status, overridden, override_reason, created_at, decided_at";

fn unknown_value(column: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(CalcError::new(
            "db_query_failed",
            format!("unknown promotion {} {:?}", what, value),
        )),
    )
}

fn record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<PromotionRecord> {
    let action: String = r.get(6)?;
    let status: String = r.get(8)?;
    let action = PromotionAction::parse(&action).ok_or_else(|| unknown_value(6, "action", &action))?;
    let status = PromotionStatus::parse(&status).ok_or_else(|| unknown_value(8, "status", &status))?;
    Ok(PromotionRecord {
        id: r.get(0)?,
        cycle_id: r.get(1)?,
        student_id: r.get(2)?,
        current_class_id: r.get(3)?,
        suggested_class_id: r.get(4)?,
        qualifies_for_promotion: r.get::<_, i64>(5)? != 0,
        action,
        target_class_id: r.get(7)?,
        status,
        overridden: r.get::<_, i64>(9)? != 0,
        override_reason: r.get(10)?,
        created_at: r.get(11)?,
        decided_at: r.get(12)?,
    })
}

fn load_record(
    conn: &Connection,
    cycle_id: &str,
    student_id: &str,
) -> Result<Option<PromotionRecord>, CalcError> {
    let sql = format!(
        "SELECT {} FROM promotion_records WHERE cycle_id = ? AND student_id = ?",
        RECORD_COLUMNS
    );
    conn.query_row(&sql, (cycle_id, student_id), record_from_row)
        .optional()
        .map_err(db_query_err)
}

fn load_cycle_records(conn: &Connection, cycle_id: &str) -> Result<Vec<PromotionRecord>, CalcError> {
    let sql = format!(
        "SELECT {} FROM promotion_records WHERE cycle_id = ? ORDER BY created_at, student_id",
        RECORD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map([cycle_id], record_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(rows)
}

fn cycle_exists(conn: &Connection, cycle_id: &str) -> Result<bool, CalcError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM promotion_cycles WHERE id = ?",
            [cycle_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    Ok(found.is_some())
}

fn handle_promotion_evaluate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = match effective_config(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current_class_id = match required_str(req, "currentClassId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let suggested_class_id = match required_str(req, "suggestedClassId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rule: EligibilityRule =
        match parse_param(req, "eligibilityRule", Some(cfg.eligibility_rule.clone())) {
            Ok(v) => v,
            Err(e) => return e,
        };

    let subjects: Option<Vec<SubjectTotal>> = match req.params.get("subjects") {
        Some(v) if !v.is_null() => {
            let raw: Vec<SubjectTotalInput> = match parse_param(req, "subjects", None) {
                Ok(v) => v,
                Err(e) => return e,
            };
            Some(subject_totals(raw, cfg.pass_threshold))
        }
        _ => None,
    };

    let (qualifies, source) = match &subjects {
        Some(list) => (rule.is_eligible(list), "subjects"),
        None => match req.params.get("qualifiesForPromotion").and_then(|v| v.as_bool()) {
            Some(q) => (q, "upstream"),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "provide subjects or qualifiesForPromotion",
                    None,
                )
            }
        },
    };

    let decision = promotion::evaluate_promotion_default(
        &student_id,
        qualifies,
        &suggested_class_id,
        &current_class_id,
    );
    let subject_rows: Vec<serde_json::Value> = subjects
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .map(|s| {
            json!({
                "subjectName": s.subject_name,
                "total": s.total,
                "passThreshold": s.pass_threshold,
                "passed": s.passed(),
            })
        })
        .collect();
    let list = subjects.as_deref().unwrap_or(&[]);

    ok(
        &req.id,
        json!({
            "decision": decision,
            "qualifiesForPromotion": qualifies,
            "source": source,
            "passedCount": promotion::passed_count(list),
            "subjectCount": list.len(),
            "subjects": subject_rows,
        }),
    )
}

fn handle_validate_reason(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let reason = req
        .params
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    ok(
        &req.id,
        json!({
            "valid": promotion::validate_override_reason(reason),
            "minLength": MIN_OVERRIDE_REASON_LEN,
            "length": reason.trim().chars().count(),
        }),
    )
}

fn stage_students(
    conn: &Connection,
    cycle_id: &str,
    students: &[StagedStudent],
) -> Result<usize, CalcError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    let now = now_rfc3339();

    tx.execute(
        "INSERT OR IGNORE INTO promotion_cycles(id, created_at) VALUES(?, ?)",
        (cycle_id, &now),
    )
    .map_err(db_update_err)?;

    for s in students {
        if let Some(existing) = load_record(&tx, cycle_id, &s.student_id)? {
            if existing.status.is_terminal() {
                return Err(CalcError::new(
                    "already_processed",
                    "promotion already processed for this cycle",
                )
                .with_details(json!({
                    "studentId": s.student_id,
                    "status": existing.status.as_str(),
                })));
            }
        }
        let decision = promotion::evaluate_promotion_default(
            &s.student_id,
            s.qualifies,
            &s.suggested_class_id,
            &s.current_class_id,
        );
        // Re-staging a pending student replaces its default decision.
        tx.execute(
            "INSERT INTO promotion_records(id, cycle_id, student_id, current_class_id,
                 suggested_class_id, qualifies, action, target_class_id, status, created_at,
                 overridden, override_reason, decided_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, 0, NULL, NULL)
             ON CONFLICT(cycle_id, student_id) DO UPDATE SET
                 current_class_id = excluded.current_class_id,
                 suggested_class_id = excluded.suggested_class_id,
                 qualifies = excluded.qualifies,
                 action = excluded.action,
                 target_class_id = excluded.target_class_id,
                 overridden = 0,
                 override_reason = NULL",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                cycle_id,
                s.student_id,
                s.current_class_id,
                s.suggested_class_id,
                s.qualifies as i64,
                decision.action.as_str(),
                decision.target_class_id,
                now,
            ],
        )
        .map_err(db_update_err)?;
    }

    tx.commit()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    Ok(students.len())
}

fn handle_promotion_stage(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = match effective_config(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rule: EligibilityRule =
        match parse_param(req, "eligibilityRule", Some(cfg.eligibility_rule.clone())) {
            Ok(v) => v,
            Err(e) => return e,
        };
    let inputs: Vec<StageInput> = match parse_param(req, "students", None) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let students = match inputs
        .into_iter()
        .map(|s| resolve_stage_input(s, &rule, cfg.pass_threshold))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let cycle_id = optional_str(req, "cycleId").unwrap_or_else(|| Uuid::new_v4().to_string());

    match stage_students(conn, &cycle_id, &students) {
        Ok(staged) => {
            info!(cycle = %cycle_id, staged, "promotion cycle staged");
            ok(&req.id, json!({ "cycleId": cycle_id, "staged": staged }))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn override_record(
    conn: &Connection,
    cycle_id: &str,
    student_id: &str,
    action: PromotionAction,
    reason: &str,
) -> Result<PromotionRecord, CalcError> {
    let Some(record) = load_record(conn, cycle_id, student_id)? else {
        return Err(CalcError::new("not_found", "promotion record not found")
            .with_details(json!({ "cycleId": cycle_id, "studentId": student_id })));
    };
    if record.status.is_terminal() {
        return Err(CalcError::new(
            "already_processed",
            "promotion already processed for this cycle",
        )
        .with_details(json!({ "status": record.status.as_str() })));
    }

    let next = promotion::override_decision(
        &record.decision(),
        action,
        reason,
        &record.suggested_class_id,
        &record.current_class_id,
    )?;

    conn.execute(
        "UPDATE promotion_records
         SET action = ?, target_class_id = ?, overridden = 1, override_reason = ?
         WHERE id = ?",
        (next.action.as_str(), &next.target_class_id, reason.trim(), &record.id),
    )
    .map_err(db_update_err)?;

    load_record(conn, cycle_id, student_id)?
        .ok_or_else(|| CalcError::new("not_found", "promotion record not found"))
}

fn handle_promotion_override(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cycle_id = match required_str(req, "cycleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let action = match req
        .params
        .get("action")
        .and_then(|v| v.as_str())
        .and_then(PromotionAction::parse)
    {
        Some(v) => v,
        None => {
            return err(
                &req.id,
                "bad_params",
                "action must be one of: promote, repeat",
                None,
            )
        }
    };
    let reason = req
        .params
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    match override_record(conn, &cycle_id, &student_id, action, reason) {
        Ok(record) => {
            info!(
                cycle = %cycle_id,
                student = %student_id,
                action = action.as_str(),
                "promotion decision overridden"
            );
            ok(&req.id, json!(record))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

#[derive(Debug, Default)]
struct SubmitSummary {
    promoted: usize,
    repeating: usize,
}

fn submit_cycle(
    conn: &Connection,
    cycle_id: &str,
    student_ids: Option<&[String]>,
) -> Result<SubmitSummary, CalcError> {
    if !cycle_exists(conn, cycle_id)? {
        return Err(CalcError::new("not_found", "promotion cycle not found")
            .with_details(json!({ "cycleId": cycle_id })));
    }
    let records = load_cycle_records(conn, cycle_id)?;

    let selected: Vec<&PromotionRecord> = match student_ids {
        None => records.iter().filter(|r| !r.status.is_terminal()).collect(),
        Some(ids) => {
            let mut seen = BTreeSet::new();
            if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
                return Err(CalcError::new("bad_params", "studentIds contains duplicates")
                    .with_details(json!({ "studentId": dup })));
            }
            let mut picked = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(r) = records.iter().find(|r| &r.student_id == id) else {
                    return Err(CalcError::new("not_found", "promotion record not found")
                        .with_details(json!({ "studentId": id })));
                };
                picked.push(r);
            }
            picked
        }
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    let now = now_rfc3339();
    let mut summary = SubmitSummary::default();

    for r in selected {
        let next = r.status.submit(r.action).map_err(|e| {
            e.with_details(json!({
                "studentId": r.student_id,
                "status": r.status.as_str(),
            }))
        })?;
        let changed = tx
            .execute(
                "UPDATE promotion_records SET status = ?, decided_at = ?
                 WHERE id = ? AND status = 'pending'",
                (next.as_str(), &now, &r.id),
            )
            .map_err(db_update_err)?;
        if changed != 1 {
            return Err(CalcError::new(
                "already_processed",
                "promotion already processed for this cycle",
            )
            .with_details(json!({ "studentId": r.student_id })));
        }
        match next {
            PromotionStatus::Promoted => summary.promoted += 1,
            PromotionStatus::Repeating => summary.repeating += 1,
            PromotionStatus::Pending => {}
        }
    }

    tx.commit()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    Ok(summary)
}

fn handle_promotion_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cycle_id = match required_str(req, "cycleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_ids: Option<Vec<String>> = match req.params.get("studentIds") {
        Some(v) if !v.is_null() => match parse_param(req, "studentIds", None) {
            Ok(v) => Some(v),
            Err(e) => return e,
        },
        _ => None,
    };

    match submit_cycle(conn, &cycle_id, student_ids.as_deref()) {
        Ok(summary) => {
            info!(
                cycle = %cycle_id,
                promoted = summary.promoted,
                repeating = summary.repeating,
                "promotion cycle submitted"
            );
            ok(
                &req.id,
                json!({
                    "cycleId": cycle_id,
                    "processed": summary.promoted + summary.repeating,
                    "promoted": summary.promoted,
                    "repeating": summary.repeating,
                }),
            )
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_promotion_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cycle_id = match required_str(req, "cycleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_cycle_records(conn, &cycle_id) {
        Ok(records) => {
            debug!(cycle = %cycle_id, count = records.len(), "promotion records listed");
            ok(&req.id, json!({ "cycleId": cycle_id, "records": records }))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "promotion.evaluate" => Some(handle_promotion_evaluate(state, req)),
        "promotion.validateReason" => Some(handle_validate_reason(state, req)),
        "promotion.stage" => Some(handle_promotion_stage(state, req)),
        "promotion.override" => Some(handle_promotion_override(state, req)),
        "promotion.submit" => Some(handle_promotion_submit(state, req)),
        "promotion.list" => Some(handle_promotion_list(state, req)),
        _ => None,
    }
}
