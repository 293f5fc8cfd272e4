use serde_json::json;
use tracing::debug;

use crate::bands::GradeBand;
use crate::calc::{self, CompetencyDefinition, CompetencyScoreSet};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{effective_config, optional_f64, optional_str, parse_param, required_f64};
use crate::ipc::types::{AppState, Request};
use crate::promotion::EligibilityRule;
use crate::report::{self, SubjectInput};

fn handle_continuous_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = match effective_config(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let competencies: Vec<CompetencyDefinition> =
        match parse_param(req, "competencies", Some(Vec::new())) {
            Ok(v) => v,
            Err(e) => return e,
        };
    let scores: CompetencyScoreSet =
        match parse_param(req, "competencyScores", Some(CompetencyScoreSet::new())) {
            Ok(v) => v,
            Err(e) => return e,
        };
    let project_score = match optional_f64(req, "projectScore") {
        Ok(v) => v.unwrap_or(0.0),
        Err(e) => return e,
    };
    let project_max = match optional_f64(req, "projectMax") {
        Ok(v) => v.unwrap_or(cfg.project_max),
        Err(e) => return e,
    };

    let report = calc::continuous_score_report(&scores, &competencies, project_score, project_max);
    debug!(
        score = report.score,
        status = ?report.status,
        "continuous score computed"
    );
    ok(&req.id, json!(report))
}

fn handle_total_and_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let continuous_score = match required_f64(req, "continuousScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let eot_score = match required_f64(req, "eotScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if eot_score > calc::EOT_MAX || continuous_score > calc::CONTINUOUS_CEILING {
        debug!(continuous_score, eot_score, "component score above its maximum");
    }
    let bands: Vec<GradeBand> = match req.params.get("gradeBands").filter(|v| !v.is_null()) {
        Some(_) => match parse_param(req, "gradeBands", None) {
            Ok(v) => v,
            Err(e) => return e,
        },
        None => match effective_config(state, req) {
            Ok(cfg) => cfg.grade_bands,
            Err(e) => return e,
        },
    };

    let result = calc::compute_total_and_grade(continuous_score, eot_score, &bands);
    ok(&req.id, json!(result))
}

fn handle_subject_result(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = match effective_config(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject: SubjectInput = match serde_json::from_value(req.params.clone()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", format!("invalid subject: {}", e), None),
    };
    let result = report::compute_subject_result(&subject, &cfg.report_context());
    ok(&req.id, json!(result))
}

fn handle_report_card(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = match effective_config(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subjects: Vec<SubjectInput> = match parse_param(req, "subjects", None) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rule: EligibilityRule =
        match parse_param(req, "eligibilityRule", Some(cfg.eligibility_rule.clone())) {
            Ok(v) => v,
            Err(e) => return e,
        };

    let card = report::compute_report_card(
        optional_str(req, "studentId"),
        &subjects,
        &cfg.report_context(),
        &rule,
    );
    debug!(
        subjects = card.subject_count,
        passed = card.passed_count,
        qualifies = card.qualifies_for_promotion,
        "report card computed"
    );
    ok(&req.id, json!(card))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calc.continuousScore" => Some(handle_continuous_score(state, req)),
        "calc.totalAndGrade" => Some(handle_total_and_grade(state, req)),
        "calc.subjectResult" => Some(handle_subject_result(state, req)),
        "calc.reportCard" => Some(handle_report_card(state, req)),
        _ => None,
    }
}
