use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::calc::CalcError;

pub const MIN_OVERRIDE_REASON_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectTotal {
    pub subject_name: String,
    pub total: f64,
    pub pass_threshold: f64,
}

impl SubjectTotal {
    pub fn passed(&self) -> bool {
        self.total >= self.pass_threshold
    }
}

pub fn passed_count(subjects: &[SubjectTotal]) -> usize {
    subjects.iter().filter(|s| s.passed()).count()
}

/// Decides whether a student's subject totals qualify for promotion.
pub trait PromotionPolicy {
    fn is_eligible(&self, subjects: &[SubjectTotal]) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EligibilityRule {
    #[default]
    AllSubjects,
    Majority,
    MinimumPassed { count: usize },
}

impl PromotionPolicy for EligibilityRule {
    fn is_eligible(&self, subjects: &[SubjectTotal]) -> bool {
        if subjects.is_empty() {
            return false;
        }
        let passed = passed_count(subjects);
        match self {
            EligibilityRule::AllSubjects => passed == subjects.len(),
            EligibilityRule::Majority => passed * 2 > subjects.len(),
            EligibilityRule::MinimumPassed { count } => passed >= *count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionAction {
    Promote,
    Repeat,
}

impl PromotionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PromotionAction::Promote => "promote",
            PromotionAction::Repeat => "repeat",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "promote" => Some(PromotionAction::Promote),
            "repeat" => Some(PromotionAction::Repeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionDecision {
    pub student_id: String,
    pub action: PromotionAction,
    pub target_class_id: String,
}

fn target_for(action: PromotionAction, suggested_class_id: &str, current_class_id: &str) -> String {
    match action {
        PromotionAction::Promote => suggested_class_id.to_string(),
        PromotionAction::Repeat => current_class_id.to_string(),
    }
}

pub fn evaluate_promotion_default(
    student_id: &str,
    qualifies_for_promotion: bool,
    suggested_class_id: &str,
    current_class_id: &str,
) -> PromotionDecision {
    let action = if qualifies_for_promotion {
        PromotionAction::Promote
    } else {
        PromotionAction::Repeat
    };
    PromotionDecision {
        student_id: student_id.to_string(),
        action,
        target_class_id: target_for(action, suggested_class_id, current_class_id),
    }
}

pub fn validate_override_reason(reason: &str) -> bool {
    reason.trim().chars().count() >= MIN_OVERRIDE_REASON_LEN
}

/// Manual override of a decision. The reason is mandatory.
pub fn override_decision(
    decision: &PromotionDecision,
    action: PromotionAction,
    reason: &str,
    suggested_class_id: &str,
    current_class_id: &str,
) -> Result<PromotionDecision, CalcError> {
    if !validate_override_reason(reason) {
        return Err(CalcError::new(
            "validation_error",
            format!(
                "override reason must be at least {} characters",
                MIN_OVERRIDE_REASON_LEN
            ),
        )
        .with_details(json!({
            "minLength": MIN_OVERRIDE_REASON_LEN,
            "length": reason.trim().chars().count(),
        })));
    }
    Ok(PromotionDecision {
        student_id: decision.student_id.clone(),
        action,
        target_class_id: target_for(action, suggested_class_id, current_class_id),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionStatus {
    Pending,
    Promoted,
    Repeating,
}

impl PromotionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PromotionStatus::Pending => "pending",
            PromotionStatus::Promoted => "promoted",
            PromotionStatus::Repeating => "repeating",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(PromotionStatus::Pending),
            "promoted" => Some(PromotionStatus::Promoted),
            "repeating" => Some(PromotionStatus::Repeating),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != PromotionStatus::Pending
    }

    /// Pending -> Promoted | Repeating. Terminal states do not move.
    pub fn submit(self, action: PromotionAction) -> Result<PromotionStatus, CalcError> {
        if self.is_terminal() {
            return Err(CalcError::new(
                "already_processed",
                "promotion already processed for this cycle",
            )
            .with_details(json!({ "status": self.as_str() })));
        }
        Ok(match action {
            PromotionAction::Promote => PromotionStatus::Promoted,
            PromotionAction::Repeat => PromotionStatus::Repeating,
        })
    }
}
