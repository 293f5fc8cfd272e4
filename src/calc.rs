use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bands::{lookup_grade, GradeBand};

/// Ceiling of the continuous-assessment component.
pub const CONTINUOUS_CEILING: f64 = 20.0;
/// Default maximum of the project mark.
pub const PROJECT_MAX: f64 = 10.0;
/// Maximum of the end-of-term examination.
pub const EOT_MAX: f64 = 80.0;

/// Competency id -> raw score. Ordered so reports list ids deterministically.
pub type CompetencyScoreSet = BTreeMap<String, f64>;

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for CalcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CalcError {}

/// Half-up 1-decimal rounding used on printed report cards:
/// `Int(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetencyDefinition {
    pub id: String,
    pub max_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAssessment {
    #[serde(default)]
    pub competency_scores: CompetencyScoreSet,
    #[serde(default)]
    pub project_score: f64,
    #[serde(default)]
    pub eot_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GradingStatus {
    Complete,
    Incomplete,
    Unconfigured,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuousScore {
    pub score: f64,
    pub raw_total: f64,
    pub max_possible: f64,
    pub status: GradingStatus,
    pub missing_competencies: Vec<String>,
    pub unrecognized_competencies: Vec<String>,
}

fn scale_to_ceiling(raw_total: f64, max_possible: f64) -> f64 {
    if max_possible == 0.0 {
        return 0.0;
    }
    (raw_total / max_possible * CONTINUOUS_CEILING).clamp(0.0, CONTINUOUS_CEILING)
}

fn raw_and_max(
    competency_scores: &CompetencyScoreSet,
    competencies: &[CompetencyDefinition],
    project_score: f64,
    project_max: f64,
) -> (f64, f64) {
    let raw_total = competency_scores.values().sum::<f64>() + project_score;
    let max_possible = competencies.iter().map(|c| c.max_score).sum::<f64>() + project_max;
    (raw_total, max_possible)
}

/// Continuous-assessment score on the 0..=20 scale. Competencies without a
/// score count as zero; a subject with nothing to score yields zero.
pub fn normalize_continuous_score(
    competency_scores: &CompetencyScoreSet,
    competencies: &[CompetencyDefinition],
    project_score: f64,
    project_max: f64,
) -> f64 {
    let (raw_total, max_possible) =
        raw_and_max(competency_scores, competencies, project_score, project_max);
    scale_to_ceiling(raw_total, max_possible)
}

/// Same score as [`normalize_continuous_score`], plus which
/// competencies were left ungraded or are not part of the subject.
pub fn continuous_score_report(
    competency_scores: &CompetencyScoreSet,
    competencies: &[CompetencyDefinition],
    project_score: f64,
    project_max: f64,
) -> ContinuousScore {
    let (raw_total, max_possible) =
        raw_and_max(competency_scores, competencies, project_score, project_max);

    let missing_competencies: Vec<String> = competencies
        .iter()
        .filter(|c| !competency_scores.contains_key(&c.id))
        .map(|c| c.id.clone())
        .collect();
    let unrecognized_competencies: Vec<String> = competency_scores
        .keys()
        .filter(|id| !competencies.iter().any(|c| &c.id == *id))
        .cloned()
        .collect();

    let status = if max_possible == 0.0 {
        GradingStatus::Unconfigured
    } else if missing_competencies.is_empty() {
        GradingStatus::Complete
    } else {
        GradingStatus::Incomplete
    };

    ContinuousScore {
        score: normalize_continuous_score(
            competency_scores,
            competencies,
            project_score,
            project_max,
        ),
        raw_total,
        max_possible,
        status,
        missing_competencies,
        unrecognized_competencies,
    }
}

/// Continuous + end-of-term. Out-of-range inputs are passed through.
pub fn compute_total(continuous_score: f64, eot_score: f64) -> f64 {
    continuous_score + eot_score
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GradeStatus {
    Graded,
    Unclassified,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalAndGrade {
    pub total: f64,
    pub grade: Option<String>,
    pub descriptor: Option<String>,
    pub status: GradeStatus,
}

pub fn grade_total(total: f64, bands: &[GradeBand]) -> TotalAndGrade {
    match lookup_grade(total, bands) {
        Some(band) => TotalAndGrade {
            total,
            grade: Some(band.letter.clone()),
            descriptor: Some(band.descriptor.clone()),
            status: GradeStatus::Graded,
        },
        None => TotalAndGrade {
            total,
            grade: None,
            descriptor: None,
            status: GradeStatus::Unclassified,
        },
    }
}

pub fn compute_total_and_grade(
    continuous_score: f64,
    eot_score: f64,
    bands: &[GradeBand],
) -> TotalAndGrade {
    grade_total(compute_total(continuous_score, eot_score), bands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bands::default_grade_bands;

    fn defs(maxima: &[(&str, f64)]) -> Vec<CompetencyDefinition> {
        maxima
            .iter()
            .map(|(id, max)| CompetencyDefinition {
                id: id.to_string(),
                max_score: *max,
            })
            .collect()
    }

    fn scores(values: &[(&str, f64)]) -> CompetencyScoreSet {
        values.iter().map(|(id, v)| (id.to_string(), *v)).collect()
    }

    #[test]
    fn round_off_is_half_up() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_off_1_decimal(35.6818), 35.7);
    }

    #[test]
    fn three_competencies_and_project_scale_to_sixteen() {
        let d = defs(&[("C1", 10.0), ("C2", 10.0), ("C3", 10.0)]);
        let s = scores(&[("C1", 8.0), ("C2", 7.0), ("C3", 9.0)]);
        let report = continuous_score_report(&s, &d, 8.0, PROJECT_MAX);
        assert_eq!(report.raw_total, 32.0);
        assert_eq!(report.max_possible, 40.0);
        assert_eq!(report.score, 16.0);
        assert_eq!(report.status, GradingStatus::Complete);
        assert_eq!(normalize_continuous_score(&s, &d, 8.0, PROJECT_MAX), 16.0);
    }

    #[test]
    fn project_maximum_is_configurable() {
        let d = defs(&[("C1", 10.0), ("C2", 10.0), ("C3", 10.0)]);
        let s = scores(&[("C1", 8.0), ("C2", 7.0), ("C3", 9.0)]);
        // 32 / 50 * 20
        assert_eq!(normalize_continuous_score(&s, &d, 8.0, 20.0), 12.8);
    }

    #[test]
    fn zero_max_possible_yields_zero() {
        let s = CompetencyScoreSet::new();
        assert_eq!(normalize_continuous_score(&s, &[], 0.0, 0.0), 0.0);
        let report = continuous_score_report(&s, &[], 0.0, 0.0);
        assert_eq!(report.status, GradingStatus::Unconfigured);
        assert_eq!(report.score, 0.0);
    }

    #[test]
    fn missing_competencies_count_as_zero_and_are_reported() {
        let d = defs(&[("C1", 10.0), ("C2", 10.0), ("C3", 10.0)]);
        let s = scores(&[("C1", 10.0), ("C3", 10.0)]);
        let report = continuous_score_report(&s, &d, 10.0, PROJECT_MAX);
        assert_eq!(report.score, 15.0);
        assert_eq!(report.status, GradingStatus::Incomplete);
        assert_eq!(report.missing_competencies, vec!["C2".to_string()]);
    }

    #[test]
    fn malformed_scores_are_capped_at_ceiling() {
        let d = defs(&[("C1", 5.0)]);
        let s = scores(&[("C1", 50.0), ("X9", 3.0)]);
        let report = continuous_score_report(&s, &d, 10.0, PROJECT_MAX);
        assert_eq!(report.score, CONTINUOUS_CEILING);
        assert_eq!(report.unrecognized_competencies, vec!["X9".to_string()]);
    }

    #[test]
    fn normalizer_stays_in_range_and_is_monotonic() {
        let d = defs(&[("C1", 4.0), ("C2", 6.0), ("C3", 3.0), ("C4", 12.0)]);
        let mut previous = -1.0;
        for step in 0..=12 {
            let v = step as f64;
            let s = scores(&[
                ("C1", v.min(4.0)),
                ("C2", v.min(6.0)),
                ("C3", v.min(3.0)),
                ("C4", v),
            ]);
            let score = normalize_continuous_score(&s, &d, v.min(PROJECT_MAX), PROJECT_MAX);
            assert!((0.0..=CONTINUOUS_CEILING).contains(&score));
            assert!(score >= previous);
            previous = score;
        }
        assert_eq!(previous, CONTINUOUS_CEILING);
    }

    #[test]
    fn normalizer_is_idempotent() {
        let d = defs(&[("C1", 7.0), ("C2", 9.0)]);
        let s = scores(&[("C1", 3.5), ("C2", 8.25)]);
        let a = continuous_score_report(&s, &d, 6.0, PROJECT_MAX);
        let b = continuous_score_report(&s, &d, 6.0, PROJECT_MAX);
        assert_eq!(a, b);
    }

    #[test]
    fn total_and_grade_examples() {
        let bands = default_grade_bands();

        let a = compute_total_and_grade(16.0, 70.0, &bands);
        assert_eq!(a.total, 86.0);
        assert_eq!(a.grade.as_deref(), Some("A"));
        assert_eq!(a.status, GradeStatus::Graded);

        let top = compute_total_and_grade(20.0, 80.0, &bands);
        assert_eq!(top.total, 100.0);
        assert_eq!(top.grade.as_deref(), Some("A*"));

        let zero = compute_total_and_grade(0.0, 0.0, &bands);
        assert_eq!(zero.total, 0.0);
        assert_eq!(zero.grade.as_deref(), Some("F"));
        assert_eq!(zero.descriptor.as_deref(), Some("Fail"));
    }

    #[test]
    fn total_is_not_clamped() {
        let bands = default_grade_bands();
        let over = compute_total_and_grade(20.0, 85.0, &bands);
        assert_eq!(over.total, 105.0);
        assert_eq!(over.status, GradeStatus::Unclassified);
        assert_eq!(over.grade, None);
    }
}
