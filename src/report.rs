use serde::{Deserialize, Serialize};

use crate::bands::GradeBand;
use crate::calc::{self, CompetencyDefinition, ContinuousScore, GradeStatus, SubjectAssessment};
use crate::promotion::{PromotionPolicy, SubjectTotal};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectInput {
    pub subject_name: String,
    #[serde(default)]
    pub competencies: Vec<CompetencyDefinition>,
    #[serde(flatten)]
    pub assessment: SubjectAssessment,
    #[serde(default)]
    pub pass_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject_name: String,
    pub continuous: ContinuousScore,
    pub continuous_score: f64,
    pub eot_score: f64,
    pub total: f64,
    pub grade: Option<String>,
    pub descriptor: Option<String>,
    pub grade_status: GradeStatus,
    pub pass_threshold: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub student_id: Option<String>,
    pub subjects: Vec<SubjectResult>,
    pub average_total: Option<f64>,
    pub passed_count: usize,
    pub subject_count: usize,
    pub incomplete_count: usize,
    pub qualifies_for_promotion: bool,
}

/// Grading inputs shared by every subject on a report card.
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    pub bands: &'a [GradeBand],
    pub project_max: f64,
    pub pass_threshold: f64,
}

/// Printed values are rounded to one decimal, and the grade is taken from
/// the printed total so the two never disagree.
pub fn compute_subject_result(subject: &SubjectInput, ctx: &ReportContext<'_>) -> SubjectResult {
    let assessment = &subject.assessment;
    let continuous = calc::continuous_score_report(
        &assessment.competency_scores,
        &subject.competencies,
        assessment.project_score,
        ctx.project_max,
    );
    let continuous_score = calc::round_off_1_decimal(continuous.score);
    let total = calc::round_off_1_decimal(calc::compute_total(continuous_score, assessment.eot_score));
    let graded = calc::grade_total(total, ctx.bands);
    let pass_threshold = subject.pass_threshold.unwrap_or(ctx.pass_threshold);

    SubjectResult {
        subject_name: subject.subject_name.clone(),
        continuous,
        continuous_score,
        eot_score: assessment.eot_score,
        total,
        grade: graded.grade,
        descriptor: graded.descriptor,
        grade_status: graded.status,
        pass_threshold,
        passed: total >= pass_threshold,
    }
}

pub fn compute_report_card(
    student_id: Option<String>,
    subjects: &[SubjectInput],
    ctx: &ReportContext<'_>,
    policy: &dyn PromotionPolicy,
) -> ReportCard {
    let results: Vec<SubjectResult> = subjects
        .iter()
        .map(|s| compute_subject_result(s, ctx))
        .collect();

    let totals: Vec<SubjectTotal> = results
        .iter()
        .map(|r| SubjectTotal {
            subject_name: r.subject_name.clone(),
            total: r.total,
            pass_threshold: r.pass_threshold,
        })
        .collect();

    let average_total = if results.is_empty() {
        None
    } else {
        let sum: f64 = results.iter().map(|r| r.total).sum();
        Some(calc::round_off_1_decimal(sum / results.len() as f64))
    };

    ReportCard {
        student_id,
        passed_count: results.iter().filter(|r| r.passed).count(),
        subject_count: results.len(),
        incomplete_count: results
            .iter()
            .filter(|r| r.continuous.status != calc::GradingStatus::Complete)
            .count(),
        qualifies_for_promotion: policy.is_eligible(&totals),
        average_total,
        subjects: results,
    }
}
