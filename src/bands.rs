use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::calc::CalcError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min_score: f64,
    pub max_score: f64,
    pub letter: String,
    pub descriptor: String,
}

impl GradeBand {
    pub fn new(min_score: f64, max_score: f64, letter: &str, descriptor: &str) -> Self {
        Self {
            min_score,
            max_score,
            letter: letter.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

/// Report-card band table. F is the terminal band below D so that every
/// total in 0..=100 is classified.
pub fn default_grade_bands() -> Vec<GradeBand> {
    vec![
        GradeBand::new(90.0, 100.0, "A*", "Outstanding"),
        GradeBand::new(80.0, 89.0, "A", "Excellent"),
        GradeBand::new(70.0, 79.0, "B", "Very good"),
        GradeBand::new(60.0, 69.0, "C", "Good"),
        GradeBand::new(50.0, 59.0, "D", "Satisfactory"),
        GradeBand::new(0.0, 49.0, "F", "Fail"),
    ]
}

fn by_min_desc(a: &&GradeBand, b: &&GradeBand) -> Ordering {
    b.min_score
        .partial_cmp(&a.min_score)
        .unwrap_or(Ordering::Equal)
}

/// Finds the band containing `total`. Bands are tried from the highest
/// minimum down. A band whose next-higher neighbour starts within one point
/// of its max also covers the fractional gap (89.5 is an A in 80-89/90-100).
pub fn lookup_grade(total: f64, bands: &[GradeBand]) -> Option<&GradeBand> {
    if !total.is_finite() {
        return None;
    }
    let mut ordered: Vec<&GradeBand> = bands.iter().collect();
    ordered.sort_by(by_min_desc);

    let mut higher_min: Option<f64> = None;
    for band in ordered {
        let upper_exclusive =
            higher_min.filter(|next| *next > band.max_score && *next <= band.max_score + 1.0);
        let in_band = match upper_exclusive {
            Some(next) => total >= band.min_score && total < next,
            None => total >= band.min_score && total <= band.max_score,
        };
        if in_band {
            return Some(band);
        }
        higher_min = Some(band.min_score);
    }
    None
}

pub fn validate_grade_bands(bands: &[GradeBand]) -> Result<(), CalcError> {
    if bands.is_empty() {
        return Err(CalcError::new(
            "validation_error",
            "gradeBands must contain at least one band",
        ));
    }

    let mut letters: HashSet<&str> = HashSet::new();
    for (i, b) in bands.iter().enumerate() {
        if !b.min_score.is_finite() || !b.max_score.is_finite() {
            return Err(CalcError::new("validation_error", "band bounds must be finite")
                .with_details(json!({ "index": i })));
        }
        if b.min_score > b.max_score {
            return Err(CalcError::new(
                "validation_error",
                "band minScore must not exceed maxScore",
            )
            .with_details(json!({ "index": i, "letter": b.letter })));
        }
        let letter = b.letter.trim();
        if letter.is_empty() {
            return Err(CalcError::new("validation_error", "band letter must not be empty")
                .with_details(json!({ "index": i })));
        }
        if !letters.insert(letter) {
            return Err(CalcError::new("validation_error", "duplicate band letter")
                .with_details(json!({ "letter": letter })));
        }
    }

    let mut ascending: Vec<&GradeBand> = bands.iter().collect();
    ascending.sort_by(|a, b| by_min_desc(b, a));

    for pair in ascending.windows(2) {
        let (lower, upper) = (pair[0], pair[1]);
        if upper.min_score <= lower.max_score {
            return Err(CalcError::new("validation_error", "grade bands overlap")
                .with_details(json!({ "lower": lower.letter, "upper": upper.letter })));
        }
        if upper.min_score > lower.max_score + 1.0 {
            return Err(CalcError::new("validation_error", "grade bands leave a gap")
                .with_details(json!({ "lower": lower.letter, "upper": upper.letter })));
        }
    }

    let lowest = ascending[0];
    let highest = ascending[ascending.len() - 1];
    if lowest.min_score > 0.0 || highest.max_score < 100.0 {
        return Err(CalcError::new(
            "validation_error",
            "grade bands must cover 0 to 100",
        )
        .with_details(json!({
            "lowestMin": lowest.min_score,
            "highestMax": highest.max_score,
        })));
    }

    Ok(())
}
