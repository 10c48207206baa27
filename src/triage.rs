use crate::catalog::TemplateCatalog;
use crate::schema::{Confidence, MatchCandidate, TriageResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Partitions candidates by confidence.
///
/// Confidence at or above `threshold` is approved (ties included), anything
/// else goes to review. Catalog fields with no candidate are handled here too:
/// required ones enter review as a zero-confidence placeholder, optional ones
/// are listed in `bypassed` and never reach audit.
///
/// Candidates are processed in catalog order, so the result is identical for
/// identical input regardless of the order the oracle returned them in.
pub fn triage(
    catalog: &TemplateCatalog,
    candidates: &[MatchCandidate],
    threshold: Confidence,
) -> TriageResult {
    let mut approved = Vec::new();
    let mut review = Vec::new();
    let mut bypassed = Vec::new();
    let mut seen = HashSet::new();

    let mut place = |candidate: &MatchCandidate| {
        if candidate.confidence >= threshold && !candidate.is_placeholder() {
            approved.push(candidate.clone());
        } else {
            review.push(candidate.clone());
        }
    };

    for field in catalog.iter() {
        let mut matched = false;
        for candidate in candidates.iter().filter(|c| c.field_id == field.id) {
            matched = true;
            seen.insert(candidate.field_id.as_str());
            place(candidate);
        }
        if matched {
            continue;
        }
        if field.required {
            place(&MatchCandidate::placeholder(
                field.id.clone(),
                "No candidate produced for a required field",
            ));
        } else {
            bypassed.push(field.id.clone());
        }
    }

    // Candidates for ids outside the catalog still have to land somewhere.
    for candidate in candidates {
        if !seen.contains(candidate.field_id.as_str()) {
            place(candidate);
        }
    }

    debug!(
        "Triage at threshold {}: {} approved, {} review, {} bypassed",
        threshold,
        approved.len(),
        review.len(),
        bypassed.len()
    );

    TriageResult {
        approved,
        review,
        bypassed,
        threshold,
    }
}

/// Confidence distribution over a triage result, as reported to operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriageStats {
    pub threshold: Confidence,
    pub total: usize,
    pub approved: usize,
    pub review: usize,
    pub approval_rate: f64,
    pub review_rate: f64,
    pub average_confidence: f64,
    pub min_confidence: Confidence,
    pub max_confidence: Confidence,
    /// Counts for 90-100, 70-89, 50-69, 30-49 and 0-29.
    pub distribution: [usize; 5],
}

impl TriageStats {
    pub fn from_result(result: &TriageResult) -> Self {
        let confidences: Vec<Confidence> = result
            .approved
            .iter()
            .chain(result.review.iter())
            .map(|c| c.confidence)
            .collect();
        let total = confidences.len();

        let mut distribution = [0usize; 5];
        for &c in &confidences {
            let bucket = match c {
                90..=100 => 0,
                70..=89 => 1,
                50..=69 => 2,
                30..=49 => 3,
                _ => 4,
            };
            distribution[bucket] += 1;
        }

        let average_confidence = if total == 0 {
            0.0
        } else {
            round2(confidences.iter().map(|&c| c as f64).sum::<f64>() / total as f64)
        };

        Self {
            threshold: result.threshold,
            total,
            approved: result.approved.len(),
            review: result.review.len(),
            approval_rate: rate(result.approved.len(), total),
            review_rate: rate(result.review.len(), total),
            average_confidence,
            min_confidence: confidences.iter().copied().min().unwrap_or(0),
            max_confidence: confidences.iter().copied().max().unwrap_or(0),
            distribution,
        }
    }
}

fn rate(part: usize, total: usize) -> f64 {
    round2(part as f64 / total.max(1) as f64 * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
