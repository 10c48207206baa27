use crate::catalog::TemplateCatalog;
use crate::schema::{
    AuditOutcome, AuditStatus, GapCategory, GapRecord, MatchCandidate, Severity, TemplateField,
    TriageResult,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Coverage and ranked gaps for one document, handed to the reporting layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageReport {
    pub coverage_percent: f64,
    pub satisfied_fields: usize,
    pub total_fields: usize,
    pub gaps: Vec<GapRecord>,
    pub generated_questions: Vec<String>,
    pub summary: GapSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GapSummary {
    pub total_gaps: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub by_category: BTreeMap<String, usize>,
    pub estimated_resolution_time: String,
}

pub fn clarifying_question(field: &TemplateField) -> String {
    format!(
        "What specific content should be included in the '{}' section?",
        field.display_name
    )
}

/// Compares the final accepted values against the catalog.
///
/// A field is satisfied when it was approved by triage or passed audit. Every
/// other field yields exactly one gap, so
/// `coverage_percent == 100 * (total - gaps) / total` always holds.
pub fn analyze(
    catalog: &TemplateCatalog,
    triage: &TriageResult,
    audited: &[AuditOutcome],
) -> CoverageReport {
    let mut accepted: HashMap<&str, &MatchCandidate> = HashMap::new();
    for candidate in &triage.approved {
        accepted.insert(candidate.field_id.as_str(), candidate);
    }

    let mut audit_by_field: HashMap<&str, &AuditOutcome> = HashMap::new();
    for outcome in audited {
        audit_by_field.insert(outcome.original.field_id.as_str(), outcome);
    }

    let mut satisfied = 0usize;
    let mut gaps = Vec::new();

    for field in catalog.iter() {
        if accepted.contains_key(field.id.as_str()) {
            satisfied += 1;
            continue;
        }

        let audit = audit_by_field.get(field.id.as_str());
        if audit.is_some_and(|a| a.is_success()) {
            satisfied += 1;
            continue;
        }

        let bypassed = triage.bypassed.iter().any(|id| id == &field.id);
        let (severity, category) = if bypassed {
            (Severity::Low, GapCategory::Missing)
        } else {
            let category = match audit {
                Some(a) if a.status == AuditStatus::Failed => GapCategory::AuditFailed,
                Some(a) if a.original.is_placeholder() => GapCategory::Missing,
                Some(_) => GapCategory::LowConfidence,
                None => {
                    let in_review = triage.review.iter().find(|c| c.field_id == field.id);
                    match in_review {
                        Some(c) if !c.is_placeholder() => GapCategory::LowConfidence,
                        _ => GapCategory::Missing,
                    }
                }
            };
            (field.severity_class, category)
        };

        gaps.push(GapRecord {
            field_id: field.id.clone(),
            severity,
            category,
            suggested_question: clarifying_question(field),
        });
    }

    // stable: equal severities keep catalog order
    gaps.sort_by(|a, b| b.severity.cmp(&a.severity));

    let total = catalog.len();
    let coverage_percent = round1(100.0 * satisfied as f64 / total.max(1) as f64);
    let generated_questions = gaps.iter().map(|g| g.suggested_question.clone()).collect();
    let summary = GapSummary::from_gaps(&gaps);

    info!(
        "Coverage {:.1}% ({}/{} fields), {} gaps",
        coverage_percent,
        satisfied,
        total,
        gaps.len()
    );

    CoverageReport {
        coverage_percent,
        satisfied_fields: satisfied,
        total_fields: total,
        gaps,
        generated_questions,
        summary,
    }
}

impl CoverageReport {
    /// Report for a document that failed before analysis could run.
    pub fn failed(total_fields: usize, category: &str, message: &str) -> Self {
        let gap = GapRecord {
            field_id: "<document>".to_string(),
            severity: Severity::Critical,
            category: GapCategory::DocumentFailed,
            suggested_question: format!(
                "Document processing failed ({}): {}. Should this document be retried or skipped?",
                category, message
            ),
        };
        let gaps = vec![gap];
        Self {
            coverage_percent: 0.0,
            satisfied_fields: 0,
            total_fields,
            generated_questions: gaps.iter().map(|g| g.suggested_question.clone()).collect(),
            summary: GapSummary::from_gaps(&gaps),
            gaps,
        }
    }

    pub fn to_csv(&self) -> String {
        let mut output = String::new();
        output.push_str("Field,Severity,Category,Question\n");

        for gap in &self.gaps {
            output.push_str(&format!(
                "{},{},{},{}\n",
                csv_quote(&gap.field_id),
                gap.severity.label(),
                gap.category.as_str(),
                csv_quote(&gap.suggested_question)
            ));
        }

        output
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        output.push_str("# Coverage Report\n\n");
        output.push_str(&format!(
            "**Coverage:** {:.1}% ({}/{} fields)\n\n",
            self.coverage_percent, self.satisfied_fields, self.total_fields
        ));
        output.push_str(&format!(
            "**Gaps:** {} (critical {}, high {}, medium {}, low {})\n\n",
            self.summary.total_gaps,
            self.summary.critical,
            self.summary.high,
            self.summary.medium,
            self.summary.low
        ));
        output.push_str(&format!(
            "**Estimated resolution time:** {}\n\n",
            self.summary.estimated_resolution_time
        ));

        if self.gaps.is_empty() {
            output.push_str("All template fields are covered.\n");
            return output;
        }

        output.push_str("## Questions for subject matter experts\n\n");
        for gap in &self.gaps {
            output.push_str(&format!(
                "- **[{}]** `{}`: {}\n",
                gap.severity.label(),
                gap.field_id,
                gap.suggested_question
            ));
        }
        output.push('\n');

        output
    }
}

impl GapSummary {
    pub fn from_gaps(gaps: &[GapRecord]) -> Self {
        let count = |s: Severity| gaps.iter().filter(|g| g.severity == s).count();

        let mut by_category = BTreeMap::new();
        for gap in gaps {
            *by_category
                .entry(gap.category.as_str().to_string())
                .or_insert(0) += 1;
        }

        let summary = Self {
            total_gaps: gaps.len(),
            critical: count(Severity::Critical),
            high: count(Severity::High),
            medium: count(Severity::Medium),
            low: count(Severity::Low),
            by_category,
            estimated_resolution_time: estimate_resolution_time(gaps),
        };
        debug!("Gap summary: {:?}", summary);
        summary
    }
}

/// Rough effort to close every gap: 4h critical, 2h high, 1h medium, 30m low.
pub fn estimate_resolution_time(gaps: &[GapRecord]) -> String {
    let total_hours: f64 = gaps
        .iter()
        .map(|g| match g.severity {
            Severity::Critical => 4.0,
            Severity::High => 2.0,
            Severity::Medium => 1.0,
            Severity::Low => 0.5,
        })
        .sum();

    if total_hours < 1.0 {
        format!("{} minutes", (total_hours * 60.0) as u32)
    } else if total_hours < 8.0 {
        format!("{:.1} hours", total_hours)
    } else {
        format!("{:.1} days", total_hours / 8.0)
    }
}

fn csv_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
