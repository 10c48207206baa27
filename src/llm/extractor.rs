use crate::catalog::TemplateCatalog;
use crate::error::{ExtractionError, Result};
use crate::llm::client::OracleCaller;
use crate::llm::prompts::{matching_user_prompt, response_schema};
use crate::llm::types::{
    MatchEnvelope, MatchResponse, OraclePurpose, OracleRequest, PipelineEvent, RawMatch,
};
use crate::schema::{Confidence, MatchCandidate, PromptVersion, RawSection, VersionId, MAX_CONFIDENCE};
use crate::utils::{clean_json_output, is_valid_string, is_valid_value, sanitize_string};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnmatchedReason {
    /// The oracle reported the field as not present. The confidence it gave
    /// for that absence (100 when omitted) is kept for diagnostics only.
    Absent { reported_confidence: Option<Confidence> },
    Timeout,
    Malformed { detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnmatchedField {
    pub field_id: String,
    #[serde(flatten)]
    pub reason: UnmatchedReason,
}

/// Result of one matching pass over a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchPass {
    pub prompt_version_id: VersionId,
    pub candidates: Vec<MatchCandidate>,
    pub unmatched: Vec<UnmatchedField>,
}

#[derive(Debug, Clone, PartialEq)]
enum FieldOutcome {
    Matched(MatchCandidate),
    Absent(Option<Confidence>),
    TimedOut,
    Malformed(String),
}

/// Asks the oracle for one value per catalog field.
#[derive(Clone)]
pub struct FieldExtractor {
    caller: OracleCaller,
    preview_chars: usize,
}

impl FieldExtractor {
    pub fn new(caller: OracleCaller, preview_chars: usize) -> Self {
        Self {
            caller,
            preview_chars,
        }
    }

    /// One matching pass. Timeouts and malformed replies are retried once with
    /// the identical request and then recorded per field; only
    /// `OracleUnavailable` is returned as an error.
    pub async fn match_fields(
        &self,
        sections: &[RawSection],
        catalog: &TemplateCatalog,
        prompt: &PromptVersion,
    ) -> Result<MatchPass> {
        let request = OracleRequest::new(
            OraclePurpose::Match,
            prompt.text.clone(),
            matching_user_prompt(
                sections,
                catalog,
                self.preview_chars,
                &response_schema::<MatchResponse>(),
            ),
        );

        let outcomes = match self.request_outcomes(&request, sections, catalog).await {
            Ok(first) => {
                let malformed = first
                    .iter()
                    .filter(|o| matches!(o, FieldOutcome::Malformed(_)))
                    .count();
                if malformed == 0 {
                    first
                } else {
                    warn!("{} field entries were malformed, retrying the pass once", malformed);
                    self.retry_event(malformed_summary(malformed)).await;
                    match self.request_outcomes(&request, sections, catalog).await {
                        Ok(second) => merge_retry(first, second),
                        Err(e) if e.is_field_scoped() => {
                            warn!("Retry of malformed entries failed: {}", e);
                            first
                                .into_iter()
                                .map(|o| match o {
                                    FieldOutcome::Malformed(_) => failure_outcome(&e),
                                    other => other,
                                })
                                .collect()
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) if e.is_field_scoped() => {
                warn!("Matching pass failed ({}), retrying once", e);
                self.retry_event(e.to_string()).await;
                match self.request_outcomes(&request, sections, catalog).await {
                    Ok(second) => second,
                    Err(e) if e.is_field_scoped() => {
                        warn!("Matching retry failed, every field is unmatched: {}", e);
                        vec![failure_outcome(&e); catalog.len()]
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let pass = build_pass(catalog, prompt.version_id, outcomes);
        info!(
            "Matching with prompt {}: {} candidates, {} unmatched",
            prompt.version_id,
            pass.candidates.len(),
            pass.unmatched.len()
        );
        Ok(pass)
    }

    async fn request_outcomes(
        &self,
        request: &OracleRequest,
        sections: &[RawSection],
        catalog: &TemplateCatalog,
    ) -> Result<Vec<FieldOutcome>> {
        let text = self.caller.call(request).await?;
        parse_match_reply(&text, sections, catalog)
    }

    async fn retry_event(&self, error: String) {
        self.caller
            .send_event(PipelineEvent::Retry {
                stage: OraclePurpose::Match,
                attempt: 2,
                error,
            })
            .await;
    }
}

fn malformed_summary(count: usize) -> String {
    format!("{} malformed field entries", count)
}

fn failure_outcome(error: &ExtractionError) -> FieldOutcome {
    match error {
        ExtractionError::OracleTimeout(_) => FieldOutcome::TimedOut,
        other => FieldOutcome::Malformed(other.to_string()),
    }
}

/// Entries that were malformed on the first pass take whatever the retry produced.
fn merge_retry(first: Vec<FieldOutcome>, second: Vec<FieldOutcome>) -> Vec<FieldOutcome> {
    first
        .into_iter()
        .zip(second)
        .map(|(a, b)| match a {
            FieldOutcome::Malformed(_) => b,
            other => other,
        })
        .collect()
}

/// Parses a matching reply into one outcome per catalog field, in catalog order.
///
/// A reply that is not a `{"matches": [...]}` object fails as a whole. Inside
/// it, each entry is validated on its own, so one bad entry only costs its field.
fn parse_match_reply(
    text: &str,
    sections: &[RawSection],
    catalog: &TemplateCatalog,
) -> Result<Vec<FieldOutcome>> {
    let envelope: MatchEnvelope = serde_json::from_str(&clean_json_output(text)).map_err(|e| {
        ExtractionError::OracleMalformedOutput(format!("Matching reply is not valid JSON: {}", e))
    })?;

    let ordinals: HashSet<usize> = sections.iter().map(|s| s.ordinal).collect();
    let mut outcomes: Vec<Option<FieldOutcome>> = vec![None; catalog.len()];

    for entry in envelope.matches {
        let Some(field_id) = entry.get("field_id").and_then(|v| v.as_str()).map(str::to_string)
        else {
            warn!("Dropping match entry without a field_id");
            continue;
        };
        let Some(position) = catalog.position(&field_id) else {
            warn!("Dropping match entry for unknown field '{}'", field_id);
            continue;
        };
        if outcomes[position].is_some() {
            warn!("Ignoring duplicate match entry for '{}'", field_id);
            continue;
        }

        let outcome = match serde_json::from_value::<RawMatch>(entry) {
            Ok(raw) => validate_entry(raw, sections, &ordinals),
            Err(e) => FieldOutcome::Malformed(format!("Entry does not match schema: {}", e)),
        };
        outcomes[position] = Some(outcome);
    }

    Ok(outcomes
        .into_iter()
        .map(|o| o.unwrap_or(FieldOutcome::Absent(Some(MAX_CONFIDENCE))))
        .collect())
}

fn validate_entry(raw: RawMatch, sections: &[RawSection], ordinals: &HashSet<usize>) -> FieldOutcome {
    let confidence = match raw.confidence {
        Some(c) => match parse_confidence(c) {
            Ok(c) => Some(c),
            Err(detail) => return FieldOutcome::Malformed(detail),
        },
        None => None,
    };

    let value = raw
        .value
        .as_deref()
        .map(sanitize_string)
        .filter(|v| is_valid_value(v));
    let Some(value) = value else {
        return FieldOutcome::Absent(Some(confidence.unwrap_or(MAX_CONFIDENCE)));
    };

    let Some(confidence) = confidence else {
        return FieldOutcome::Malformed("Value reported without a confidence".to_string());
    };
    let Some(ordinal) = raw.section else {
        return FieldOutcome::Malformed("Value reported without a source section".to_string());
    };
    if !ordinals.contains(&ordinal) {
        return FieldOutcome::Malformed(format!("Cited section {} does not exist", ordinal));
    }
    let Some(match_basis) = raw.match_basis else {
        return FieldOutcome::Malformed("Value reported without a match basis".to_string());
    };

    let section_ref = sections
        .iter()
        .find(|s| s.ordinal == ordinal)
        .map(RawSection::section_ref);

    let reasoning = raw
        .reasoning
        .as_deref()
        .map(sanitize_string)
        .filter(|r| is_valid_string(r))
        .unwrap_or_else(|| "No reasoning provided".to_string());

    FieldOutcome::Matched(MatchCandidate {
        field_id: raw.field_id,
        section_ref,
        value: Some(value),
        confidence,
        reasoning,
        match_basis: Some(match_basis),
    })
}

/// Confidence must be a whole number in `0..=100`; fractions are not rounded
/// because rounding can move a value across the triage threshold.
pub(crate) fn parse_confidence(value: f64) -> std::result::Result<Confidence, String> {
    if !value.is_finite() || !(0.0..=f64::from(MAX_CONFIDENCE)).contains(&value) {
        return Err(format!("Confidence {} is outside [0, 100]", value));
    }
    if value.fract() != 0.0 {
        return Err(format!("Confidence {} is not a whole number", value));
    }
    Ok(value as Confidence)
}

fn build_pass(
    catalog: &TemplateCatalog,
    prompt_version_id: VersionId,
    outcomes: Vec<FieldOutcome>,
) -> MatchPass {
    let mut candidates = Vec::new();
    let mut unmatched = Vec::new();

    for (field, outcome) in catalog.iter().zip(outcomes) {
        let reason = match outcome {
            FieldOutcome::Matched(candidate) => {
                candidates.push(candidate);
                continue;
            }
            FieldOutcome::Absent(reported_confidence) => UnmatchedReason::Absent {
                reported_confidence,
            },
            FieldOutcome::TimedOut => UnmatchedReason::Timeout,
            FieldOutcome::Malformed(detail) => {
                debug!("Field '{}' unmatched: {}", field.id, detail);
                UnmatchedReason::Malformed { detail }
            }
        };
        unmatched.push(UnmatchedField {
            field_id: field.id.clone(),
            reason,
        });
    }

    MatchPass {
        prompt_version_id,
        candidates,
        unmatched,
    }
}
