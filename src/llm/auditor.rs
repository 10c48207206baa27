use crate::catalog::TemplateCatalog;
use crate::config::RunConfig;
use crate::error::{ExtractionError, Result};
use crate::llm::client::OracleCaller;
use crate::llm::extractor::parse_confidence;
use crate::llm::prompts::{
    audit_user_prompt, response_schema, section_heading, AuditContext, SYSTEM_PROMPT_AUDIT,
};
use crate::llm::types::{AuditVerdict, OraclePurpose, OracleRequest, PipelineEvent};
use crate::schema::{
    AuditOutcome, AuditStatus, Confidence, MatchCandidate, RawSection, TemplateField,
};
use crate::utils::{clean_json_output, content_preview, is_valid_value, locate_snippet, sanitize_string};
use log::{debug, info, warn};

/// Second look at every candidate triage could not approve.
#[derive(Clone)]
pub struct Auditor {
    caller: OracleCaller,
    threshold: Confidence,
    audit_confidence: Confidence,
    snippet_radius: usize,
}

impl Auditor {
    pub fn new(caller: OracleCaller, config: &RunConfig) -> Self {
        Self {
            caller,
            threshold: config.confidence_threshold,
            audit_confidence: config.audit_confidence,
            snippet_radius: config.audit_snippet_radius,
        }
    }

    /// Re-queries each review item on its own. Field-scoped oracle failures
    /// become `Failed` outcomes; `OracleUnavailable` aborts the pass.
    pub async fn audit(
        &self,
        review: &[MatchCandidate],
        sections: &[RawSection],
        catalog: &TemplateCatalog,
    ) -> Result<Vec<AuditOutcome>> {
        self.caller
            .send_event(PipelineEvent::Auditing {
                items: review.len(),
            })
            .await;

        let mut outcomes = Vec::with_capacity(review.len());
        for candidate in review {
            let field = catalog.get(&candidate.field_id);
            outcomes.push(self.audit_item(candidate, field, sections).await?);
        }

        let resolved = outcomes.iter().filter(|o| o.is_success()).count();
        info!("Audit resolved {}/{} review items", resolved, outcomes.len());
        Ok(outcomes)
    }

    async fn audit_item(
        &self,
        candidate: &MatchCandidate,
        field: Option<&TemplateField>,
        sections: &[RawSection],
    ) -> Result<AuditOutcome> {
        let context = narrow_context(candidate, field, sections, self.snippet_radius);
        let request = OracleRequest::new(
            OraclePurpose::Audit,
            SYSTEM_PROMPT_AUDIT,
            audit_user_prompt(field, candidate, &context, &response_schema::<AuditVerdict>()),
        );

        let verdict = match self
            .caller
            .call_parsed(&request, |text| parse_verdict(text, sections))
            .await
        {
            Ok(verdict) => verdict,
            Err(e) if e.is_field_scoped() => {
                warn!("Audit of '{}' failed: {}", candidate.field_id, e);
                return Ok(unchanged(candidate, AuditStatus::Failed, e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let outcome = self.apply_verdict(candidate, verdict, sections);
        debug!(
            "Audit of '{}': {:?} at {}",
            candidate.field_id, outcome.status, outcome.revised_confidence
        );
        Ok(outcome)
    }

    fn apply_verdict(
        &self,
        candidate: &MatchCandidate,
        verdict: AuditVerdict,
        sections: &[RawSection],
    ) -> AuditOutcome {
        // On success the oracle's own number is replaced by the fixed audit
        // confidence, floored at the pre-audit value.
        let audited = self.audit_confidence.max(candidate.confidence);

        match verdict {
            AuditVerdict::Confirmed { .. } if candidate.is_placeholder() => unchanged(
                candidate,
                AuditStatus::Unresolved,
                "Oracle confirmed a field that has no value".to_string(),
            ),
            AuditVerdict::Confirmed {
                confidence,
                reasoning,
            } if to_confidence(confidence) >= self.threshold => AuditOutcome {
                original: candidate.clone(),
                revised_value: candidate.value.clone(),
                revised_section: candidate.section_ref.clone(),
                revised_confidence: audited,
                status: AuditStatus::Confirmed,
                notes: sanitize_string(&reasoning),
            },
            AuditVerdict::Corrected {
                value,
                section,
                confidence,
                reasoning,
            } if to_confidence(confidence) >= self.threshold => AuditOutcome {
                original: candidate.clone(),
                revised_value: Some(sanitize_string(&value)),
                revised_section: sections
                    .iter()
                    .find(|s| s.ordinal == section)
                    .map(RawSection::section_ref),
                revised_confidence: audited,
                status: AuditStatus::Corrected,
                notes: sanitize_string(&reasoning),
            },
            AuditVerdict::Confirmed {
                confidence,
                reasoning,
            }
            | AuditVerdict::Corrected {
                confidence,
                reasoning,
                ..
            } => unchanged(
                candidate,
                AuditStatus::Unresolved,
                format!(
                    "Audit confidence {} below threshold {}: {}",
                    to_confidence(confidence),
                    self.threshold,
                    sanitize_string(&reasoning)
                ),
            ),
            AuditVerdict::Unresolved { reasoning } => {
                unchanged(candidate, AuditStatus::Unresolved, sanitize_string(&reasoning))
            }
        }
    }
}

fn unchanged(candidate: &MatchCandidate, status: AuditStatus, notes: String) -> AuditOutcome {
    AuditOutcome {
        original: candidate.clone(),
        revised_value: candidate.value.clone(),
        revised_section: candidate.section_ref.clone(),
        revised_confidence: candidate.confidence,
        status,
        notes,
    }
}

/// Verdict confidences are whole numbers once `parse_verdict` has accepted them.
fn to_confidence(value: f64) -> Confidence {
    value as Confidence
}

fn parse_verdict(text: &str, sections: &[RawSection]) -> Result<AuditVerdict> {
    let verdict: AuditVerdict = serde_json::from_str(&clean_json_output(text)).map_err(|e| {
        ExtractionError::OracleMalformedOutput(format!("Audit verdict does not match schema: {}", e))
    })?;

    let check_confidence = |c: f64| {
        parse_confidence(c)
            .map(|_| ())
            .map_err(|detail| ExtractionError::OracleMalformedOutput(format!("Audit: {}", detail)))
    };

    match &verdict {
        AuditVerdict::Confirmed { confidence, .. } => check_confidence(*confidence)?,
        AuditVerdict::Corrected {
            value,
            section,
            confidence,
            ..
        } => {
            check_confidence(*confidence)?;
            if !is_valid_value(value) {
                return Err(ExtractionError::OracleMalformedOutput(
                    "Corrected value is empty".to_string(),
                ));
            }
            if !sections.iter().any(|s| s.ordinal == *section) {
                return Err(ExtractionError::OracleMalformedOutput(format!(
                    "Corrected value cites section {} which does not exist",
                    section
                )));
            }
        }
        AuditVerdict::Unresolved { .. } => {}
    }
    Ok(verdict)
}

/// Builds the narrow context for one audit query.
///
/// A candidate with a value gets a window around that value in its cited
/// section, plus the first other section mentioning the value. Placeholders get
/// every section whose heading or body mentions the field name or a synonym,
/// falling back to every section.
pub fn narrow_context(
    candidate: &MatchCandidate,
    field: Option<&TemplateField>,
    sections: &[RawSection],
    radius: usize,
) -> Vec<AuditContext> {
    let preview_chars = radius.saturating_mul(2).max(1);
    let entry = |section: &RawSection, text: String| AuditContext {
        ordinal: section.ordinal,
        heading: section_heading(section),
        text,
    };

    let mut context = Vec::new();

    if let Some(value) = candidate.value.as_deref() {
        let cited = candidate
            .section_ref
            .as_ref()
            .and_then(|r| sections.iter().find(|s| s.ordinal == r.ordinal));

        if let Some(section) = cited {
            let text = locate_snippet(&section.body, value, radius)
                .map(|s| sanitize_string(&s))
                .unwrap_or_else(|| content_preview(&section.body, preview_chars));
            context.push(entry(section, text));
        }

        let elsewhere = sections
            .iter()
            .filter(|s| Some(s.ordinal) != cited.map(|c| c.ordinal))
            .find_map(|s| locate_snippet(&s.body, value, radius).map(|snippet| (s, snippet)));
        if let Some((section, snippet)) = elsewhere {
            context.push(entry(section, sanitize_string(&snippet)));
        }

        if !context.is_empty() {
            return context;
        }
    }

    let terms: Vec<String> = match field {
        Some(f) => f.search_terms(),
        None => vec![candidate.field_id.replace('_', " ")],
    };

    for section in sections {
        let heading = section.heading.as_deref().unwrap_or("").to_lowercase();
        let body = section.body.to_lowercase();
        let Some(term) = terms
            .iter()
            .find(|t| heading.contains(t.as_str()) || body.contains(t.as_str()))
        else {
            continue;
        };
        let text = locate_snippet(&section.body, term, radius)
            .map(|s| sanitize_string(&s))
            .unwrap_or_else(|| content_preview(&section.body, preview_chars));
        context.push(entry(section, text));
    }

    if context.is_empty() {
        context = sections
            .iter()
            .map(|s| entry(s, content_preview(&s.body, preview_chars)))
            .collect();
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::OracleError;
    use crate::llm::testing::ScriptedOracle;
    use crate::llm::types::OracleReply;
    use crate::schema::{MatchBasis, SectionRef, Severity};
    use std::sync::Arc;
    use std::time::Duration;

    fn sections() -> Vec<RawSection> {
        vec![
            RawSection::new("doc", 0, Some("Overview"), "The Cisco Nexus 9364C-H1 switch."),
            RawSection::new(
                "doc",
                1,
                Some("Physical Specifications"),
                "Width 17.41 inches (44.23 cm). Depth 22.27 inches (56.58 cm).",
            ),
            RawSection::new("doc", 2, Some("Environment"), "Relative humidity 5 to 95%."),
        ]
    }

    fn catalog() -> TemplateCatalog {
        TemplateCatalog::new(
            "t",
            vec![
                TemplateField::new("chassis_depth", "Chassis depth").required(Severity::High),
                TemplateField::new("humidity_requirements", "Humidity requirements")
                    .required(Severity::Medium)
                    .synonym("relative humidity"),
            ],
        )
        .unwrap()
    }

    fn depth_candidate(confidence: Confidence) -> MatchCandidate {
        MatchCandidate {
            field_id: "chassis_depth".to_string(),
            section_ref: Some(SectionRef {
                source_id: "doc".to_string(),
                ordinal: 1,
            }),
            value: Some("22.27 inches".to_string()),
            confidence,
            reasoning: "depth row".to_string(),
            match_basis: Some(MatchBasis::Fuzzy),
        }
    }

    fn auditor(oracle: Arc<ScriptedOracle>) -> Auditor {
        Auditor::new(
            OracleCaller::new(oracle, Duration::from_secs(5)),
            &RunConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_confirmation_fixes_confidence() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Ok(OracleReply::text(
            r#"{"verdict": "confirmed", "confidence": 91, "reasoning": "depth is stated"}"#,
        ))]));
        let outcomes = auditor(oracle.clone())
            .audit(&[depth_candidate(85)], &sections(), &catalog())
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, AuditStatus::Confirmed);
        assert_eq!(outcomes[0].revised_confidence, 95);
        assert_eq!(outcomes[0].revised_value.as_deref(), Some("22.27 inches"));
        assert!(oracle.requests()[0].user.contains("depth row"));
    }

    #[tokio::test]
    async fn test_success_never_lowers_confidence() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Ok(OracleReply::text(
            r#"{"verdict": "confirmed", "confidence": 100, "reasoning": "ok"}"#,
        ))]));
        let outcomes = auditor(oracle)
            .audit(&[depth_candidate(98)], &sections(), &catalog())
            .await
            .unwrap();
        assert_eq!(outcomes[0].revised_confidence, 98);
    }

    #[tokio::test]
    async fn test_low_verdict_leaves_item_unresolved() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Ok(OracleReply::text(
            r#"{"verdict": "corrected", "value": "22.27 inches (56.58 cm)", "section": 1, "confidence": 70, "reasoning": "unsure"}"#,
        ))]));
        let outcomes = auditor(oracle)
            .audit(&[depth_candidate(60)], &sections(), &catalog())
            .await
            .unwrap();
        assert_eq!(outcomes[0].status, AuditStatus::Unresolved);
        assert_eq!(outcomes[0].revised_confidence, 60);
        assert!(!outcomes[0].is_success());
    }

    #[tokio::test]
    async fn test_placeholder_can_be_corrected() {
        let placeholder = MatchCandidate::placeholder("humidity_requirements", "not matched");
        let oracle = Arc::new(ScriptedOracle::new(vec![Ok(OracleReply::text(
            r#"{"verdict": "corrected", "value": "5 to 95%", "section": 2, "confidence": 93, "reasoning": "environment section"}"#,
        ))]));
        let outcomes = auditor(oracle.clone())
            .audit(&[placeholder], &sections(), &catalog())
            .await
            .unwrap();

        assert_eq!(outcomes[0].status, AuditStatus::Corrected);
        assert_eq!(outcomes[0].revised_value.as_deref(), Some("5 to 95%"));
        assert_eq!(outcomes[0].revised_section.as_ref().unwrap().ordinal, 2);
        assert_eq!(outcomes[0].revised_confidence, 95);
        assert!(oracle.requests()[0].user.contains("Section 2 'Environment'"));
    }

    #[tokio::test]
    async fn test_single_digit_correction_is_accepted() {
        let placeholder = MatchCandidate::placeholder("chassis_depth", "not matched");
        let oracle = Arc::new(ScriptedOracle::new(vec![Ok(OracleReply::text(
            r#"{"verdict": "corrected", "value": "2", "section": 1, "confidence": 94, "reasoning": "depth row"}"#,
        ))]));
        let outcomes = auditor(oracle.clone())
            .audit(&[placeholder], &sections(), &catalog())
            .await
            .unwrap();

        assert_eq!(oracle.calls(), 1);
        assert_eq!(outcomes[0].status, AuditStatus::Corrected);
        assert_eq!(outcomes[0].revised_value.as_deref(), Some("2"));
    }

    #[test]
    fn test_fractional_verdict_confidence_is_malformed() {
        let err = parse_verdict(
            r#"{"verdict": "confirmed", "confidence": 89.5, "reasoning": "close"}"#,
            &sections(),
        )
        .unwrap_err();
        assert!(matches!(err, ExtractionError::OracleMalformedOutput(_)));
    }

    #[tokio::test]
    async fn test_malformed_twice_is_failed() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Ok(OracleReply::text(r#"{"verdict": "corrected", "value": "x y", "section": 9, "confidence": 99, "reasoning": "r"}"#)),
            Err(OracleError::Timeout),
        ]));
        let outcomes = auditor(oracle.clone())
            .audit(&[depth_candidate(50)], &sections(), &catalog())
            .await
            .unwrap();

        assert_eq!(oracle.calls(), 2);
        assert_eq!(outcomes[0].status, AuditStatus::Failed);
        assert_eq!(outcomes[0].revised_confidence, 50);
    }

    #[tokio::test]
    async fn test_unavailable_aborts_audit() {
        let oracle = Arc::new(ScriptedOracle::new(vec![Err(OracleError::Unavailable(
            "503".into(),
        ))]));
        let err = auditor(oracle)
            .audit(&[depth_candidate(50)], &sections(), &catalog())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::OracleUnavailable(_)));
    }

    #[test]
    fn test_narrow_context_for_value() {
        let context = narrow_context(&depth_candidate(80), None, &sections(), 6);
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].ordinal, 1);
        assert_eq!(context[0].text, "Depth 22.27 inches (56.5");
    }

    #[test]
    fn test_narrow_context_for_placeholder_uses_synonyms() {
        let catalog = catalog();
        let field = catalog.get("humidity_requirements");
        let placeholder = MatchCandidate::placeholder("humidity_requirements", "not matched");
        let context = narrow_context(&placeholder, field, &sections(), 50);
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].ordinal, 2);

        let unknown = MatchCandidate::placeholder("fan_modules", "not matched");
        assert_eq!(narrow_context(&unknown, None, &sections(), 50).len(), 3);
    }
}
