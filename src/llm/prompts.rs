// Prompts for the matching, audit, self-evaluation and evolution stages

use crate::catalog::TemplateCatalog;
use crate::schema::{EvaluationIssue, MatchCandidate, RawSection, TemplateField};
use crate::utils::{content_preview, is_valid_string, sanitize_string};
use schemars::JsonSchema;

/// Root prompt of every ledger. Evolution rewrites this text; the document and
/// field listings are appended per request and never part of the version.
pub const SEED_MATCHING_PROMPT: &str = r#"
You are an expert technical documentation analyst extracting hardware specification values.

## YOUR MISSION
For every template field listed in the request, find the value stated in the document sections and report where you found it.

## ANALYSIS CRITERIA
1. Content Purpose: what is the section describing (ports, power, cooling, dimensions, environment)?
2. Semantic Similarity: a section may use different words for the same field ("PSU" = "power supply", "height" = "rack units" only when stated in RU).
3. Units: copy numbers WITH their units and any alternate units in parentheses (e.g. "17.41 inches (44.23 cm)").
4. Part Numbers: copy identifiers character for character, including hyphens and suffixes.

## MATCHING RULES
✅ DO:
- Emit at most ONE entry per template field, using the field `id` exactly
- Cite the `section` number the value came from
- Give an integer `confidence` from 0 to 100 that reflects the evidence
- Explain the match in `reasoning`, quoting the wording that supports it
- Report a field you are sure is absent with an empty `value` and `confidence` 100

❌ DO NOT:
- Invent values that are not written in the sections
- Merge values from two different fields into one entry
- Guess a section number; if you cannot cite one, lower the confidence and say why

## CONFIDENCE GUIDE
- 90-100: the field name or a synonym appears right next to the value
- 70-89: the value is clearly implied by the section but labelled differently
- 50-69: plausible, relies on interpretation
- 0-49: weak evidence; the value needs human review

## OUTPUT FORMAT
Return ONLY a JSON object matching the response schema in the request.
"#;

pub const SYSTEM_PROMPT_AUDIT: &str = r#"
You are a QA assistant verifying a single extracted specification value against its source text.

## YOUR MISSION
Decide whether the extracted value for ONE template field is correct, using only the context provided.

## RULES
1. The field has one specific meaning; do not mix up values between different fields.
2. Look for the exact substring in the context that corresponds to the field.
3. Copy the exact spelling into `value` (hyphens, symbols, spaces and all) when correcting.
4. For numeric values include units (e.g. "64", "17.41 inches (44.23 cm)").
5. For descriptive values include the full description (e.g. "2 (1 RJ-45 port and 1 SFP port)").
6. Values may sit in tables or lists whose whitespace was lost ("64100-GigabitQSFPports" means 64 ports).

## VERDICTS
- `confirmed`: the original value is right. Give your own confidence 0-100.
- `corrected`: the original value is wrong or missing. Give the right value, the section number it came from and your confidence 0-100.
- `unresolved`: the context does not settle it. Explain what is missing.

Return ONLY a JSON object matching the response schema in the request.
"#;

pub const SYSTEM_PROMPT_EVALUATION: &str = r#"
You are an expert evaluator of field extraction quality. You are reviewing output produced from your own instructions.

## EVALUATION CRITERIA
1. Coverage: are the important template fields matched?
2. Confidence: are the confidence scores justified by the cited evidence?
3. Reasoning: are the explanations specific and accurate?
4. Semantic Accuracy: does each value mean what its field asks for?

## SCORING
- `overall_score`: 0-100 rating of the whole pass
- `issues`: one entry per concrete problem, each tagged with one criterion
- `improvement_suggestions`: specific changes to the INSTRUCTIONS that would fix the issues; do not restate the issues

Return ONLY a JSON object matching the response schema in the request.
"#;

pub const SYSTEM_PROMPT_EVOLUTION: &str = r#"
You maintain the instructions given to a field extraction assistant.

## YOUR MISSION
Rewrite the current instructions so they address the suggestions below while keeping their structure, their output format section and everything that already works.

## RULES
- Return the COMPLETE instructions, not a diff or a summary
- Do not add document content, field lists or example values from this request
- Keep the instruction to answer with JSON matching the response schema

Return ONLY a JSON object of the form {"prompt_text": "..."}.
"#;

/// Pretty-printed JSON schema of `T`, shown to the oracle as the expected reply shape.
pub fn response_schema<T: JsonSchema>() -> String {
    let root = schemars::schema_for!(T);
    serde_json::to_string_pretty(&root).unwrap_or_default()
}

/// Heading for display; blank or junk headings fall back to `Section <n>`.
pub fn section_heading(section: &RawSection) -> String {
    section
        .heading
        .as_deref()
        .map(sanitize_string)
        .filter(|h| is_valid_string(h))
        .unwrap_or_else(|| format!("Section {}", section.ordinal))
}

pub fn render_sections(sections: &[RawSection], preview_chars: usize) -> String {
    sections
        .iter()
        .map(|s| {
            format!(
                "Section {}: '{}' (Content: {})",
                s.ordinal,
                section_heading(s),
                content_preview(&s.body, preview_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_field(field: &TemplateField) -> String {
    let mut line = format!(
        "- `{}`: {} (kind: {:?})",
        field.id, field.display_name, field.expected_kind
    );
    if !field.synonyms.is_empty() {
        let synonyms: Vec<&str> = field.synonyms.iter().map(String::as_str).collect();
        line.push_str(&format!(" also called: {}", synonyms.join(", ")));
    }
    line
}

pub fn render_fields(catalog: &TemplateCatalog) -> String {
    catalog
        .iter()
        .map(render_field)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn matching_user_prompt(
    sections: &[RawSection],
    catalog: &TemplateCatalog,
    preview_chars: usize,
    schema: &str,
) -> String {
    format!(
        "### DOCUMENT SECTIONS\n{}\n\n### TEMPLATE FIELDS\n{}\n\n### RESPONSE SCHEMA\n{}\n\n\
        Extract a value for each template field. Return ONLY valid JSON matching the schema.",
        render_sections(sections, preview_chars),
        render_fields(catalog),
        schema
    )
}

/// One piece of narrowed context for an audit query.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditContext {
    pub ordinal: usize,
    pub heading: String,
    pub text: String,
}

pub fn audit_user_prompt(
    field: Option<&TemplateField>,
    candidate: &MatchCandidate,
    context: &[AuditContext],
    schema: &str,
) -> String {
    let field_line = match field {
        Some(f) => render_field(f),
        None => format!("- `{}`", candidate.field_id),
    };

    let original = match (&candidate.value, &candidate.section_ref) {
        (Some(value), Some(section)) => format!(
            "Value: \"{}\" (from section {}, confidence {})",
            value, section.ordinal, candidate.confidence
        ),
        (Some(value), None) => format!("Value: \"{}\" (confidence {})", value, candidate.confidence),
        (None, _) => "No value was extracted.".to_string(),
    };

    let context_text = context
        .iter()
        .map(|c| format!("Section {} '{}':\n{}", c.ordinal, c.heading, c.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "### FIELD\n{}\n\n### ORIGINAL EXTRACTION\n{}\nReasoning: {}\n\n### CONTEXT\n{}\n\n\
        ### RESPONSE SCHEMA\n{}",
        field_line, original, candidate.reasoning, context_text, schema
    )
}

pub fn evaluation_user_prompt(
    candidates: &[MatchCandidate],
    catalog: &TemplateCatalog,
    section_count: usize,
    schema: &str,
) -> String {
    let summary: Vec<serde_json::Value> = candidates
        .iter()
        .map(|c| {
            serde_json::json!({
                "field": catalog.get(&c.field_id).map(|f| f.display_name.as_str()).unwrap_or(&c.field_id),
                "value": c.value,
                "section": c.section_ref.as_ref().map(|s| s.ordinal),
                "confidence": c.confidence,
                "reasoning": c.reasoning,
            })
        })
        .collect();
    let results = serde_json::to_string_pretty(&summary).unwrap_or_default();

    let coverage = if catalog.is_empty() {
        0.0
    } else {
        candidates.len() as f64 / catalog.len() as f64 * 100.0
    };

    format!(
        "### MATCHING RESULTS\n{}\n\nDOCUMENT SECTIONS COUNT: {}\nTEMPLATE FIELDS COUNT: {}\n\
        MATCHES FOUND: {}\nCOVERAGE: {:.1}%\n\n### RESPONSE SCHEMA\n{}",
        results,
        section_count,
        catalog.len(),
        candidates.len(),
        coverage,
        schema
    )
}

pub fn evolution_user_prompt(
    current_text: &str,
    overall_score: f64,
    issues: &[EvaluationIssue],
    suggestions: &[String],
) -> String {
    let suggestions_text = suggestions
        .iter()
        .map(|s| format!("- {}", s))
        .collect::<Vec<_>>()
        .join("\n");
    let issues_text = issues
        .iter()
        .map(|i| format!("- [{:?}] {}", i.category, i.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "### SUGGESTIONS\n{}\n\n### EVALUATION CONTEXT\nOverall Score: {:.1}/100\nIssues:\n{}\n\n\
        ### CURRENT INSTRUCTIONS\n{}",
        suggestions_text, overall_score, issues_text, current_text
    )
}
