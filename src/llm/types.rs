use crate::schema::{EvaluationIssue, MatchBasis, VersionId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Which stage issued an oracle call. Backends may use it to pick a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OraclePurpose {
    Match,
    Audit,
    Evaluate,
    Evolve,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OracleRequest {
    pub purpose: OraclePurpose,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl OracleRequest {
    pub fn new(purpose: OraclePurpose, system: impl Into<String>, user: impl Into<String>) -> Self {
        let (temperature, max_tokens) = match purpose {
            OraclePurpose::Match => (0.0, 4000),
            OraclePurpose::Audit => (0.0, 1000),
            OraclePurpose::Evaluate => (0.1, 2000),
            OraclePurpose::Evolve => (0.3, 2000),
        };
        Self {
            purpose,
            system: system.into(),
            user: user.into(),
            temperature,
            max_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OracleReply {
    pub text: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl OracleReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// One entry of a matching reply.
///
/// Every member is optional at the wire level so that a single bad entry can
/// be attributed to its field instead of failing the whole reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RawMatch {
    #[schemars(description = "The `id` of the template field, copied exactly")]
    pub field_id: String,

    #[schemars(description = "The exact value as written in the document, with units. Empty string when the document does not contain it.")]
    #[serde(default)]
    pub value: Option<String>,

    #[schemars(description = "The number of the document section the value was taken from")]
    #[serde(default)]
    pub section: Option<usize>,

    #[schemars(description = "Integer 0-100. How certain you are that `value` is correct for this field. Use 100 with an empty value when you are sure the document does not contain it.")]
    #[serde(default)]
    pub confidence: Option<f64>,

    #[schemars(description = "One or two sentences citing the wording that supports the value")]
    #[serde(default)]
    pub reasoning: Option<String>,

    #[serde(default)]
    pub match_basis: Option<MatchBasis>,
}

/// Shape shown to the oracle for a matching pass.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatchResponse {
    #[schemars(description = "At most one entry per template field")]
    pub matches: Vec<RawMatch>,
}

/// Envelope actually parsed; entries are validated one by one.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MatchEnvelope {
    pub matches: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum AuditVerdict {
    #[schemars(description = "The original value is correct for this field")]
    Confirmed { confidence: f64, reasoning: String },

    #[schemars(description = "The original value is wrong or missing; `value` is the exact text from the cited section")]
    Corrected {
        value: String,
        section: usize,
        confidence: f64,
        reasoning: String,
    },

    #[schemars(description = "The context does not settle the field either way")]
    Unresolved { reasoning: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EvaluationResponse {
    #[schemars(description = "0-100 rating of the overall matching quality")]
    pub overall_score: f64,

    #[serde(default)]
    pub issues: Vec<EvaluationIssue>,

    #[schemars(description = "Concrete, actionable changes to the matching instructions")]
    #[serde(default)]
    pub improvement_suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EvolutionResponse {
    #[schemars(description = "The complete rewritten matching instructions")]
    pub prompt_text: String,
}

/// Progress notifications emitted while a document runs through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PipelineEvent {
    Starting { document_id: String, prompt_version_id: VersionId },
    Matching,
    Retry { stage: OraclePurpose, attempt: usize, error: String },
    Triaged { approved: usize, review: usize },
    Auditing { items: usize },
    Analyzed { coverage_percent: f64 },
    Evaluating,
    Evolved { from: VersionId, to: VersionId },
    Completed { document_id: String },
    Failed { document_id: String, reason: String },
}
