use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ExtractionError;

/// Oracle-reported certainty, always within `0..=100`.
pub type Confidence = u8;

pub const MAX_CONFIDENCE: Confidence = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[schemars(description = "Free-form descriptive text (e.g. 'Climate-controlled buildings')")]
    Text,

    #[schemars(description = "A measured quantity, keep units (e.g. '17.41 inches (44.23 cm)')")]
    Numeric,

    #[schemars(description = "A vendor part or model identifier copied verbatim (e.g. 'NXA-PAC-1400W')")]
    PartNumber,

    #[schemars(description = "A yes/no property (e.g. 'Supported')")]
    Boolean,
}

/// Ordered from least to most severe so that `Ord` sorts `Critical` last.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateField {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub synonyms: BTreeSet<String>,
    #[serde(default = "default_kind")]
    pub expected_kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_severity")]
    pub severity_class: Severity,
}

fn default_kind() -> FieldKind {
    FieldKind::Text
}

fn default_severity() -> Severity {
    Severity::Medium
}

impl TemplateField {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            synonyms: BTreeSet::new(),
            expected_kind: FieldKind::Text,
            required: false,
            severity_class: Severity::Medium,
        }
    }

    #[must_use]
    pub fn kind(mut self, kind: FieldKind) -> Self {
        self.expected_kind = kind;
        self
    }

    #[must_use]
    pub fn required(mut self, severity: Severity) -> Self {
        self.required = true;
        self.severity_class = severity;
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity_class = severity;
        self
    }

    #[must_use]
    pub fn synonym(mut self, synonym: impl Into<String>) -> Self {
        self.synonyms.insert(synonym.into());
        self
    }

    /// Display name followed by every synonym, lower-cased.
    pub fn search_terms(&self) -> Vec<String> {
        std::iter::once(self.display_name.to_lowercase())
            .chain(self.synonyms.iter().map(|s| s.to_lowercase()))
            .collect()
    }
}

/// One section of a parsed document, as delivered by an external parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawSection {
    pub source_id: String,
    pub ordinal: usize,
    #[serde(default)]
    pub heading: Option<String>,
    pub body: String,
}

impl RawSection {
    pub fn new(
        source_id: impl Into<String>,
        ordinal: usize,
        heading: Option<&str>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            ordinal,
            heading: heading.map(str::to_string),
            body: body.into(),
        }
    }

    pub fn section_ref(&self) -> SectionRef {
        SectionRef {
            source_id: self.source_id.clone(),
            ordinal: self.ordinal,
        }
    }
}

/// A document handed to the pipeline: an id plus its ordered sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub sections: Vec<RawSection>,
}

impl SourceDocument {
    /// Builds a document from `(heading, body)` pairs, numbering sections from 0.
    pub fn from_pairs<I, H, B>(id: impl Into<String>, sections: I) -> Self
    where
        I: IntoIterator<Item = (Option<H>, B)>,
        H: Into<String>,
        B: Into<String>,
    {
        let id = id.into();
        let sections = sections
            .into_iter()
            .enumerate()
            .map(|(ordinal, (heading, body))| RawSection {
                source_id: id.clone(),
                ordinal,
                heading: heading.map(Into::into),
                body: body.into(),
            })
            .collect();
        Self { id, sections }
    }
}

/// Provenance of an extracted value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SectionRef {
    pub source_id: String,
    pub ordinal: usize,
}

impl fmt::Display for SectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source_id, self.ordinal)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MatchBasis {
    #[schemars(description = "The field name or a synonym appears verbatim next to the value")]
    Exact,

    #[schemars(description = "A near-identical wording (typos, hyphenation, spacing) identifies the value")]
    Fuzzy,

    #[schemars(description = "The section content means the same thing even though the words differ")]
    Semantic,

    #[schemars(description = "Only a keyword co-occurrence links the value to the field")]
    Keyword,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchCandidate {
    pub field_id: String,
    pub section_ref: Option<SectionRef>,
    pub value: Option<String>,
    pub confidence: Confidence,
    pub reasoning: String,
    pub match_basis: Option<MatchBasis>,
}

impl MatchCandidate {
    /// Stand-in for a required field the oracle did not match, so that audit gets a chance at it.
    pub fn placeholder(field_id: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            field_id: field_id.into(),
            section_ref: None,
            value: None,
            confidence: 0,
            reasoning: reasoning.into(),
            match_basis: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriageResult {
    pub approved: Vec<MatchCandidate>,
    pub review: Vec<MatchCandidate>,
    /// Non-required fields with no candidate; they skip review entirely.
    pub bypassed: Vec<String>,
    pub threshold: Confidence,
}

impl TriageResult {
    pub fn total(&self) -> usize {
        self.approved.len() + self.review.len()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Confirmed,
    Corrected,
    Unresolved,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditOutcome {
    pub original: MatchCandidate,
    pub revised_value: Option<String>,
    pub revised_section: Option<SectionRef>,
    pub revised_confidence: Confidence,
    pub status: AuditStatus,
    pub notes: String,
}

impl AuditOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, AuditStatus::Confirmed | AuditStatus::Corrected)
    }

    /// The candidate as it stands after audit.
    pub fn resolved_candidate(&self) -> MatchCandidate {
        MatchCandidate {
            field_id: self.original.field_id.clone(),
            section_ref: self
                .revised_section
                .clone()
                .or_else(|| self.original.section_ref.clone()),
            value: self.revised_value.clone(),
            confidence: self.revised_confidence,
            reasoning: self.notes.clone(),
            match_basis: self.original.match_basis,
        }
    }
}

/// Prompt version identifier, rendered as `major.minor` ("1.0", "1.1", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId {
    pub major: u32,
    pub minor: u32,
}

impl VersionId {
    pub const ROOT: VersionId = VersionId { major: 1, minor: 0 };

    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for VersionId {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| ExtractionError::UnknownPromptVersion(s.to_string()))?;
        let major = major
            .parse()
            .map_err(|_| ExtractionError::UnknownPromptVersion(s.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| ExtractionError::UnknownPromptVersion(s.to_string()))?;
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for VersionId {
    type Error = ExtractionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionId> for String {
    fn from(value: VersionId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptVersion {
    pub version_id: VersionId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub parent_version_id: Option<VersionId>,
    /// Improvement suggestions that produced this version.
    #[serde(default)]
    pub changes: Vec<String>,
    /// Evaluation score that triggered the evolution.
    #[serde(default)]
    pub trigger_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    #[schemars(description = "Important template fields were not matched")]
    Coverage,

    #[schemars(description = "Confidence scores are not justified by the evidence")]
    Confidence,

    #[schemars(description = "Reasoning is vague, missing or wrong")]
    Reasoning,

    #[schemars(description = "The matched value does not mean what the field asks for")]
    SemanticAccuracy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct EvaluationIssue {
    pub category: IssueCategory,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationReport {
    pub prompt_version_id: VersionId,
    pub overall_score: f64,
    pub issues: Vec<EvaluationIssue>,
    pub improvement_suggestions: Vec<String>,
    pub evolved: bool,
    /// Diagnostic only; never feeds a decision.
    pub effectiveness: f64,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationReport {
    pub fn issue_count(&self, category: IssueCategory) -> usize {
        self.issues.iter().filter(|i| i.category == category).count()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GapCategory {
    /// The oracle never produced a value.
    Missing,
    /// A value exists but stayed below threshold after audit.
    LowConfidence,
    /// The audit re-query itself timed out or came back malformed.
    AuditFailed,
    /// The whole document failed before analysis.
    DocumentFailed,
}

impl GapCategory {
    /// Same spelling as the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            GapCategory::Missing => "missing",
            GapCategory::LowConfidence => "low_confidence",
            GapCategory::AuditFailed => "audit_failed",
            GapCategory::DocumentFailed => "document_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GapRecord {
    pub field_id: String,
    pub severity: Severity,
    pub category: GapCategory,
    pub suggested_question: String,
}
