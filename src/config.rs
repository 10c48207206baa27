use crate::error::{ExtractionError, Result};
use crate::schema::{Confidence, MAX_CONFIDENCE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-process run configuration.
///
/// Every threshold is an integer percentage in `0..=100`; `validate` is run
/// once at startup, before any document is processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Candidates at or above this confidence are auto-approved.
    pub confidence_threshold: Confidence,
    /// Self-evaluation scores below this trigger prompt evolution.
    pub evolution_threshold: Confidence,
    /// Confidence assigned to items that pass the audit re-query.
    pub audit_confidence: Confidence,
    /// Evolution also triggers when the self-critique lists more issues than this.
    pub max_issue_count: usize,
    /// Bounded wait for a single oracle call.
    pub oracle_timeout_secs: u64,
    /// Attempts to commit an evolved prompt before giving up on a conflict.
    pub max_commit_attempts: usize,
    /// Characters of each section body shown to the oracle during matching.
    pub content_preview_chars: usize,
    /// Characters of context kept on each side of a located value during audit.
    pub audit_snippet_radius: usize,
    /// Token prices for the spend estimate in usage reports; no estimate when unset.
    pub token_pricing: Option<TokenPricing>,
}

/// USD per 1,000 tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TokenPricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl TokenPricing {
    pub const GPT_4O_MINI: TokenPricing = TokenPricing {
        prompt_per_1k: 0.00015,
        completion_per_1k: 0.0006,
    };

    pub fn cost_usd(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.prompt_per_1k
            + completion_tokens as f64 / 1000.0 * self.completion_per_1k
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 90,
            evolution_threshold: 60,
            audit_confidence: 95,
            max_issue_count: 8,
            oracle_timeout_secs: 60,
            max_commit_attempts: 3,
            content_preview_chars: 200,
            audit_snippet_radius: 200,
            token_pricing: None,
        }
    }
}

impl RunConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            ExtractionError::ConfigurationError(format!("Invalid run configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_percentage("confidence_threshold", self.confidence_threshold)?;
        validate_percentage("evolution_threshold", self.evolution_threshold)?;
        validate_percentage("audit_confidence", self.audit_confidence)?;

        if self.oracle_timeout_secs == 0 {
            return Err(ExtractionError::ConfigurationError(
                "oracle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_commit_attempts == 0 {
            return Err(ExtractionError::ConfigurationError(
                "max_commit_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(pricing) = &self.token_pricing {
            let valid = |p: f64| p.is_finite() && p >= 0.0;
            if !valid(pricing.prompt_per_1k) || !valid(pricing.completion_per_1k) {
                return Err(ExtractionError::ConfigurationError(
                    "token_pricing must be finite and non-negative".to_string(),
                ));
            }
        }
        if self.content_preview_chars == 0 {
            return Err(ExtractionError::ConfigurationError(
                "content_preview_chars must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }
}

fn validate_percentage(name: &str, value: Confidence) -> Result<()> {
    if value > MAX_CONFIDENCE {
        return Err(ExtractionError::ConfigurationError(format!(
            "{} = {} is outside [0, 100]",
            name, value
        )));
    }
    Ok(())
}
