use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Oracle call timed out after {0} seconds")]
    OracleTimeout(u64),

    #[error("Oracle returned malformed output: {0}")]
    OracleMalformedOutput(String),

    #[error("Oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Evolution conflict: expected tip {expected}, found {actual}")]
    EvolutionConflict { expected: String, actual: String },

    #[error("Unknown prompt version: {0}")]
    UnknownPromptVersion(String),

    #[error("Prompt ledger lock poisoned")]
    LedgerPoisoned,

    #[error("Document processing cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "openai")]
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl ExtractionError {
    /// Field-scoped failures are absorbed by the stage that hit them.
    pub fn is_field_scoped(&self) -> bool {
        matches!(
            self,
            ExtractionError::OracleTimeout(_) | ExtractionError::OracleMalformedOutput(_)
        )
    }

    /// Short machine-readable category used in failed-document reports.
    pub fn category(&self) -> &'static str {
        match self {
            ExtractionError::OracleTimeout(_) => "oracle_timeout",
            ExtractionError::OracleMalformedOutput(_) => "oracle_malformed_output",
            ExtractionError::OracleUnavailable(_) => "oracle_unavailable",
            ExtractionError::ConfigurationError(_) => "configuration_error",
            ExtractionError::EvolutionConflict { .. } => "evolution_conflict",
            ExtractionError::UnknownPromptVersion(_) => "unknown_prompt_version",
            ExtractionError::LedgerPoisoned => "ledger_poisoned",
            ExtractionError::Cancelled => "cancelled",
            ExtractionError::SerializationError(_) => "serialization_error",
            ExtractionError::IoError(_) => "io_error",
            #[cfg(feature = "openai")]
            ExtractionError::HttpError(_) => "http_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtractionError>;
