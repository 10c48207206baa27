//! # Adaptive Extraction
//!
//! A library for pulling structured field values out of parsed technical
//! documents with an external reasoning service (the *oracle*), and for
//! improving the instructions it is given over time.
//!
//! ## Core Concepts
//!
//! - **Template Catalog**: the fields to extract, with synonyms, expected kind and severity
//! - **Match Pass**: one oracle call proposing a value, source section and confidence per field
//! - **Triage**: confidence at or above the threshold is approved, everything else goes to review
//! - **Audit**: a narrow single-field re-query for each review item
//! - **Gap Analysis**: every field without an accepted value becomes a gap with a clarifying question
//! - **Prompt Evolution**: the oracle scores its own pass; low scores rewrite the prompt as a new
//!   version in an append-only ledger shared by all documents
//!
//! ## Example
//!
//! ```rust,ignore
//! use adaptive_extraction::*;
//! use std::sync::Arc;
//!
//! let settings = OracleSettings::from_env()?;
//! let oracle = Arc::new(ChatCompletionsClient::new(settings)?);
//!
//! let pipeline = ExtractionPipeline::new(
//!     oracle,
//!     TemplateCatalog::hardware_overview()?,
//!     RunConfig::default(),
//!     PromptLedger::with_seed_prompt(),
//! )?;
//!
//! let document = SourceDocument::from_pairs(
//!     "nexus-9364c-h1",
//!     vec![(Some("Physical Specifications"), "Width: 17.41 inches (44.23 cm) ...")],
//! );
//!
//! let report = pipeline.run_document(&document, None).await?;
//! println!("{}", report.coverage.to_markdown());
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod evolution;
pub mod gaps;
pub mod llm;
pub mod pipeline;
pub mod schema;
pub mod triage;
pub mod utils;

pub use catalog::TemplateCatalog;
pub use config::{RunConfig, TokenPricing};
pub use error::{ExtractionError, Result};
pub use evolution::{
    decide, effectiveness, EffectivenessInputs, EvolutionDecision, PromptLedger,
};
pub use gaps::{analyze, clarifying_question, CoverageReport, GapSummary};
pub use llm::*;
pub use pipeline::{DocumentReport, DocumentStatus, ExtractionPipeline, ExtractionReport};
pub use schema::*;
pub use triage::{triage, TriageStats};
