//! Per-document orchestration: match, triage, audit, gap analysis, then the
//! self-evaluation cycle.
//!
//! Every document runs as an independent chain of stages. The only state two
//! documents share is the [`PromptLedger`]; everything else a run produces is
//! owned by its [`DocumentReport`] and discarded if the run is cancelled.

use crate::catalog::TemplateCatalog;
use crate::config::RunConfig;
use crate::error::{ExtractionError, Result};
use crate::evolution::{EvolutionDecision, PromptLedger};
use crate::gaps::{analyze, CoverageReport};
use crate::llm::{
    Auditor, FieldExtractor, Oracle, OracleCaller, OracleUsage, PipelineEvent,
    SelfEvaluator, UnmatchedField,
};
use crate::schema::{
    AuditOutcome, EvaluationReport, MatchCandidate, PromptVersion, SourceDocument, TriageResult,
    VersionId,
};
use crate::triage::{triage, TriageStats};
use futures::stream::{self, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentStatus {
    Completed,
    Failed { category: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionReport {
    pub candidates: Vec<MatchCandidate>,
    pub unmatched: Vec<UnmatchedField>,
    pub triage: TriageResult,
    pub audited: Vec<AuditOutcome>,
}

impl ExtractionReport {
    fn empty(threshold: u8) -> Self {
        Self {
            candidates: Vec::new(),
            unmatched: Vec::new(),
            triage: TriageResult {
                approved: Vec::new(),
                review: Vec::new(),
                bypassed: Vec::new(),
                threshold,
            },
            audited: Vec::new(),
        }
    }

    /// Final accepted values: everything approved by triage plus every item the
    /// audit confirmed or corrected.
    pub fn accepted(&self) -> Vec<MatchCandidate> {
        self.triage
            .approved
            .iter()
            .cloned()
            .chain(
                self.audited
                    .iter()
                    .filter(|a| a.is_success())
                    .map(AuditOutcome::resolved_candidate),
            )
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentReport {
    pub document_id: String,
    pub prompt_version_id: VersionId,
    #[serde(flatten)]
    pub status: DocumentStatus,
    pub extraction: ExtractionReport,
    pub coverage: CoverageReport,
    pub evaluation: Option<EvaluationReport>,
    pub decision: EvolutionDecision,
    /// Version committed by this run's evolution, if any.
    pub evolved_to: Option<VersionId>,
    /// The run produced a rewrite but lost every commit attempt to other documents.
    #[serde(default)]
    pub evolution_conflict: bool,
    pub stats: TriageStats,
    pub usage: OracleUsage,
}

impl DocumentReport {
    pub fn is_completed(&self) -> bool {
        self.status == DocumentStatus::Completed
    }

    fn failed(
        document_id: &str,
        prompt_version_id: VersionId,
        catalog: &TemplateCatalog,
        threshold: u8,
        error: &ExtractionError,
        usage: OracleUsage,
    ) -> Self {
        let category = error.category().to_string();
        let message = error.to_string();
        let extraction = ExtractionReport::empty(threshold);
        let stats = TriageStats::from_result(&extraction.triage);

        Self {
            document_id: document_id.to_string(),
            prompt_version_id,
            coverage: CoverageReport::failed(catalog.len(), &category, &message),
            status: DocumentStatus::Failed { category, message },
            extraction,
            evaluation: None,
            decision: EvolutionDecision::Stay,
            evolved_to: None,
            evolution_conflict: false,
            stats,
            usage,
        }
    }
}

/// Runs documents through the extraction stages against one catalog and one
/// prompt ledger.
#[derive(Clone)]
pub struct ExtractionPipeline {
    oracle: Arc<dyn Oracle>,
    catalog: Arc<TemplateCatalog>,
    config: RunConfig,
    ledger: PromptLedger,
    progress: Option<Sender<PipelineEvent>>,
}

impl ExtractionPipeline {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        catalog: TemplateCatalog,
        config: RunConfig,
        ledger: PromptLedger,
    ) -> Result<Self> {
        config.validate()?;
        if catalog.is_empty() {
            return Err(ExtractionError::ConfigurationError(
                "Template catalog has no fields".to_string(),
            ));
        }
        ledger.verify()?;

        info!(
            "Pipeline ready: catalog '{}' ({} fields), threshold {}, evolution threshold {}",
            catalog.name,
            catalog.len(),
            config.confidence_threshold,
            config.evolution_threshold
        );

        Ok(Self {
            oracle,
            catalog: Arc::new(catalog),
            config,
            ledger,
            progress: None,
        })
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Sender<PipelineEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn ledger(&self) -> &PromptLedger {
        &self.ledger
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Processes one document with the tip prompt, or with `pin` when given.
    ///
    /// An unreachable oracle fails the document, not the call: the returned
    /// report has status `failed`, coverage 0 and a single document-level gap.
    /// Errors are returned only for an unknown pin or a poisoned ledger.
    pub async fn run_document(
        &self,
        document: &SourceDocument,
        pin: Option<VersionId>,
    ) -> Result<DocumentReport> {
        let prompt = self.ledger.resolve(pin)?;
        let caller = OracleCaller::new(self.oracle.clone(), self.config.oracle_timeout())
            .with_pricing(self.config.token_pricing)
            .with_progress(self.progress.clone());

        caller
            .send_event(PipelineEvent::Starting {
                document_id: document.id.clone(),
                prompt_version_id: prompt.version_id,
            })
            .await;
        info!(
            "Processing document '{}' ({} sections) with prompt {}",
            document.id,
            document.sections.len(),
            prompt.version_id
        );

        match self.process(document, &prompt, &caller).await {
            Ok(report) => {
                caller
                    .send_event(PipelineEvent::Completed {
                        document_id: document.id.clone(),
                    })
                    .await;
                Ok(report)
            }
            Err(e @ ExtractionError::OracleUnavailable(_)) => {
                warn!("Document '{}' failed: {}", document.id, e);
                caller
                    .send_event(PipelineEvent::Failed {
                        document_id: document.id.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                Ok(DocumentReport::failed(
                    &document.id,
                    prompt.version_id,
                    &self.catalog,
                    self.config.confidence_threshold,
                    &e,
                    caller.usage(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`run_document`](Self::run_document), abandoned as soon as `cancel`
    /// completes. Cancellation discards every partial result and returns
    /// `Cancelled`.
    pub async fn run_document_until<F>(
        &self,
        document: &SourceDocument,
        pin: Option<VersionId>,
        cancel: F,
    ) -> Result<DocumentReport>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                info!("Document '{}' cancelled", document.id);
                Err(ExtractionError::Cancelled)
            }
            result = self.run_document(document, pin) => result,
        }
    }

    /// Runs documents with at most `workers` in flight, each against the tip
    /// prompt at the time it starts. Results keep the input order.
    pub async fn run_batch(
        &self,
        documents: &[SourceDocument],
        workers: usize,
    ) -> Vec<Result<DocumentReport>> {
        info!(
            "Processing batch of {} documents with {} workers",
            documents.len(),
            workers.max(1)
        );
        stream::iter(documents)
            .map(|document| self.run_document(document, None))
            .buffered(workers.max(1))
            .collect()
            .await
    }

    async fn process(
        &self,
        document: &SourceDocument,
        prompt: &PromptVersion,
        caller: &OracleCaller,
    ) -> Result<DocumentReport> {
        let catalog = self.catalog.as_ref();
        let sections = &document.sections;

        caller.send_event(PipelineEvent::Matching).await;
        let extractor = FieldExtractor::new(caller.clone(), self.config.content_preview_chars);
        let pass = extractor.match_fields(sections, catalog, prompt).await?;

        let triaged = triage(catalog, &pass.candidates, self.config.confidence_threshold);
        caller
            .send_event(PipelineEvent::Triaged {
                approved: triaged.approved.len(),
                review: triaged.review.len(),
            })
            .await;

        let auditor = Auditor::new(caller.clone(), &self.config);
        let audited = auditor.audit(&triaged.review, sections, catalog).await?;

        let coverage = analyze(catalog, &triaged, &audited);
        caller
            .send_event(PipelineEvent::Analyzed {
                coverage_percent: coverage.coverage_percent,
            })
            .await;

        let evaluator = SelfEvaluator::new(caller.clone(), &self.config);
        let review = evaluator
            .review(&pass, catalog, sections.len(), &self.ledger)
            .await?;

        let stats = TriageStats::from_result(&triaged);
        Ok(DocumentReport {
            document_id: document.id.clone(),
            prompt_version_id: pass.prompt_version_id,
            status: DocumentStatus::Completed,
            extraction: ExtractionReport {
                candidates: pass.candidates,
                unmatched: pass.unmatched,
                triage: triaged,
                audited,
            },
            coverage,
            evaluation: review.evaluation,
            decision: review.decision,
            evolved_to: review.evolved_to,
            evolution_conflict: review.evolution_conflict,
            stats,
            usage: caller.usage(),
        })
    }
}
