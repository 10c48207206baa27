use crate::catalog::TemplateCatalog;
use crate::config::RunConfig;
use crate::error::{ExtractionError, Result};
use crate::evolution::{decide, effectiveness, EffectivenessInputs, EvolutionDecision, PromptLedger};
use crate::llm::client::OracleCaller;
use crate::llm::extractor::MatchPass;
use crate::llm::prompts::{
    evaluation_user_prompt, evolution_user_prompt, response_schema, SYSTEM_PROMPT_EVALUATION,
    SYSTEM_PROMPT_EVOLUTION,
};
use crate::llm::types::{
    EvaluationResponse, EvolutionResponse, OraclePurpose, OracleRequest, PipelineEvent,
};
use crate::schema::{Confidence, EvaluationIssue, EvaluationReport, PromptVersion, VersionId};
use crate::utils::{clean_json_output, is_valid_string, sanitize_string};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// What the evaluate/decide/evolve cycle did after one matching pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelfReview {
    /// `None` when the self-critique timed out or came back malformed twice.
    pub evaluation: Option<EvaluationReport>,
    pub decision: EvolutionDecision,
    pub evolved_to: Option<VersionId>,
    /// Set when a rewrite was produced but every commit lost to another
    /// document; the rewrite is not in the ledger.
    pub evolution_conflict: bool,
}

/// Lets the oracle critique its own matching pass and rewrite the prompt.
#[derive(Clone)]
pub struct SelfEvaluator {
    caller: OracleCaller,
    evolution_threshold: Confidence,
    max_issue_count: usize,
    max_commit_attempts: usize,
}

impl SelfEvaluator {
    pub fn new(caller: OracleCaller, config: &RunConfig) -> Self {
        Self {
            caller,
            evolution_threshold: config.evolution_threshold,
            max_issue_count: config.max_issue_count,
            max_commit_attempts: config.max_commit_attempts,
        }
    }

    /// EVALUATE, DECIDE and, when needed, EVOLVE. The report is always logged
    /// to the ledger so that trends can be tracked.
    pub async fn review(
        &self,
        pass: &MatchPass,
        catalog: &TemplateCatalog,
        section_count: usize,
        ledger: &PromptLedger,
    ) -> Result<SelfReview> {
        let Some(mut report) = self.evaluate(pass, catalog, section_count, ledger).await? else {
            return Ok(SelfReview {
                evaluation: None,
                decision: EvolutionDecision::Stay,
                evolved_to: None,
                evolution_conflict: false,
            });
        };

        let decision = decide(&report, self.evolution_threshold, self.max_issue_count);
        let mut evolution_conflict = false;
        let evolved_to = match &decision {
            EvolutionDecision::Stay => None,
            EvolutionDecision::Evolve { reason } => {
                info!("Evolving prompt {}: {}", report.prompt_version_id, reason);
                match self.evolve(&report, ledger).await {
                    Ok(version) => version.map(|v| v.version_id),
                    Err(ExtractionError::EvolutionConflict { expected, actual }) => {
                        warn!(
                            "Giving up on evolution after {} attempts (expected {}, tip {})",
                            self.max_commit_attempts, expected, actual
                        );
                        evolution_conflict = true;
                        None
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        report.evolved = evolved_to.is_some();
        ledger.record_evaluation(report.clone())?;

        Ok(SelfReview {
            evaluation: Some(report),
            decision,
            evolved_to,
            evolution_conflict,
        })
    }

    /// Asks the oracle to score the pass. Returns `None` when the critique could
    /// not be obtained after one retry.
    pub async fn evaluate(
        &self,
        pass: &MatchPass,
        catalog: &TemplateCatalog,
        section_count: usize,
        ledger: &PromptLedger,
    ) -> Result<Option<EvaluationReport>> {
        self.caller.send_event(PipelineEvent::Evaluating).await;

        let request = OracleRequest::new(
            OraclePurpose::Evaluate,
            SYSTEM_PROMPT_EVALUATION,
            evaluation_user_prompt(
                &pass.candidates,
                catalog,
                section_count,
                &response_schema::<EvaluationResponse>(),
            ),
        );

        let response = match self.caller.call_parsed(&request, parse_evaluation).await {
            Ok(response) => response,
            Err(e) if e.is_field_scoped() => {
                warn!(
                    "Self-evaluation of prompt {} failed, skipping evolution: {}",
                    pass.prompt_version_id, e
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let coverage_ratio = pass.candidates.len() as f64 / catalog.len().max(1) as f64;
        let match_quality = if pass.candidates.is_empty() {
            0.0
        } else {
            pass.candidates
                .iter()
                .map(|c| f64::from(c.confidence) / 100.0)
                .sum::<f64>()
                / pass.candidates.len() as f64
        };
        let evolution_improved = ledger
            .evolution_improved_with(Some((pass.prompt_version_id, response.overall_score)))?;

        let report = EvaluationReport {
            prompt_version_id: pass.prompt_version_id,
            overall_score: response.overall_score,
            issues: response.issues,
            improvement_suggestions: response.improvement_suggestions,
            evolved: false,
            effectiveness: effectiveness(EffectivenessInputs {
                coverage_ratio,
                match_quality,
                overall_score: response.overall_score,
                evolution_improved,
            }),
            evaluated_at: Utc::now(),
        };

        info!(
            "Prompt {} scored {:.1} with {} issues (effectiveness {:.3})",
            report.prompt_version_id,
            report.overall_score,
            report.issues.len(),
            report.effectiveness
        );
        Ok(Some(report))
    }

    /// Rewrites the tip prompt and commits it as the next version.
    ///
    /// Always forks from the current tip. If another document commits first,
    /// the rewrite is requested again from the new tip, up to
    /// `max_commit_attempts` times. A rewrite that fails or comes back blank
    /// returns `Ok(None)`.
    pub async fn evolve(
        &self,
        report: &EvaluationReport,
        ledger: &PromptLedger,
    ) -> Result<Option<PromptVersion>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let tip = ledger.tip()?;
            let request = OracleRequest::new(
                OraclePurpose::Evolve,
                SYSTEM_PROMPT_EVOLUTION,
                evolution_user_prompt(
                    &tip.text,
                    report.overall_score,
                    &report.issues,
                    &report.improvement_suggestions,
                ),
            );

            let text = match self.caller.call_parsed(&request, parse_evolution).await {
                Ok(text) => text,
                Err(e) if e.is_field_scoped() => {
                    warn!("Prompt rewrite discarded, staying on {}: {}", tip.version_id, e);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            match ledger.commit(
                tip.version_id,
                text,
                report.improvement_suggestions.clone(),
                Some(report.overall_score),
            ) {
                Ok(version) => {
                    self.caller
                        .send_event(PipelineEvent::Evolved {
                            from: tip.version_id,
                            to: version.version_id,
                        })
                        .await;
                    return Ok(Some(version));
                }
                Err(ExtractionError::EvolutionConflict { actual, .. })
                    if attempt < self.max_commit_attempts =>
                {
                    info!(
                        "Tip moved to {} while rewriting {}, rebasing (attempt {})",
                        actual, tip.version_id, attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn parse_evaluation(text: &str) -> Result<EvaluationResponse> {
    let mut response: EvaluationResponse = serde_json::from_str(&clean_json_output(text))
        .map_err(|e| {
            ExtractionError::OracleMalformedOutput(format!(
                "Evaluation does not match schema: {}",
                e
            ))
        })?;

    if !response.overall_score.is_finite() || !(0.0..=100.0).contains(&response.overall_score) {
        return Err(ExtractionError::OracleMalformedOutput(format!(
            "Overall score {} is outside [0, 100]",
            response.overall_score
        )));
    }

    response.issues = response
        .issues
        .into_iter()
        .map(|i| EvaluationIssue {
            category: i.category,
            description: sanitize_string(&i.description),
        })
        .filter(|i| is_valid_string(&i.description))
        .collect();
    response.improvement_suggestions = response
        .improvement_suggestions
        .iter()
        .map(|s| sanitize_string(s))
        .filter(|s| is_valid_string(s))
        .collect();

    Ok(response)
}

fn parse_evolution(text: &str) -> Result<String> {
    let response: EvolutionResponse = serde_json::from_str(&clean_json_output(text))
        .map_err(|e| {
            ExtractionError::OracleMalformedOutput(format!("Rewrite does not match schema: {}", e))
        })?;

    let prompt = response.prompt_text.trim();
    if !is_valid_string(prompt) {
        return Err(ExtractionError::OracleMalformedOutput(
            "Rewritten prompt is blank".to_string(),
        ));
    }
    Ok(prompt.to_string())
}
