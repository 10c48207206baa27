//! Prompt version ledger and the evolution decision rules.
//!
//! The ledger is the only state shared between concurrently running
//! documents. It is append-only: versions are never removed or rewritten, and
//! the single way to add one is [`PromptLedger::commit`], an optimistic
//! compare-and-append against the current tip.

use crate::error::{ExtractionError, Result};
use crate::llm::prompts::SEED_MATCHING_PROMPT;
use crate::schema::{Confidence, EvaluationReport, PromptVersion, VersionId};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerState {
    versions: Vec<PromptVersion>,
    evaluations: Vec<EvaluationReport>,
}

/// Cloneable handle over the process-wide prompt history.
#[derive(Debug, Clone)]
pub struct PromptLedger {
    inner: Arc<RwLock<LedgerState>>,
}

impl PromptLedger {
    /// A ledger whose root ("1.0") holds `seed_text`.
    pub fn new(seed_text: impl Into<String>) -> Self {
        let root = PromptVersion {
            version_id: VersionId::ROOT,
            text: seed_text.into(),
            created_at: Utc::now(),
            parent_version_id: None,
            changes: Vec::new(),
            trigger_score: None,
        };
        Self {
            inner: Arc::new(RwLock::new(LedgerState {
                versions: vec![root],
                evaluations: Vec::new(),
            })),
        }
    }

    pub fn with_seed_prompt() -> Self {
        Self::new(SEED_MATCHING_PROMPT)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerState>> {
        self.inner.read().map_err(|_| ExtractionError::LedgerPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerState>> {
        self.inner.write().map_err(|_| ExtractionError::LedgerPoisoned)
    }

    /// The version new runs use unless a caller pins another one.
    pub fn tip(&self) -> Result<PromptVersion> {
        let state = self.read()?;
        state
            .versions
            .last()
            .cloned()
            .ok_or_else(|| ExtractionError::UnknownPromptVersion("<empty ledger>".to_string()))
    }

    pub fn get(&self, id: VersionId) -> Result<PromptVersion> {
        let state = self.read()?;
        state
            .versions
            .iter()
            .find(|v| v.version_id == id)
            .cloned()
            .ok_or_else(|| ExtractionError::UnknownPromptVersion(id.to_string()))
    }

    /// The pinned version if one is given, otherwise the tip.
    pub fn resolve(&self, pin: Option<VersionId>) -> Result<PromptVersion> {
        match pin {
            Some(id) => self.get(id),
            None => self.tip(),
        }
    }

    pub fn versions(&self) -> Result<Vec<PromptVersion>> {
        Ok(self.read()?.versions.clone())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.versions.len())
    }

    pub fn evaluations(&self) -> Result<Vec<EvaluationReport>> {
        Ok(self.read()?.evaluations.clone())
    }

    pub fn record_evaluation(&self, report: EvaluationReport) -> Result<()> {
        debug!(
            "Recording evaluation for prompt {}: score {:.1}, evolved {}",
            report.prompt_version_id, report.overall_score, report.evolved
        );
        self.write()?.evaluations.push(report);
        Ok(())
    }

    /// Appends a child of `expected_parent`, which must still be the tip.
    ///
    /// Fails with `EvolutionConflict` when another writer committed first;
    /// the caller is expected to rebase on the new tip and retry.
    pub fn commit(
        &self,
        expected_parent: VersionId,
        text: impl Into<String>,
        changes: Vec<String>,
        trigger_score: Option<f64>,
    ) -> Result<PromptVersion> {
        let mut state = self.write()?;
        let tip = state
            .versions
            .last()
            .map(|v| v.version_id)
            .ok_or_else(|| ExtractionError::UnknownPromptVersion("<empty ledger>".to_string()))?;

        if tip != expected_parent {
            warn!(
                "Prompt commit rejected: expected tip {}, ledger is at {}",
                expected_parent, tip
            );
            return Err(ExtractionError::EvolutionConflict {
                expected: expected_parent.to_string(),
                actual: tip.to_string(),
            });
        }

        let version = PromptVersion {
            version_id: tip.next(),
            text: text.into(),
            created_at: Utc::now(),
            parent_version_id: Some(tip),
            changes,
            trigger_score,
        };
        state.versions.push(version.clone());
        info!("Prompt evolved {} -> {}", tip, version.version_id);
        Ok(version)
    }

    /// True iff the last evolution was followed by a better evaluation score.
    ///
    /// Compares the score that triggered the most recent evolution with the
    /// first evaluation recorded against the version it produced.
    pub fn evolution_improved(&self) -> Result<bool> {
        self.evolution_improved_with(None)
    }

    /// Like [`evolution_improved`](Self::evolution_improved), counting a not yet
    /// recorded evaluation of `pending.0` with score `pending.1`.
    pub fn evolution_improved_with(&self, pending: Option<(VersionId, f64)>) -> Result<bool> {
        let state = self.read()?;
        let Some(latest) = state
            .versions
            .iter()
            .rev()
            .find(|v| v.parent_version_id.is_some())
        else {
            return Ok(false);
        };
        let Some(before) = latest.trigger_score else {
            return Ok(false);
        };
        let after = state
            .evaluations
            .iter()
            .find(|e| e.prompt_version_id == latest.version_id)
            .map(|e| e.overall_score)
            .or_else(|| {
                pending
                    .filter(|(id, _)| *id == latest.version_id)
                    .map(|(_, score)| score)
            });

        Ok(after.is_some_and(|after| after > before))
    }

    /// Mean evaluation score per prompt version, in version order.
    pub fn trend(&self) -> Result<Vec<(VersionId, f64, usize)>> {
        let state = self.read()?;
        let mut sums: HashMap<VersionId, (f64, usize)> = HashMap::new();
        for eval in &state.evaluations {
            let entry = sums.entry(eval.prompt_version_id).or_insert((0.0, 0));
            entry.0 += eval.overall_score;
            entry.1 += 1;
        }

        let mut trend: Vec<(VersionId, f64, usize)> = sums
            .into_iter()
            .map(|(id, (sum, n))| (id, sum / n as f64, n))
            .collect();
        trend.sort_by_key(|(id, _, _)| *id);
        Ok(trend)
    }

    /// Checks the chain: one root, every parent exists and is older, ids strictly increase.
    pub fn verify(&self) -> Result<()> {
        let state = self.read()?;
        verify_chain(&state.versions)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = {
            let state = self.read()?;
            serde_json::to_string_pretty(&*state)?
        };
        std::fs::write(path.as_ref(), json)?;
        debug!("Saved prompt history to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let state: LedgerState = serde_json::from_str(&json)?;
        verify_chain(&state.versions)?;
        info!(
            "Loaded prompt history from {} ({} versions, {} evaluations)",
            path.as_ref().display(),
            state.versions.len(),
            state.evaluations.len()
        );
        Ok(Self {
            inner: Arc::new(RwLock::new(state)),
        })
    }
}

fn verify_chain(versions: &[PromptVersion]) -> Result<()> {
    let invalid = |msg: String| ExtractionError::ConfigurationError(msg);

    let roots = versions.iter().filter(|v| v.parent_version_id.is_none()).count();
    if roots != 1 {
        return Err(invalid(format!("Prompt history has {} roots", roots)));
    }
    if versions[0].parent_version_id.is_some() {
        return Err(invalid("Prompt history does not start at its root".to_string()));
    }

    let mut seen = HashSet::new();
    let mut previous: Option<VersionId> = None;
    for version in versions {
        if let Some(prev) = previous {
            if version.version_id <= prev {
                return Err(invalid(format!(
                    "Prompt version {} is not newer than {}",
                    version.version_id, prev
                )));
            }
        }
        if let Some(parent) = version.parent_version_id {
            // parents must already be in the chain, which also rules out cycles
            if !seen.contains(&parent) {
                return Err(invalid(format!(
                    "Prompt version {} has unknown parent {}",
                    version.version_id, parent
                )));
            }
        }
        seen.insert(version.version_id);
        previous = Some(version.version_id);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum EvolutionDecision {
    Stay,
    Evolve { reason: String },
}

impl EvolutionDecision {
    pub fn should_evolve(&self) -> bool {
        matches!(self, EvolutionDecision::Evolve { .. })
    }
}

/// DECIDE step: evolve on a low score or on too many reported issues.
pub fn decide(
    report: &EvaluationReport,
    evolution_threshold: Confidence,
    max_issue_count: usize,
) -> EvolutionDecision {
    if report.overall_score < f64::from(evolution_threshold) {
        return EvolutionDecision::Evolve {
            reason: format!(
                "overall score {:.1} below evolution threshold {}",
                report.overall_score, evolution_threshold
            ),
        };
    }
    if report.issues.len() > max_issue_count {
        return EvolutionDecision::Evolve {
            reason: format!(
                "{} issues reported, bound is {}",
                report.issues.len(),
                max_issue_count
            ),
        };
    }
    EvolutionDecision::Stay
}

/// Inputs of the diagnostic effectiveness score, each in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectivenessInputs {
    pub coverage_ratio: f64,
    pub match_quality: f64,
    pub overall_score: f64,
    pub evolution_improved: bool,
}

/// `0.30*coverage + 0.25*quality + 0.25*(score/100) + 0.20*indicator`, rounded to 3 places.
pub fn effectiveness(inputs: EffectivenessInputs) -> f64 {
    let indicator = if inputs.evolution_improved { 1.0 } else { 0.0 };
    let value = 0.30 * inputs.coverage_ratio.clamp(0.0, 1.0)
        + 0.25 * inputs.match_quality.clamp(0.0, 1.0)
        + 0.25 * (inputs.overall_score / 100.0).clamp(0.0, 1.0)
        + 0.20 * indicator;
    (value * 1000.0).round() / 1000.0
}
