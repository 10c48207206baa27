use adaptive_extraction::*;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Barrier};

/// In-memory oracle: scripted replies per stage, then a per-stage default.
struct MockOracle {
    scripted: Mutex<HashMap<OraclePurpose, VecDeque<std::result::Result<OracleReply, OracleError>>>>,
    defaults: HashMap<OraclePurpose, String>,
    requests: Mutex<Vec<OracleRequest>>,
    evolve_gate: Option<Arc<Barrier>>,
    evolve_calls: AtomicUsize,
}

impl MockOracle {
    fn new() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            defaults: HashMap::new(),
            requests: Mutex::new(Vec::new()),
            evolve_gate: None,
            evolve_calls: AtomicUsize::new(0),
        }
    }

    fn script(self, purpose: OraclePurpose, reply: impl Into<String>) -> Self {
        self.script_result(purpose, Ok(OracleReply::text(reply)))
    }

    fn script_result(
        self,
        purpose: OraclePurpose,
        reply: std::result::Result<OracleReply, OracleError>,
    ) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push_back(reply);
        self
    }

    fn default_reply(mut self, purpose: OraclePurpose, reply: impl Into<String>) -> Self {
        self.defaults.insert(purpose, reply.into());
        self
    }

    /// The first `n` evolve calls wait for each other before answering.
    fn gate_evolutions(mut self, n: usize) -> Self {
        self.evolve_gate = Some(Arc::new(Barrier::new(n)));
        self
    }

    fn requests_for(&self, purpose: OraclePurpose) -> Vec<OracleRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.purpose == purpose)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Oracle for MockOracle {
    async fn complete(
        &self,
        request: &OracleRequest,
    ) -> std::result::Result<OracleReply, OracleError> {
        self.requests.lock().unwrap().push(request.clone());

        if request.purpose == OraclePurpose::Evolve {
            let n = self.evolve_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.evolve_gate {
                if n < 2 {
                    gate.wait().await;
                }
            }
        }

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&request.purpose)
            .and_then(|q| q.pop_front());
        if let Some(reply) = scripted {
            return reply;
        }
        match self.defaults.get(&request.purpose) {
            Some(text) => Ok(OracleReply::text(text.clone())),
            None => Err(OracleError::Unavailable(format!(
                "no reply scripted for {:?}",
                request.purpose
            ))),
        }
    }
}

fn hardware_document(id: &str) -> SourceDocument {
    SourceDocument::from_pairs(
        id,
        vec![
            (
                Some("Overview"),
                "The Cisco Nexus 9364C-H1 switch (N9K-C9364C-H1) is a 2RU switch with 64 100-Gigabit QSFP ports.",
            ),
            (
                Some("Physical Specifications"),
                "Width 17.41 inches (44.23 cm). Depth 22.27 inches (56.58 cm). Height 3.4 inches (8.6 cm).",
            ),
            (
                Some("Environmental Specifications"),
                "Operating temperature 32 to 104 F. Relative humidity 5 to 95 percent.",
            ),
        ],
    )
}

/// A matching reply with one entry per `(field_id, confidence)`.
fn match_reply(entries: &[(&str, u8)]) -> String {
    let matches: Vec<serde_json::Value> = entries
        .iter()
        .map(|(field_id, confidence)| {
            json!({
                "field_id": field_id,
                "value": format!("value of {}", field_id),
                "section": 0,
                "confidence": confidence,
                "reasoning": format!("{} is stated in the overview", field_id),
                "match_basis": "exact",
            })
        })
        .collect();
    json!({ "matches": matches }).to_string()
}

fn evaluation_reply(score: u8) -> String {
    json!({
        "overall_score": score,
        "issues": [{"category": "confidence", "description": "one value below threshold"}],
        "improvement_suggestions": ["Quote the exact table row for every value"],
    })
    .to_string()
}

fn pipeline(oracle: Arc<MockOracle>, catalog: TemplateCatalog) -> ExtractionPipeline {
    ExtractionPipeline::new(oracle, catalog, RunConfig::default(), PromptLedger::with_seed_prompt())
        .unwrap()
}

#[tokio::test]
async fn test_audit_lifts_single_review_item() {
    let catalog = TemplateCatalog::hardware_overview().unwrap();
    assert_eq!(catalog.len(), 31);

    let ids: Vec<String> = catalog.iter().map(|f| f.id.clone()).collect();
    let entries: Vec<(&str, u8)> = ids
        .iter()
        .map(|id| (id.as_str(), if id == "chassis_depth" { 85 } else { 95 }))
        .collect();

    let oracle = Arc::new(
        MockOracle::new()
            .script(OraclePurpose::Match, match_reply(&entries))
            .script(
                OraclePurpose::Audit,
                r#"{"verdict": "confirmed", "confidence": 92, "reasoning": "depth row in the physical table"}"#,
            )
            .script(OraclePurpose::Evaluate, evaluation_reply(82)),
    );
    let pipeline = pipeline(oracle.clone(), catalog);

    let report = pipeline
        .run_document(&hardware_document("nexus"), None)
        .await
        .unwrap();

    assert!(report.is_completed());
    assert_eq!(report.extraction.triage.approved.len(), 30);
    assert_eq!(report.extraction.triage.review.len(), 1);
    assert_eq!(report.extraction.audited.len(), 1);

    let audited = &report.extraction.audited[0];
    assert_eq!(audited.original.field_id, "chassis_depth");
    assert_eq!(audited.status, AuditStatus::Confirmed);
    assert_eq!(audited.revised_confidence, 95);

    assert_eq!(report.coverage.coverage_percent, 100.0);
    assert!(report.coverage.gaps.is_empty());
    assert_eq!(report.extraction.accepted().len(), 31);
    assert_eq!(report.decision, EvolutionDecision::Stay);
    assert_eq!(report.usage.calls, 3);

    // the audit query carries the original reasoning
    let audit_request = &oracle.requests_for(OraclePurpose::Audit)[0];
    assert!(audit_request.user.contains("chassis_depth is stated in the overview"));
}

#[tokio::test]
async fn test_unmatched_required_field_becomes_gap() {
    let catalog = TemplateCatalog::hardware_overview().unwrap();
    let ids: Vec<String> = catalog
        .iter()
        .map(|f| f.id.clone())
        .filter(|id| id != "chassis_weight" && id != "usb_port")
        .collect();
    let entries: Vec<(&str, u8)> = ids.iter().map(|id| (id.as_str(), 96)).collect();

    let oracle = Arc::new(
        MockOracle::new()
            .script(OraclePurpose::Match, match_reply(&entries))
            .script(
                OraclePurpose::Audit,
                r#"{"verdict": "unresolved", "reasoning": "no weight is given in any section"}"#,
            )
            .script(OraclePurpose::Evaluate, evaluation_reply(70)),
    );
    let pipeline = pipeline(oracle, catalog);

    let report = pipeline
        .run_document(&hardware_document("nexus"), None)
        .await
        .unwrap();

    let review = &report.extraction.triage.review;
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].field_id, "chassis_weight");
    assert_eq!(review[0].confidence, 0);
    assert_eq!(report.extraction.triage.bypassed, vec!["usb_port".to_string()]);

    let gaps = &report.coverage.gaps;
    assert_eq!(gaps.len(), 2);
    assert_eq!(gaps[0].field_id, "chassis_weight");
    assert_eq!(gaps[0].severity, Severity::Medium);
    assert_eq!(gaps[0].category, GapCategory::Missing);
    assert_eq!(
        gaps[0].suggested_question,
        "What specific content should be included in the 'Chassis weight' section?"
    );
    assert_eq!(gaps[1].field_id, "usb_port");
    assert_eq!(gaps[1].severity, Severity::Low);

    let total = report.coverage.total_fields as f64;
    let expected = (100.0 * (total - gaps.len() as f64) / total * 10.0).round() / 10.0;
    assert_eq!(report.coverage.coverage_percent, expected);
    assert_eq!(report.coverage.coverage_percent, 93.5);
}

fn small_catalog() -> TemplateCatalog {
    TemplateCatalog::new(
        "ports",
        vec![
            TemplateField::new("qsfp_port_count", "QSFP port count")
                .kind(FieldKind::Numeric)
                .required(Severity::High),
            TemplateField::new("rack_units", "Rack units").required(Severity::High),
        ],
    )
    .unwrap()
}

const EVOLVED_PROMPT: &str =
    r#"{"prompt_text": "Extract hardware values. Quote the exact table row for every value."}"#;

#[tokio::test]
async fn test_low_score_evolves_once() {
    let both = match_reply(&[("qsfp_port_count", 95), ("rack_units", 95)]);
    let oracle = Arc::new(
        MockOracle::new()
            .default_reply(OraclePurpose::Match, both)
            .script(OraclePurpose::Evaluate, evaluation_reply(45))
            .script(OraclePurpose::Evaluate, evaluation_reply(75))
            .script(OraclePurpose::Evolve, EVOLVED_PROMPT),
    );
    let pipeline = pipeline(oracle.clone(), small_catalog());

    let first = pipeline
        .run_document(&hardware_document("doc-1"), None)
        .await
        .unwrap();
    assert_eq!(first.prompt_version_id.to_string(), "1.0");
    assert!(first.decision.should_evolve());
    assert_eq!(first.evolved_to.map(|v| v.to_string()), Some("1.1".to_string()));

    let tip = pipeline.ledger().tip().unwrap();
    assert_eq!(tip.version_id.to_string(), "1.1");
    assert_eq!(tip.parent_version_id.map(|v| v.to_string()), Some("1.0".to_string()));

    let second = pipeline
        .run_document(&hardware_document("doc-2"), None)
        .await
        .unwrap();
    assert_eq!(second.prompt_version_id.to_string(), "1.1");
    assert_eq!(second.decision, EvolutionDecision::Stay);
    assert_eq!(second.evolved_to, None);
    assert_eq!(pipeline.ledger().len().unwrap(), 2);

    // the second match pass ran on the evolved text
    let match_requests = oracle.requests_for(OraclePurpose::Match);
    assert_eq!(
        match_requests[1].system,
        "Extract hardware values. Quote the exact table row for every value."
    );

    let trend = pipeline.ledger().trend().unwrap();
    assert_eq!(trend.len(), 2);
    assert!(pipeline.ledger().evolution_improved().unwrap());
    assert!(second.evaluation.unwrap().effectiveness > first.evaluation.unwrap().effectiveness);
}

#[tokio::test]
async fn test_concurrent_evolutions_do_not_fork() {
    let both = match_reply(&[("qsfp_port_count", 95), ("rack_units", 95)]);
    let oracle = Arc::new(
        MockOracle::new()
            .default_reply(OraclePurpose::Match, both)
            .default_reply(OraclePurpose::Evaluate, evaluation_reply(45))
            .default_reply(OraclePurpose::Evolve, EVOLVED_PROMPT)
            .gate_evolutions(2),
    );
    let pipeline = pipeline(oracle.clone(), small_catalog());

    let documents = vec![hardware_document("doc-a"), hardware_document("doc-b")];
    let reports = pipeline.run_batch(&documents, 2).await;

    let reports: Vec<DocumentReport> = reports.into_iter().map(|r| r.unwrap()).collect();
    assert!(reports.iter().all(|r| r.prompt_version_id == VersionId::ROOT));
    assert!(reports.iter().all(|r| !r.evolution_conflict));

    let mut evolved: Vec<String> = reports
        .iter()
        .filter_map(|r| r.evolved_to.map(|v| v.to_string()))
        .collect();
    evolved.sort();
    assert_eq!(evolved, vec!["1.1".to_string(), "1.2".to_string()]);

    let versions = pipeline.ledger().versions().unwrap();
    assert_eq!(versions.len(), 3);
    assert_eq!(versions[2].parent_version_id, Some(versions[1].version_id));
    pipeline.ledger().verify().unwrap();

    // the loser re-requested its rewrite from the new tip
    assert_eq!(oracle.requests_for(OraclePurpose::Evolve).len(), 3);
}

#[tokio::test]
async fn test_unavailable_oracle_fails_document() {
    let oracle = Arc::new(MockOracle::new().script_result(
        OraclePurpose::Match,
        Err(OracleError::Unavailable("connection refused".to_string())),
    ));
    let pipeline = pipeline(oracle, small_catalog());

    let report = pipeline
        .run_document(&hardware_document("offline"), None)
        .await
        .unwrap();

    assert!(!report.is_completed());
    assert!(matches!(
        &report.status,
        DocumentStatus::Failed { category, .. } if category == "oracle_unavailable"
    ));
    assert_eq!(report.coverage.coverage_percent, 0.0);
    assert_eq!(report.coverage.gaps.len(), 1);
    assert_eq!(report.coverage.gaps[0].field_id, "<document>");
    assert_eq!(report.coverage.gaps[0].category, GapCategory::DocumentFailed);
    assert!(pipeline.ledger().evaluations().unwrap().is_empty());
}

#[tokio::test]
async fn test_pinned_version_is_used_for_matching() {
    let both = match_reply(&[("qsfp_port_count", 95), ("rack_units", 95)]);
    let oracle = Arc::new(
        MockOracle::new()
            .default_reply(OraclePurpose::Match, both)
            .default_reply(OraclePurpose::Evaluate, evaluation_reply(90)),
    );
    let pipeline = pipeline(oracle.clone(), small_catalog());
    pipeline
        .ledger()
        .commit(VersionId::ROOT, "second prompt", vec![], Some(40.0))
        .unwrap();

    let report = pipeline
        .run_document(&hardware_document("pinned"), Some(VersionId::ROOT))
        .await
        .unwrap();
    assert_eq!(report.prompt_version_id, VersionId::ROOT);
    assert_ne!(oracle.requests_for(OraclePurpose::Match)[0].system, "second prompt");

    let err = pipeline
        .run_document(&hardware_document("pinned"), Some("4.2".parse().unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractionError::UnknownPromptVersion(_)));
}

#[tokio::test]
async fn test_cancelled_document_leaves_no_trace() {
    let oracle = Arc::new(
        MockOracle::new()
            .default_reply(OraclePurpose::Match, match_reply(&[("rack_units", 20)]))
            .default_reply(OraclePurpose::Evaluate, evaluation_reply(10))
            .default_reply(OraclePurpose::Evolve, EVOLVED_PROMPT),
    );
    let pipeline = pipeline(oracle, small_catalog());

    let err = pipeline
        .run_document_until(&hardware_document("cancelled"), None, std::future::ready(()))
        .await
        .unwrap_err();

    assert!(matches!(err, ExtractionError::Cancelled));
    assert_eq!(pipeline.ledger().len().unwrap(), 1);
    assert!(pipeline.ledger().evaluations().unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_events_and_idempotent_inputs() {
    let both = match_reply(&[("qsfp_port_count", 95), ("rack_units", 60)]);
    let oracle = Arc::new(
        MockOracle::new()
            .default_reply(OraclePurpose::Match, both)
            .default_reply(
                OraclePurpose::Audit,
                r#"{"verdict": "unresolved", "reasoning": "not enough context"}"#,
            )
            .default_reply(OraclePurpose::Evaluate, evaluation_reply(88)),
    );
    let (tx, mut rx) = mpsc::channel(100);
    let pipeline = pipeline(oracle, small_catalog()).with_progress(tx);

    let document = hardware_document("events");
    let first = pipeline.run_document(&document, None).await.unwrap();
    let second = pipeline.run_document(&document, None).await.unwrap();

    assert_eq!(first.extraction.triage, second.extraction.triage);
    assert_eq!(first.coverage.gaps, second.coverage.gaps);
    assert_eq!(first.coverage.coverage_percent, 50.0);
    assert_eq!(first.stats.review, 1);

    drop(pipeline);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert!(matches!(events[0], PipelineEvent::Starting { .. }));
    assert!(events.contains(&PipelineEvent::Triaged {
        approved: 1,
        review: 1
    }));
    assert!(events.contains(&PipelineEvent::Auditing { items: 1 }));
    assert!(events.contains(&PipelineEvent::Completed {
        document_id: "events".to_string()
    }));
}

#[tokio::test]
async fn test_ledger_history_survives_restart() {
    let both = match_reply(&[("qsfp_port_count", 95), ("rack_units", 95)]);
    let oracle = Arc::new(
        MockOracle::new()
            .default_reply(OraclePurpose::Match, both)
            .script(OraclePurpose::Evaluate, evaluation_reply(30))
            .script(OraclePurpose::Evolve, EVOLVED_PROMPT),
    );
    let pipeline = pipeline(oracle, small_catalog());
    pipeline
        .run_document(&hardware_document("persist"), None)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.json");
    pipeline.ledger().save_to(&path).unwrap();

    let restored = PromptLedger::load_from(&path).unwrap();
    assert_eq!(restored.versions().unwrap(), pipeline.ledger().versions().unwrap());
    assert_eq!(restored.evaluations().unwrap().len(), 1);
    assert_eq!(restored.tip().unwrap().version_id.to_string(), "1.1");
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let config = RunConfig {
        confidence_threshold: 120,
        ..RunConfig::default()
    };
    let result = ExtractionPipeline::new(
        Arc::new(MockOracle::new()),
        small_catalog(),
        config,
        PromptLedger::with_seed_prompt(),
    );
    assert!(matches!(result, Err(ExtractionError::ConfigurationError(_))));
}
