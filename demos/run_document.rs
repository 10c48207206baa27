use adaptive_extraction::*;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::sync::mpsc;

// Parsed sections of a switch hardware overview (simulated parser output)
const MOCK_SECTIONS: &[(&str, &str)] = &[
    (
        "Overview",
        "The Cisco Nexus 9364C-H1 switch (N9K-C9364C-H1) is a 2-rack unit (RU), fixed-port \
         switch that supports 25.6 Tbps of bandwidth across 64 fixed 100-Gigabit QSFP28 ports \
         and two 1/10-Gigabit SFP+ ports.",
    ),
    (
        "Management and Console",
        "One 10/100/1000BASE-T management port and one RJ-45 console port are located on the \
         port side. A USB 2.0 port supports image transfers.",
    ),
    (
        "Fan and Power Modules",
        "Four fan modules with port-side exhaust (NXA-FAN-160CFM2-PE) or port-side intake \
         (NXA-FAN-160CFM2-PI). Two power supplies: 1400-W AC (NXA-PAC-1400W-PE / -PI) for \
         1+1 redundancy.",
    ),
    (
        "Physical Specifications",
        "Width 17.41 inches (44.23 cm). Depth 22.27 inches (56.58 cm). Height 3.4 inches \
         (8.6 cm). Weight 30.2 lb (13.7 kg) with two power supplies and four fan modules.",
    ),
    (
        "Environmental Specifications",
        "Operating temperature 32 to 104 F (0 to 40 C). Non-operating temperature -40 to \
         158 F (-40 to 70 C). Relative humidity 5 to 95 percent non-condensing. Altitude 0 to \
         13,123 ft (0 to 4000 m).",
    ),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    println!("🚀 Starting adaptive extraction example...");

    let settings = OracleSettings::from_env()?;
    let oracle = Arc::new(ChatCompletionsClient::new(settings)?);
    println!("🤖 Oracle ready ({})", oracle.model());

    let catalog = TemplateCatalog::hardware_overview()?;
    println!("📋 Loaded catalog '{}' with {} fields.", catalog.name, catalog.len());

    let ledger_path = std::env::var("PROMPT_LEDGER_PATH").ok();
    let ledger = match &ledger_path {
        Some(path) if std::path::Path::new(path).exists() => PromptLedger::load_from(path)?,
        _ => PromptLedger::with_seed_prompt(),
    };

    let (tx, mut rx) = mpsc::channel(100);
    let pipeline = ExtractionPipeline::new(oracle, catalog, RunConfig::default(), ledger)?
        .with_progress(tx);

    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                PipelineEvent::Starting {
                    document_id,
                    prompt_version_id,
                } => println!("📄 {} with prompt {}", document_id, prompt_version_id),
                PipelineEvent::Matching => println!("🔍 Matching fields..."),
                PipelineEvent::Retry { stage, error, .. } => {
                    println!("🔁 Retrying {:?}: {}", stage, error)
                }
                PipelineEvent::Triaged { approved, review } => {
                    println!("✅ {} approved, {} for review", approved, review)
                }
                PipelineEvent::Auditing { items } => println!("🧐 Auditing {} items...", items),
                PipelineEvent::Analyzed { coverage_percent } => {
                    println!("📊 Coverage {:.1}%", coverage_percent)
                }
                PipelineEvent::Evaluating => println!("🪞 Self-evaluating..."),
                PipelineEvent::Evolved { from, to } => println!("🧬 Prompt evolved {} -> {}", from, to),
                PipelineEvent::Completed { document_id } => println!("🏁 {} done", document_id),
                PipelineEvent::Failed { document_id, reason } => {
                    eprintln!("❌ {} failed: {}", document_id, reason)
                }
            }
        }
    });

    let document = SourceDocument::from_pairs(
        "nexus-9364c-h1",
        MOCK_SECTIONS.iter().map(|(heading, body)| (Some(*heading), *body)),
    );
    let report = pipeline.run_document(&document, None).await?;

    println!("\n{}", report.coverage.to_markdown());
    println!(
        "💰 {} oracle calls, {} tokens",
        report.usage.calls,
        report.usage.total_tokens()
    );
    if let Some(cost) = report.usage.estimated_cost_usd {
        println!("💰 estimated spend ${:.5}", cost);
    }

    std::fs::write("extraction_report.json", serde_json::to_string_pretty(&report)?)?;
    println!("💾 Saved full report to extraction_report.json");

    if let Some(path) = ledger_path {
        pipeline.ledger().save_to(&path)?;
        println!("💾 Saved prompt ledger to {}", path);
    }

    drop(pipeline);
    progress.await?;
    Ok(())
}
