//! Basic reconciliation example

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use reconciliation_core::utils::MemoryStorage;
use reconciliation_core::{
    CandidateKind, CandidateObligation, MatchMode, ReconConfig, ReconciliationPipeline,
};
use std::str::FromStr;

const STATEMENT: &str = "data;historico;valor
03/06/2024;PIX RECEBIDO MARIA SOUZA;1.250,00
04/06/2024;TARIFA PACOTE SERVICOS;-39,90
05/06/2024;PAGTO BOLETO ENERGIA;-312,45
10/06/2024;DEPOSITO;800,00
12/06/2024;TED RECEBIDA;300,00
12/06/2024;PIX RECEBIDO;700,00
13/06/2024;RESGATE CDB;5.000,00
";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Reconciliation Core - Basic Reconciliation Example\n");

    // Candidates owned by the receivables and payables modules
    let storage = MemoryStorage::new();
    let candidates = [
        ("inst-001", CandidateKind::Installment, "1250.00", 3, "Maria Souza"),
        ("inst-002", CandidateKind::Installment, "1000.00", 10, "Joao Pereira"),
        ("inst-003", CandidateKind::Installment, "1000.00", 12, "Carla Dias"),
        ("pay-001", CandidateKind::Payable, "312.45", 5, "Energia"),
    ];
    for (id, kind, amount, day, counterparty) in candidates {
        let date = NaiveDate::from_ymd_opt(2024, 6, day).ok_or("invalid date")?;
        storage.add_candidate(
            CandidateObligation::new(
                id.to_string(),
                kind,
                BigDecimal::from_str(amount)?,
                date,
                counterparty.to_string(),
            )
            .with_parent("customer-ledger"),
        );
    }

    let mut config = ReconConfig::default();
    config.batch.match_mode = MatchMode::AutoApply;
    let mut pipeline = ReconciliationPipeline::new(storage.clone(), config);

    let seeded = pipeline.seed_default_rules("acme").await?;
    println!("Seeded {seeded} default rules");

    let report = pipeline
        .import(STATEMENT.as_bytes(), "extrato-junho.csv", "acme")
        .await?;

    let preview = &report.preview;
    println!(
        "Imported {} rows ({} skipped): credits {}, debits {}",
        preview.accepted, preview.skipped, preview.total_credits, preview.total_debits
    );

    let run = &report.reconciliation;
    println!("\nRule pass");
    println!("  entries created: {}", run.rules.entries_created.len());
    println!("  ignored:         {}", run.rules.ignored.len());
    println!("  still unresolved: {}", run.unresolved_after_rules);

    println!("\nMatching");
    for proposal in &run.proposals {
        let labels: Vec<_> = proposal.factors.iter().map(|f| f.label()).collect();
        println!(
            "  {} -> {} score {} ({:?}) [{}]",
            proposal.transaction_id,
            proposal.candidate_id,
            proposal.score,
            proposal.tier,
            labels.join(", ")
        );
    }
    if let Some(outcome) = &run.auto_apply {
        println!(
            "  applied {}, awaiting confirmation {}",
            outcome.applied.len(),
            outcome.advisory.len()
        );
    }
    println!("  still unresolved: {}", run.unresolved_after_matching);

    println!("\nAnomalies for review");
    for anomaly in &run.anomalies {
        println!("  {:?}: {:?}", anomaly.kind(), anomaly.transaction_ids());
    }

    if let Some(paid) = storage.aggregate_paid("customer-ledger") {
        println!("\nPaid on customer-ledger: {paid}");
    }

    Ok(())
}
