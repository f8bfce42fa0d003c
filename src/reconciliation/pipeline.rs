//! End-to-end batch: parse, persist, rules, matching, anomalies

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::anomaly::AnomalyDetector;
use crate::config::{MatchMode, ReconConfig};
use crate::matching::{AutoApplyReport, AutoMatcher};
use crate::reconciliation::ReconciliationLedger;
use crate::rules::{RuleEngine, RulePassReport};
use crate::statement::{date_range, parse_statement, ImportPreview, StatementMetadata};
use crate::traits::*;
use crate::types::*;
use crate::utils::{validate_owner_id, with_timeout};

/// Candidate kinds in the order they are offered to the matcher
pub const MATCH_ORDER: [CandidateKind; 3] = [
    CandidateKind::Installment,
    CandidateKind::Payable,
    CandidateKind::LedgerEntry,
];

/// A candidate pool that could not be fetched or matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPool {
    pub kind: CandidateKind,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub statement_id: String,
    /// Pending transactions the run started with
    pub pending: usize,
    pub rules: RulePassReport,
    pub unresolved_after_rules: usize,
    /// Every proposal of the matching pass, committed or not
    pub proposals: Vec<MatchResult>,
    /// Present only in auto-apply mode
    pub auto_apply: Option<AutoApplyReport>,
    /// Transactions with neither an outcome nor a proposal
    pub unresolved_after_matching: usize,
    pub skipped_pools: Vec<SkippedPool>,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub statement_id: String,
    pub preview: ImportPreview,
    /// Document ids already present for the account, not saved again
    pub already_imported: Vec<String>,
    pub reconciliation: ReconciliationReport,
}

/// Drives one statement through every reconciliation stage.
///
/// Stages run sequentially over a single ledger, so no two commits ever
/// target the same candidate concurrently.
pub struct ReconciliationPipeline<S> {
    ledger: ReconciliationLedger<S>,
    rules: RuleEngine,
    matcher: AutoMatcher,
    detector: AnomalyDetector,
    config: ReconConfig,
}

impl<S> ReconciliationPipeline<S>
where
    S: StatementStorage + ObligationStorage + EntryStorage + RuleStorage,
{
    pub fn new(storage: S, config: ReconConfig) -> Self {
        Self::with_rule_engine(storage, config, RuleEngine::new())
    }

    pub fn with_rule_engine(storage: S, config: ReconConfig, rules: RuleEngine) -> Self {
        Self {
            ledger: ReconciliationLedger::new(storage, &config),
            rules,
            matcher: AutoMatcher::new(&config),
            detector: AnomalyDetector::new(&config),
            config,
        }
    }

    pub fn ledger(&self) -> &ReconciliationLedger<S> {
        &self.ledger
    }

    /// Access the ledger to confirm proposals or undo
    pub fn ledger_mut(&mut self) -> &mut ReconciliationLedger<S> {
        &mut self.ledger
    }

    /// Insert the default rules for an owner that has none
    pub async fn seed_default_rules(&mut self, owner_id: &str) -> ReconResult<usize> {
        validate_owner_id(owner_id)?;
        self.rules
            .seed_default_rules(self.ledger.storage_mut(), owner_id)
            .await
    }

    /// Import a statement file and reconcile it.
    ///
    /// Records whose document id already exists for the same account are
    /// reported and dropped before saving.
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub async fn import(
        &mut self,
        content: &[u8],
        filename: &str,
        owner_id: &str,
    ) -> ReconResult<ImportReport> {
        validate_owner_id(owner_id)?;
        let parsed = parse_statement(content, filename)?;
        let preview = parsed.preview();
        let statement_id = uuid::Uuid::new_v4().to_string();
        let timeout = self.ledger.call_timeout();

        let mut fresh = Vec::with_capacity(parsed.transactions.len());
        let mut already_imported = Vec::new();
        for mut transaction in parsed.transactions {
            transaction.statement_id = statement_id.clone();
            if transaction.account_id.is_none() {
                transaction.account_id = parsed.metadata.account_id.clone();
            }
            if let Some(document_id) = &transaction.document_id {
                let existing = with_timeout(
                    timeout,
                    "find document",
                    self.ledger
                        .storage()
                        .find_by_document_id(transaction.account_id.as_deref(), document_id),
                )
                .await?;
                if existing.is_some() {
                    already_imported.push(document_id.clone());
                    continue;
                }
            }
            fresh.push(transaction);
        }

        if !already_imported.is_empty() {
            warn!(
                statement_id,
                count = already_imported.len(),
                "records already imported were skipped"
            );
        }

        with_timeout(
            timeout,
            "save transactions",
            self.ledger.storage_mut().save_transactions(&fresh),
        )
        .await?;
        info!(statement_id, saved = fresh.len(), "statement saved");

        let window = statement_window(&parsed.metadata, &fresh);
        let reconciliation = self.reconcile_window(&statement_id, owner_id, window).await?;

        Ok(ImportReport {
            statement_id,
            preview,
            already_imported,
            reconciliation,
        })
    }

    /// Reconcile the pending records of an already saved statement
    pub async fn reconcile(
        &mut self,
        statement_id: &str,
        owner_id: &str,
    ) -> ReconResult<ReconciliationReport> {
        self.reconcile_window(statement_id, owner_id, None).await
    }

    async fn reconcile_window(
        &mut self,
        statement_id: &str,
        owner_id: &str,
        window: Option<(NaiveDate, NaiveDate)>,
    ) -> ReconResult<ReconciliationReport> {
        let timeout = self.ledger.call_timeout();
        let transactions = with_timeout(
            timeout,
            "list transactions",
            self.ledger
                .storage()
                .list_transactions(statement_id, Some(ReconciliationStatus::Pending)),
        )
        .await?;
        let rules = with_timeout(
            timeout,
            "list rules",
            self.ledger.storage().list_rules(owner_id),
        )
        .await?;

        let mut report = ReconciliationReport {
            statement_id: statement_id.to_string(),
            pending: transactions.len(),
            ..Default::default()
        };
        let mut working = WorkingSet::new();

        report.rules = self
            .rules
            .apply(&mut self.ledger, &transactions, &rules, &mut working)
            .await;
        report.unresolved_after_rules = count_open(&transactions, &working);
        // `working` also holds uncommitted reservations; this holds only commits
        let mut committed = working.clone();
        info!(
            statement_id,
            unresolved = report.unresolved_after_rules,
            "rule pass done"
        );

        let window = window.or_else(|| transaction_window(&transactions));
        let Some((start, end)) = window else {
            return Ok(report);
        };
        let slack = Duration::days(self.config.dates.max_days);
        let (start, end) = (start - slack, end + slack);

        let auto_apply = self.config.batch.match_mode == MatchMode::AutoApply;
        let mut applied = AutoApplyReport::default();
        let mut installments = Vec::new();

        for kind in MATCH_ORDER {
            let candidates = match with_timeout(
                timeout,
                "list candidates",
                self.ledger.storage().list_candidates(kind, start, end),
            )
            .await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(%kind, error = %e, "candidate pool skipped");
                    report.skipped_pools.push(SkippedPool {
                        kind,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let proposals = match self.matcher.propose(&transactions, &candidates, &working) {
                Ok(proposals) => proposals,
                Err(e) => {
                    warn!(%kind, error = %e, "candidate pool skipped");
                    report.skipped_pools.push(SkippedPool {
                        kind,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            report.proposals.extend(proposals.iter().cloned());

            if auto_apply {
                let outcome = self
                    .matcher
                    .apply(&mut self.ledger, proposals, &mut working)
                    .await;
                for commit in &outcome.applied {
                    committed.consume(&commit.transaction_id, &commit.candidate_id);
                }
                // advisory proposals stay reserved for confirmation
                for proposal in &outcome.advisory {
                    working.consume(&proposal.transaction_id, &proposal.candidate_id);
                }
                applied.applied.extend(outcome.applied);
                applied.advisory.extend(outcome.advisory);
                applied.failed.extend(outcome.failed);
            } else {
                for proposal in &proposals {
                    working.consume(&proposal.transaction_id, &proposal.candidate_id);
                }
            }

            if kind == CandidateKind::Installment {
                installments = candidates;
            }
        }

        report.unresolved_after_matching = count_open(&transactions, &working);

        // Proposals awaiting confirmation are still open for the detector.
        // Deposits matched in this run count toward duplicate groups.
        let settled: Vec<(&TransactionRecord, &CandidateObligation)> = applied
            .applied
            .iter()
            .filter(|commit| commit.candidate_kind == CandidateKind::Installment)
            .filter_map(|commit| {
                let transaction = transactions.iter().find(|t| t.id == commit.transaction_id)?;
                let installment = installments.iter().find(|c| c.id == commit.candidate_id)?;
                Some((transaction, installment))
            })
            .collect();
        let open: Vec<TransactionRecord> = transactions
            .iter()
            .filter(|t| !committed.is_resolved(&t.id))
            .cloned()
            .collect();
        let outstanding: Vec<CandidateObligation> = installments
            .iter()
            .filter(|c| !committed.is_consumed(&c.id))
            .cloned()
            .collect();
        report.anomalies = self
            .detector
            .detect_with_settled(&open, &outstanding, &settled);

        if auto_apply {
            info!(
                statement_id,
                applied = applied.applied.len(),
                advisory = applied.advisory.len(),
                failed = applied.failed.len(),
                "auto-apply done"
            );
            report.auto_apply = Some(applied);
        }

        info!(
            statement_id,
            proposals = report.proposals.len(),
            unresolved = report.unresolved_after_matching,
            anomalies = report.anomalies.len(),
            "reconciliation finished"
        );
        Ok(report)
    }
}

fn count_open(transactions: &[TransactionRecord], working: &WorkingSet) -> usize {
    transactions
        .iter()
        .filter(|t| !working.is_resolved(&t.id))
        .count()
}

fn transaction_window(transactions: &[TransactionRecord]) -> Option<(NaiveDate, NaiveDate)> {
    match date_range(transactions) {
        (Some(start), Some(end)) => Some((start, end)),
        _ => None,
    }
}

/// Header dates when both are present, otherwise the span of the records
fn statement_window(
    metadata: &StatementMetadata,
    transactions: &[TransactionRecord],
) -> Option<(NaiveDate, NaiveDate)> {
    match (metadata.start_date, metadata.end_date) {
        (Some(start), Some(end)) if start <= end => Some((start, end)),
        _ => transaction_window(transactions),
    }
}
