//! Transaction status state machine and match commits
//!
//! `Pending -> Matched | Ignored`, and back to `Pending` only through
//! [`ReconciliationLedger::undo`].

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ReconConfig;
use crate::traits::*;
use crate::types::*;
use crate::utils::with_timeout;

/// Result of the recompute-and-reconcile check on an aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateCheck {
    pub parent_id: String,
    /// Paid total returned by the incremental update, if it succeeded
    pub incremental: Option<BigDecimal>,
    /// Paid total recomputed from every settled item
    pub authoritative: BigDecimal,
    /// The stored total was overwritten with the authoritative value
    pub corrected: bool,
}

/// A committed match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCommit {
    pub transaction: TransactionRecord,
    pub candidate: CandidateObligation,
    pub ledger_entry_id: String,
    /// `None` when the candidate has no owning aggregate or the check failed
    pub aggregate: Option<AggregateCheck>,
}

/// What an undo reverted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoOutcome {
    pub transaction: TransactionRecord,
    pub released_candidate: Option<String>,
    pub deleted_entry: Option<String>,
    pub aggregate: Option<AggregateCheck>,
}

/// Owns transaction state transitions and delegates obligation updates
pub struct ReconciliationLedger<S> {
    storage: S,
    call_timeout: Duration,
    max_conflict_retries: u32,
}

impl<S> ReconciliationLedger<S>
where
    S: StatementStorage + ObligationStorage + EntryStorage,
{
    /// Create a new ledger over the given storage backend
    pub fn new(storage: S, config: &ReconConfig) -> Self {
        Self {
            storage,
            call_timeout: config.batch.external_call_timeout(),
            max_conflict_retries: config.batch.max_conflict_retries,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Get a transaction by ID, returning an error if not found
    pub async fn get_transaction_required(
        &self,
        transaction_id: &str,
    ) -> ReconResult<TransactionRecord> {
        with_timeout(
            self.call_timeout,
            "get transaction",
            self.storage.get_transaction(transaction_id),
        )
        .await?
        .ok_or_else(|| ReconError::TransactionNotFound(transaction_id.to_string()))
    }

    async fn pending_transaction(
        &self,
        transaction_id: &str,
        action: &'static str,
    ) -> ReconResult<TransactionRecord> {
        let transaction = self.get_transaction_required(transaction_id).await?;
        if !transaction.is_pending() {
            return Err(ReconError::InvalidTransition {
                transaction_id: transaction_id.to_string(),
                from: transaction.status,
                action,
            });
        }
        Ok(transaction)
    }

    /// Match a pending transaction to a candidate.
    ///
    /// The candidate claim, entry creation and transaction link form one
    /// unit: a failure after the claim releases it, and a failure after the
    /// entry is created deletes the entry.
    #[instrument(skip(self))]
    pub async fn apply_match(
        &mut self,
        transaction_id: &str,
        candidate_id: &str,
    ) -> ReconResult<MatchCommit> {
        let transaction = self.pending_transaction(transaction_id, "match").await?;
        let candidate = self.claim_with_retry(candidate_id, transaction_id).await?;

        let (ledger_entry_id, created_entry) = match candidate.kind {
            CandidateKind::LedgerEntry => (candidate.id.clone(), false),
            CandidateKind::Installment | CandidateKind::Payable => {
                let entry = LedgerEntry::for_transaction(
                    &transaction,
                    transaction.direction,
                    Some(candidate.kind.to_string()),
                    EntryOrigin::Settlement(candidate.id.clone()),
                );
                let created = with_timeout(
                    self.call_timeout,
                    "create entry",
                    self.storage.create_entry(&entry),
                )
                .await;
                // a timed-out write may still have landed
                if let Err(e) = created {
                    self.rollback(transaction_id, Some(&entry.id), Some(candidate_id))
                        .await;
                    return Err(e);
                }
                (entry.id, true)
            }
        };

        let mut linked = transaction;
        linked.status = ReconciliationStatus::Matched;
        linked.ledger_entry_id = Some(ledger_entry_id.clone());
        linked.matched_candidate_id = Some(candidate.id.clone());
        linked.touch();

        let updated = with_timeout(
            self.call_timeout,
            "link transaction",
            self.storage.update_transaction(&linked),
        )
        .await;
        if let Err(e) = updated {
            let entry = created_entry.then_some(ledger_entry_id.as_str());
            self.rollback(transaction_id, entry, Some(candidate_id)).await;
            return Err(e);
        }

        let aggregate = match candidate.parent_id.as_deref() {
            Some(parent_id) => self.update_aggregate(parent_id, &candidate.amount).await,
            None => None,
        };

        info!(
            transaction_id,
            candidate_id,
            kind = %candidate.kind,
            ledger_entry_id = %ledger_entry_id,
            "transaction matched"
        );

        Ok(MatchCommit {
            transaction: linked,
            candidate,
            ledger_entry_id,
            aggregate,
        })
    }

    /// Link a pending transaction to a freshly generated entry (rule-driven)
    #[instrument(skip(self, entry), fields(entry_id = %entry.id))]
    pub async fn apply_entry(
        &mut self,
        transaction_id: &str,
        entry: LedgerEntry,
        rule_id: &str,
    ) -> ReconResult<TransactionRecord> {
        let mut transaction = self.pending_transaction(transaction_id, "create entry").await?;

        let created = with_timeout(
            self.call_timeout,
            "create entry",
            self.storage.create_entry(&entry),
        )
        .await;
        if let Err(e) = created {
            self.rollback(transaction_id, Some(&entry.id), None).await;
            return Err(e);
        }

        transaction.status = ReconciliationStatus::Matched;
        transaction.ledger_entry_id = Some(entry.id.clone());
        transaction.rule_id = Some(rule_id.to_string());
        transaction.touch();

        let updated = with_timeout(
            self.call_timeout,
            "link transaction",
            self.storage.update_transaction(&transaction),
        )
        .await;
        if let Err(e) = updated {
            self.rollback(transaction_id, Some(&entry.id), None).await;
            return Err(e);
        }

        info!(transaction_id, rule_id, "entry created by rule");
        Ok(transaction)
    }

    /// Mark a pending transaction ignored, recording the rule that did it
    #[instrument(skip(self))]
    pub async fn apply_ignore(
        &mut self,
        transaction_id: &str,
        rule_id: Option<&str>,
    ) -> ReconResult<TransactionRecord> {
        let mut transaction = self.pending_transaction(transaction_id, "ignore").await?;
        transaction.status = ReconciliationStatus::Ignored;
        transaction.rule_id = rule_id.map(str::to_string);
        transaction.touch();

        with_timeout(
            self.call_timeout,
            "ignore transaction",
            self.storage.update_transaction(&transaction),
        )
        .await?;

        info!(transaction_id, ?rule_id, "transaction ignored");
        Ok(transaction)
    }

    /// Return a matched or ignored transaction to pending.
    ///
    /// The transaction is reset first, then the generated entry is deleted
    /// and the candidate released. A failure in either step puts the
    /// transaction back as it was, so the candidate is never outstanding
    /// while a matched transaction still points at it. A failed undo can be
    /// retried.
    #[instrument(skip(self))]
    pub async fn undo(&mut self, transaction_id: &str) -> ReconResult<UndoOutcome> {
        let original = self.get_transaction_required(transaction_id).await?;
        if original.is_pending() {
            return Err(ReconError::InvalidTransition {
                transaction_id: transaction_id.to_string(),
                from: original.status,
                action: "undo",
            });
        }

        let candidate = match original.matched_candidate_id.as_deref() {
            Some(candidate_id) => {
                let found = with_timeout(
                    self.call_timeout,
                    "get candidate",
                    self.storage.get_candidate(candidate_id),
                )
                .await?;
                if found.is_none() {
                    warn!(candidate_id, "matched candidate no longer exists");
                }
                found
            }
            None => None,
        };
        // Entries the engine did not generate (ledger-entry candidates) stay
        let generated = match original.ledger_entry_id.as_deref() {
            Some(entry_id) => {
                with_timeout(
                    self.call_timeout,
                    "get entry",
                    self.storage.get_entry(entry_id),
                )
                .await?
            }
            None => None,
        };

        let mut transaction = original.clone();
        transaction.status = ReconciliationStatus::Pending;
        transaction.ledger_entry_id = None;
        transaction.matched_candidate_id = None;
        transaction.rule_id = None;
        transaction.touch();
        let reset = with_timeout(
            self.call_timeout,
            "reset transaction",
            self.storage.update_transaction(&transaction),
        )
        .await;
        if let Err(e) = reset {
            // a timed-out reset may still have landed
            if matches!(e, ReconError::Timeout(_)) {
                self.restore_link(&original, None).await;
            }
            return Err(e);
        }

        if let Some(entry) = &generated {
            let deleted = with_timeout(
                self.call_timeout,
                "delete entry",
                self.storage.delete_entry(&entry.id),
            )
            .await;
            if let Err(e) = deleted {
                let maybe_gone = matches!(e, ReconError::Timeout(_)).then_some(entry);
                self.restore_link(&original, maybe_gone).await;
                return Err(e);
            }
        }

        if let Some(candidate) = &candidate {
            let released = with_timeout(
                self.call_timeout,
                "release candidate",
                self.storage.release_candidate(&candidate.id, transaction_id),
            )
            .await;
            if let Err(e) = released {
                self.restore_link(&original, generated.as_ref()).await;
                return Err(e);
            }
        }

        let aggregate = match &candidate {
            Some(c) => match c.parent_id.as_deref() {
                Some(parent_id) => self.update_aggregate(parent_id, &(-c.amount.clone())).await,
                None => None,
            },
            None => None,
        };

        let released = candidate.map(|c| c.id);
        let deleted_entry = generated.map(|e| e.id);
        info!(transaction_id, ?released, ?deleted_entry, "reconciliation undone");
        Ok(UndoOutcome {
            transaction,
            released_candidate: released,
            deleted_entry,
            aggregate,
        })
    }

    /// Put a transaction back in its linked state after a failed undo
    async fn restore_link(&mut self, original: &TransactionRecord, entry: Option<&LedgerEntry>) {
        if let Some(entry) = entry {
            let recreated = with_timeout(
                self.call_timeout,
                "recreate entry",
                self.storage.create_entry(entry),
            )
            .await;
            if let Err(e) = recreated {
                error!(entry_id = %entry.id, error = %e, "deleted entry could not be restored");
            }
        }
        let restored = with_timeout(
            self.call_timeout,
            "restore transaction",
            self.storage.update_transaction(original),
        )
        .await;
        if let Err(e) = restored {
            error!(
                transaction_id = %original.id,
                error = %e,
                "transaction could not be restored after a failed undo"
            );
        }
    }

    /// Recompute an aggregate from its settled items and correct drift.
    ///
    /// `incremental` is the paid total the incremental update produced; when
    /// it is absent or disagrees, the stored total is overwritten.
    pub async fn reconcile_aggregate(
        &mut self,
        parent_id: &str,
        incremental: Option<BigDecimal>,
    ) -> ReconResult<AggregateCheck> {
        let authoritative = with_timeout(
            self.call_timeout,
            "recompute aggregate",
            self.storage.recompute_aggregate_paid(parent_id),
        )
        .await?;

        let corrected = incremental.as_ref() != Some(&authoritative);
        if corrected {
            warn!(
                parent_id,
                incremental = ?incremental.as_ref().map(ToString::to_string),
                authoritative = %authoritative,
                "aggregate drift corrected"
            );
            with_timeout(
                self.call_timeout,
                "correct aggregate",
                self.storage.set_aggregate_paid(parent_id, &authoritative),
            )
            .await?;
        }

        Ok(AggregateCheck {
            parent_id: parent_id.to_string(),
            incremental,
            authoritative,
            corrected,
        })
    }

    /// Incremental update followed by the consistency check. Failures are
    /// logged; the committed transaction state is not rolled back for them.
    async fn update_aggregate(&mut self, parent_id: &str, delta: &BigDecimal) -> Option<AggregateCheck> {
        let incremental = match with_timeout(
            self.call_timeout,
            "adjust aggregate",
            self.storage.adjust_aggregate_paid(parent_id, delta),
        )
        .await
        {
            Ok(total) => Some(total),
            Err(e) => {
                warn!(parent_id, error = %e, "incremental aggregate update failed");
                None
            }
        };

        match self.reconcile_aggregate(parent_id, incremental).await {
            Ok(check) => Some(check),
            Err(e) => {
                error!(parent_id, error = %e, "aggregate consistency check failed");
                None
            }
        }
    }

    /// Refetch and claim a candidate, retrying on version conflicts
    async fn claim_with_retry(
        &mut self,
        candidate_id: &str,
        transaction_id: &str,
    ) -> ReconResult<CandidateObligation> {
        let mut attempt = 0;
        loop {
            let candidate = with_timeout(
                self.call_timeout,
                "get candidate",
                self.storage.get_candidate(candidate_id),
            )
            .await?
            .ok_or_else(|| ReconError::CandidateNotFound(candidate_id.to_string()))?;

            if !candidate.is_outstanding() {
                return Err(ReconError::CandidateConsumed(candidate_id.to_string()));
            }

            let claimed = with_timeout(
                self.call_timeout,
                "claim candidate",
                self.storage
                    .claim_candidate(candidate_id, candidate.version, transaction_id),
            )
            .await;
            match claimed {
                Err(ReconError::Conflict(reason)) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    debug!(candidate_id, attempt, %reason, "claim conflict, refetching");
                }
                other => return other,
            }
        }
    }

    /// Undo the side effects of a partially applied commit
    async fn rollback(
        &mut self,
        transaction_id: &str,
        entry_id: Option<&str>,
        candidate_id: Option<&str>,
    ) {
        if let Some(entry_id) = entry_id {
            let deleted = with_timeout(
                self.call_timeout,
                "delete orphan entry",
                self.storage.delete_entry(entry_id),
            )
            .await;
            if let Err(e) = deleted {
                error!(entry_id, error = %e, "orphan entry could not be rolled back");
            }
        }
        if let Some(candidate_id) = candidate_id {
            let released = with_timeout(
                self.call_timeout,
                "release candidate",
                self.storage.release_candidate(candidate_id, transaction_id),
            )
            .await;
            if let Err(e) = released {
                error!(candidate_id, error = %e, "claimed candidate could not be released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MemoryStorage;
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn dec(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
    }

    fn quick_timeouts() -> ReconConfig {
        let mut config = ReconConfig::default();
        config.batch.external_call_timeout_ms = 20;
        config
    }

    async fn setup() -> (ReconciliationLedger<MemoryStorage>, String) {
        setup_with(ReconConfig::default()).await
    }

    async fn second_transaction(ledger: &mut ReconciliationLedger<MemoryStorage>) -> String {
        let other = TransactionRecord::new(date(), "PIX ACME".to_string(), &dec("250.00"));
        let other_id = other.id.clone();
        ledger.storage_mut().save_transactions(&[other]).await.unwrap();
        other_id
    }

    async fn setup_with(config: ReconConfig) -> (ReconciliationLedger<MemoryStorage>, String) {
        let mut storage = MemoryStorage::new();
        let record = TransactionRecord::new(date(), "PIX ACME".to_string(), &dec("250.00"));
        let id = record.id.clone();
        storage.save_transactions(&[record]).await.unwrap();
        storage.add_candidate(
            CandidateObligation::new(
                "inst-1".to_string(),
                CandidateKind::Installment,
                dec("250.00"),
                date(),
                "ACME".to_string(),
            )
            .with_parent("recv-1"),
        );
        (ReconciliationLedger::new(storage, &config), id)
    }

    #[tokio::test]
    async fn test_match_links_entry_and_settles_candidate() {
        let (mut ledger, id) = setup().await;
        let commit = ledger.apply_match(&id, "inst-1").await.unwrap();

        assert_eq!(commit.transaction.status, ReconciliationStatus::Matched);
        assert_eq!(commit.candidate.status, ObligationStatus::Settled);
        assert!(ledger
            .storage()
            .get_entry(&commit.ledger_entry_id)
            .await
            .unwrap()
            .is_some());

        let aggregate = commit.aggregate.unwrap();
        assert_eq!(aggregate.authoritative, dec("250.00"));
        assert!(!aggregate.corrected);
    }

    #[tokio::test]
    async fn test_consumed_candidate_is_rejected() {
        let (mut ledger, id) = setup().await;
        let other = TransactionRecord::new(date(), "PIX ACME".to_string(), &dec("250.00"));
        let other_id = other.id.clone();
        ledger.storage_mut().save_transactions(&[other]).await.unwrap();

        ledger.apply_match(&id, "inst-1").await.unwrap();
        let err = ledger.apply_match(&other_id, "inst-1").await.unwrap_err();
        assert!(matches!(err, ReconError::CandidateConsumed(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_terminal_states_reject_new_transitions() {
        let (mut ledger, id) = setup().await;
        ledger.apply_ignore(&id, Some("rule-1")).await.unwrap();
        let err = ledger.apply_match(&id, "inst-1").await.unwrap_err();
        assert!(matches!(
            err,
            ReconError::InvalidTransition {
                from: ReconciliationStatus::Ignored,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_undo_restores_pending_without_link() {
        let (mut ledger, id) = setup().await;
        let commit = ledger.apply_match(&id, "inst-1").await.unwrap();
        let outcome = ledger.undo(&id).await.unwrap();

        assert_eq!(outcome.transaction.status, ReconciliationStatus::Pending);
        assert_eq!(outcome.transaction.ledger_entry_id, None);
        assert_eq!(outcome.transaction.matched_candidate_id, None);
        assert_eq!(outcome.deleted_entry.as_deref(), Some(commit.ledger_entry_id.as_str()));
        assert_eq!(outcome.aggregate.unwrap().authoritative, dec("0"));

        let candidate = ledger.storage().get_candidate("inst-1").await.unwrap().unwrap();
        assert!(candidate.is_outstanding());
    }

    #[tokio::test]
    async fn test_undo_of_pending_is_invalid() {
        let (mut ledger, id) = setup().await;
        assert!(matches!(
            ledger.undo(&id).await,
            Err(ReconError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_drift_is_corrected_from_settled_items() {
        let (mut ledger, id) = setup().await;
        // a stale incremental total that the owner never reconciled
        ledger
            .storage_mut()
            .set_aggregate_paid("recv-1", &dec("40.00"))
            .await
            .unwrap();

        let commit = ledger.apply_match(&id, "inst-1").await.unwrap();
        let check = commit.aggregate.unwrap();
        assert_eq!(check.incremental, Some(dec("290.00")));
        assert_eq!(check.authoritative, dec("250.00"));
        assert!(check.corrected);
        assert_eq!(ledger.storage().aggregate_paid("recv-1"), Some(dec("250.00")));
    }

    #[tokio::test]
    async fn test_failed_link_rolls_back_entry_and_claim() {
        let (mut ledger, id) = setup().await;
        ledger.storage_mut().fail_transaction_updates(&id);

        assert!(ledger.apply_match(&id, "inst-1").await.is_err());
        assert_eq!(ledger.storage().entry_count(), 0);
        let candidate = ledger.storage().get_candidate("inst-1").await.unwrap().unwrap();
        assert!(candidate.is_outstanding());
        let transaction = ledger.get_transaction_required(&id).await.unwrap();
        assert!(transaction.is_pending());
    }

    #[tokio::test]
    async fn test_ledger_entry_candidate_is_linked_not_created() {
        let (mut ledger, id) = setup().await;
        ledger.storage_mut().add_candidate(CandidateObligation::new(
            "entry-9".to_string(),
            CandidateKind::LedgerEntry,
            dec("250.00"),
            date(),
            "ACME".to_string(),
        ));

        let commit = ledger.apply_match(&id, "entry-9").await.unwrap();
        assert_eq!(commit.ledger_entry_id, "entry-9");
        assert_eq!(ledger.storage().entry_count(), 0);

        let outcome = ledger.undo(&id).await.unwrap();
        assert_eq!(outcome.deleted_entry, None);
        assert_eq!(outcome.released_candidate.as_deref(), Some("entry-9"));
    }

    #[tokio::test]
    async fn test_failed_undo_keeps_candidate_held() {
        let (mut ledger, id) = setup().await;
        let other_id = second_transaction(&mut ledger).await;
        let commit = ledger.apply_match(&id, "inst-1").await.unwrap();

        ledger.storage().fail_transaction_updates(&id);
        assert!(ledger.undo(&id).await.is_err());

        let err = ledger.apply_match(&other_id, "inst-1").await.unwrap_err();
        assert!(matches!(err, ReconError::CandidateConsumed(_)));

        let stored = ledger.get_transaction_required(&id).await.unwrap();
        assert_eq!(stored.status, ReconciliationStatus::Matched);
        assert_eq!(stored.matched_candidate_id.as_deref(), Some("inst-1"));
        assert!(ledger
            .storage()
            .get_entry(&commit.ledger_entry_id)
            .await
            .unwrap()
            .is_some());
        let candidate = ledger.storage().get_candidate("inst-1").await.unwrap().unwrap();
        assert_eq!(candidate.settled_by.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_undo_never_releases_a_candidate_held_by_another() {
        let (mut ledger, id) = setup().await;
        let other_id = second_transaction(&mut ledger).await;
        let commit = ledger.apply_match(&id, "inst-1").await.unwrap();

        // the owner reassigned the installment behind the engine's back
        let storage = ledger.storage_mut();
        storage.release_candidate("inst-1", &id).await.unwrap();
        storage.claim_candidate("inst-1", 2, &other_id).await.unwrap();

        let err = ledger.undo(&id).await.unwrap_err();
        assert!(matches!(err, ReconError::Conflict(_)));

        let candidate = ledger.storage().get_candidate("inst-1").await.unwrap().unwrap();
        assert_eq!(candidate.settled_by.as_deref(), Some(other_id.as_str()));
        let stored = ledger.get_transaction_required(&id).await.unwrap();
        assert_eq!(stored.status, ReconciliationStatus::Matched);
        assert_eq!(
            stored.ledger_entry_id.as_deref(),
            Some(commit.ledger_entry_id.as_str())
        );
        assert_eq!(ledger.storage().entry_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_retries_after_conflict() {
        let (mut ledger, id) = setup().await;
        ledger.storage().conflict_claims("inst-1", 2);

        let commit = ledger.apply_match(&id, "inst-1").await.unwrap();
        assert_eq!(commit.candidate.settled_by.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_claim_gives_up_after_max_retries() {
        let (mut ledger, id) = setup().await;
        // the first attempt plus three retries
        ledger.storage().conflict_claims("inst-1", 4);

        let err = ledger.apply_match(&id, "inst-1").await.unwrap_err();
        assert!(matches!(err, ReconError::Conflict(_)));
        assert!(err.is_recoverable());
        assert_eq!(ledger.storage().entry_count(), 0);
        assert!(ledger.get_transaction_required(&id).await.unwrap().is_pending());

        // conflicts are exhausted, a later attempt goes through
        assert!(ledger.apply_match(&id, "inst-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_timed_out_settlement_entry_is_rolled_back() {
        let (mut ledger, id) = setup_with(quick_timeouts()).await;
        ledger
            .storage()
            .stall_entries_containing("PIX ACME", Duration::from_millis(200));

        let err = ledger.apply_match(&id, "inst-1").await.unwrap_err();
        assert!(matches!(err, ReconError::Timeout(_)));
        assert_eq!(ledger.storage().entry_count(), 0);
        let candidate = ledger.storage().get_candidate("inst-1").await.unwrap().unwrap();
        assert!(candidate.is_outstanding());
        assert!(ledger.get_transaction_required(&id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_failed_rule_link_rolls_back_entry() {
        let (mut ledger, id) = setup().await;
        let transaction = ledger.get_transaction_required(&id).await.unwrap();
        ledger.storage().fail_transaction_updates(&id);

        let entry = LedgerEntry::for_transaction(
            &transaction,
            Direction::Credit,
            Some("Interest income".to_string()),
            EntryOrigin::Rule("rule-1".to_string()),
        );
        assert!(ledger.apply_entry(&id, entry, "rule-1").await.is_err());
        assert_eq!(ledger.storage().entry_count(), 0);
        assert!(ledger.get_transaction_required(&id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_timed_out_rule_entry_is_rolled_back() {
        let (mut ledger, id) = setup_with(quick_timeouts()).await;
        let transaction = ledger.get_transaction_required(&id).await.unwrap();
        ledger
            .storage()
            .stall_entries_containing("PIX ACME", Duration::from_millis(200));

        let entry = LedgerEntry::for_transaction(
            &transaction,
            Direction::Credit,
            None,
            EntryOrigin::Rule("rule-1".to_string()),
        );
        let err = ledger.apply_entry(&id, entry, "rule-1").await.unwrap_err();
        assert!(matches!(err, ReconError::Timeout(_)));
        assert_eq!(ledger.storage().entry_count(), 0);
    }
}
