//! Traits for storage abstraction and extensibility

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;

use crate::types::*;

/// Storage for imported statement transactions
///
/// This trait allows the reconciliation engine to work with any storage
/// backend (PostgreSQL, SQLite, in-memory, etc.) by implementing these methods.
#[async_trait]
pub trait StatementStorage: Send + Sync {
    /// Save newly imported transaction records
    async fn save_transactions(&mut self, transactions: &[TransactionRecord]) -> ReconResult<()>;

    /// Get a transaction record by ID
    async fn get_transaction(&self, transaction_id: &str) -> ReconResult<Option<TransactionRecord>>;

    /// Update a transaction record
    async fn update_transaction(&mut self, transaction: &TransactionRecord) -> ReconResult<()>;

    /// List the records of one statement, optionally filtered by status
    async fn list_transactions(
        &self,
        statement_id: &str,
        status: Option<ReconciliationStatus>,
    ) -> ReconResult<Vec<TransactionRecord>>;

    /// Find an already imported record by account and external document id
    async fn find_by_document_id(
        &self,
        account_id: Option<&str>,
        document_id: &str,
    ) -> ReconResult<Option<TransactionRecord>>;
}

/// Access to installments, payables and unreconciled ledger entries.
///
/// Candidates are owned by external collaborators; the engine only claims,
/// releases and asks for aggregate updates.
#[async_trait]
pub trait ObligationStorage: Send + Sync {
    /// List outstanding candidates of one kind with a date inside the window
    async fn list_candidates(
        &self,
        kind: CandidateKind,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> ReconResult<Vec<CandidateObligation>>;

    /// Get a candidate by ID
    async fn get_candidate(&self, candidate_id: &str) -> ReconResult<Option<CandidateObligation>>;

    /// Mark a candidate settled by a transaction.
    ///
    /// Fails with [`ReconError::Conflict`] when `expected_version` is stale and
    /// [`ReconError::CandidateConsumed`] when it is already settled.
    async fn claim_candidate(
        &mut self,
        candidate_id: &str,
        expected_version: u64,
        transaction_id: &str,
    ) -> ReconResult<CandidateObligation>;

    /// Return a candidate settled by `transaction_id` to outstanding.
    ///
    /// An outstanding candidate is left untouched. One settled by a different
    /// transaction fails with [`ReconError::Conflict`].
    async fn release_candidate(&mut self, candidate_id: &str, transaction_id: &str)
        -> ReconResult<()>;

    /// Apply an incremental change to an aggregate's paid total and return the new total
    async fn adjust_aggregate_paid(
        &mut self,
        parent_id: &str,
        delta: &BigDecimal,
    ) -> ReconResult<BigDecimal>;

    /// Recompute an aggregate's paid total from the full set of settled items
    async fn recompute_aggregate_paid(&self, parent_id: &str) -> ReconResult<BigDecimal>;

    /// Overwrite an aggregate's paid total
    async fn set_aggregate_paid(&mut self, parent_id: &str, paid: &BigDecimal) -> ReconResult<()>;
}

/// Storage for ledger entries
#[async_trait]
pub trait EntryStorage: Send + Sync {
    /// Create a new ledger entry
    async fn create_entry(&mut self, entry: &LedgerEntry) -> ReconResult<()>;

    /// Get an entry by ID
    async fn get_entry(&self, entry_id: &str) -> ReconResult<Option<LedgerEntry>>;

    /// Delete an entry (rollback of a failed link or undo of a match)
    async fn delete_entry(&mut self, entry_id: &str) -> ReconResult<()>;
}

/// Storage for automation rules
#[async_trait]
pub trait RuleStorage: Send + Sync {
    /// List rules of an owner sorted by priority
    async fn list_rules(&self, owner_id: &str) -> ReconResult<Vec<Rule>>;

    /// Count rules of an owner
    async fn count_rules(&self, owner_id: &str) -> ReconResult<usize>;

    /// Insert rules
    async fn insert_rules(&mut self, rules: &[Rule]) -> ReconResult<()>;

    /// Increment a rule's usage counter
    async fn record_rule_hit(&mut self, rule_id: &str) -> ReconResult<()>;
}

/// Trait for implementing custom rule validation
pub trait RuleValidator: Send + Sync {
    /// Validate a rule before it is stored or evaluated
    fn validate_rule(&self, rule: &Rule) -> ReconResult<()>;
}

/// Default rule validator with basic checks
pub struct DefaultRuleValidator;

impl RuleValidator for DefaultRuleValidator {
    fn validate_rule(&self, rule: &Rule) -> ReconResult<()> {
        if rule.pattern.trim().is_empty() {
            return Err(ReconError::Validation(
                "Rule pattern cannot be empty".to_string(),
            ));
        }

        if let RuleAction::CreateEntry { category, .. } = &rule.action {
            if category.trim().is_empty() {
                return Err(ReconError::Validation(format!(
                    "Rule '{}' creates entries but has no category",
                    rule.pattern
                )));
            }
        }

        Ok(())
    }
}
