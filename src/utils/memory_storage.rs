//! In-memory storage implementation for testing

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::traits::*;
use crate::types::*;

#[derive(Debug, Default)]
struct FailureHooks {
    entry_patterns: Vec<String>,
    transaction_updates: HashSet<String>,
    /// Remaining forced version conflicts per candidate
    claim_conflicts: HashMap<String, u32>,
    /// Entries are written, then the call stalls for the duration
    slow_entries: Vec<(String, Duration)>,
}

/// In-memory storage implementation for testing and development
///
/// Backs every storage trait of the engine. Clones share state, so a test can
/// hold one handle while the ledger owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    /// Kept in insertion order so statement listings read like the file
    transactions: Arc<RwLock<Vec<TransactionRecord>>>,
    candidates: Arc<RwLock<HashMap<String, CandidateObligation>>>,
    aggregates: Arc<RwLock<HashMap<String, BigDecimal>>>,
    entries: Arc<RwLock<HashMap<String, LedgerEntry>>>,
    rules: Arc<RwLock<Vec<Rule>>>,
    hooks: Arc<RwLock<FailureHooks>>,
}

fn read<T>(lock: &RwLock<T>) -> ReconResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| ReconError::Storage("memory storage lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> ReconResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| ReconError::Storage("memory storage lock poisoned".to_string()))
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a candidate obligation owned by an external collaborator
    pub fn add_candidate(&self, candidate: CandidateObligation) {
        if let Ok(mut candidates) = self.candidates.write() {
            candidates.insert(candidate.id.clone(), candidate);
        }
    }

    /// Stored paid total of an aggregate
    pub fn aggregate_paid(&self, parent_id: &str) -> Option<BigDecimal> {
        self.aggregates.read().ok()?.get(parent_id).cloned()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    /// Make `create_entry` fail for entries whose description contains `pattern`
    pub fn reject_entries_containing(&self, pattern: &str) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.entry_patterns.push(pattern.to_lowercase());
        }
    }

    /// Make `update_transaction` fail for one transaction
    pub fn fail_transaction_updates(&self, transaction_id: &str) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.transaction_updates.insert(transaction_id.to_string());
        }
    }

    /// Make the next `times` claims of a candidate fail with a version conflict
    pub fn conflict_claims(&self, candidate_id: &str, times: u32) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.claim_conflicts.insert(candidate_id.to_string(), times);
        }
    }

    /// Make `create_entry` store matching entries and then stall for `delay`
    pub fn stall_entries_containing(&self, pattern: &str, delay: Duration) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.slow_entries.push((pattern.to_lowercase(), delay));
        }
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) {
        if let Ok(mut t) = self.transactions.write() {
            t.clear();
        }
        if let Ok(mut c) = self.candidates.write() {
            c.clear();
        }
        if let Ok(mut a) = self.aggregates.write() {
            a.clear();
        }
        if let Ok(mut e) = self.entries.write() {
            e.clear();
        }
        if let Ok(mut r) = self.rules.write() {
            r.clear();
        }
        if let Ok(mut h) = self.hooks.write() {
            *h = FailureHooks::default();
        }
    }
}

#[async_trait]
impl StatementStorage for MemoryStorage {
    async fn save_transactions(&mut self, transactions: &[TransactionRecord]) -> ReconResult<()> {
        let mut stored = write(&self.transactions)?;
        for transaction in transactions {
            match stored.iter_mut().find(|t| t.id == transaction.id) {
                Some(existing) => *existing = transaction.clone(),
                None => stored.push(transaction.clone()),
            }
        }
        Ok(())
    }

    async fn get_transaction(&self, transaction_id: &str) -> ReconResult<Option<TransactionRecord>> {
        Ok(read(&self.transactions)?
            .iter()
            .find(|t| t.id == transaction_id)
            .cloned())
    }

    async fn update_transaction(&mut self, transaction: &TransactionRecord) -> ReconResult<()> {
        if read(&self.hooks)?
            .transaction_updates
            .contains(&transaction.id)
        {
            return Err(ReconError::Storage(format!(
                "update rejected for transaction {}",
                transaction.id
            )));
        }
        let mut stored = write(&self.transactions)?;
        match stored.iter_mut().find(|t| t.id == transaction.id) {
            Some(existing) => {
                *existing = transaction.clone();
                Ok(())
            }
            None => Err(ReconError::TransactionNotFound(transaction.id.clone())),
        }
    }

    async fn list_transactions(
        &self,
        statement_id: &str,
        status: Option<ReconciliationStatus>,
    ) -> ReconResult<Vec<TransactionRecord>> {
        Ok(read(&self.transactions)?
            .iter()
            .filter(|t| t.statement_id == statement_id)
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect())
    }

    async fn find_by_document_id(
        &self,
        account_id: Option<&str>,
        document_id: &str,
    ) -> ReconResult<Option<TransactionRecord>> {
        Ok(read(&self.transactions)?
            .iter()
            .find(|t| {
                t.account_id.as_deref() == account_id
                    && t.document_id.as_deref() == Some(document_id)
            })
            .cloned())
    }
}

#[async_trait]
impl ObligationStorage for MemoryStorage {
    async fn list_candidates(
        &self,
        kind: CandidateKind,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> ReconResult<Vec<CandidateObligation>> {
        let mut listed: Vec<CandidateObligation> = read(&self.candidates)?
            .values()
            .filter(|c| c.kind == kind && c.is_outstanding())
            .filter(|c| c.date >= start_date && c.date <= end_date)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(listed)
    }

    async fn get_candidate(&self, candidate_id: &str) -> ReconResult<Option<CandidateObligation>> {
        Ok(read(&self.candidates)?.get(candidate_id).cloned())
    }

    async fn claim_candidate(
        &mut self,
        candidate_id: &str,
        expected_version: u64,
        transaction_id: &str,
    ) -> ReconResult<CandidateObligation> {
        if let Some(remaining) = write(&self.hooks)?.claim_conflicts.get_mut(candidate_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ReconError::Conflict(format!(
                    "candidate {candidate_id} was modified concurrently"
                )));
            }
        }

        let mut candidates = write(&self.candidates)?;
        let candidate = candidates
            .get_mut(candidate_id)
            .ok_or_else(|| ReconError::CandidateNotFound(candidate_id.to_string()))?;

        if candidate.version != expected_version {
            return Err(ReconError::Conflict(format!(
                "candidate {candidate_id} is at version {}, expected {expected_version}",
                candidate.version
            )));
        }
        if !candidate.is_outstanding() {
            return Err(ReconError::CandidateConsumed(candidate_id.to_string()));
        }

        candidate.status = ObligationStatus::Settled;
        candidate.settled_by = Some(transaction_id.to_string());
        candidate.version += 1;
        Ok(candidate.clone())
    }

    async fn release_candidate(
        &mut self,
        candidate_id: &str,
        transaction_id: &str,
    ) -> ReconResult<()> {
        let mut candidates = write(&self.candidates)?;
        let candidate = candidates
            .get_mut(candidate_id)
            .ok_or_else(|| ReconError::CandidateNotFound(candidate_id.to_string()))?;
        if candidate.is_outstanding() {
            return Ok(());
        }
        if candidate.settled_by.as_deref() != Some(transaction_id) {
            return Err(ReconError::Conflict(format!(
                "candidate {candidate_id} is settled by {}, not {transaction_id}",
                candidate.settled_by.as_deref().unwrap_or("another transaction")
            )));
        }
        candidate.status = ObligationStatus::Outstanding;
        candidate.settled_by = None;
        candidate.version += 1;
        Ok(())
    }

    async fn adjust_aggregate_paid(
        &mut self,
        parent_id: &str,
        delta: &BigDecimal,
    ) -> ReconResult<BigDecimal> {
        let mut aggregates = write(&self.aggregates)?;
        let paid = aggregates
            .entry(parent_id.to_string())
            .or_insert_with(|| BigDecimal::from(0));
        *paid += delta;
        Ok(paid.clone())
    }

    async fn recompute_aggregate_paid(&self, parent_id: &str) -> ReconResult<BigDecimal> {
        Ok(read(&self.candidates)?
            .values()
            .filter(|c| c.parent_id.as_deref() == Some(parent_id) && !c.is_outstanding())
            .fold(BigDecimal::from(0), |total, c| total + &c.amount))
    }

    async fn set_aggregate_paid(&mut self, parent_id: &str, paid: &BigDecimal) -> ReconResult<()> {
        write(&self.aggregates)?.insert(parent_id.to_string(), paid.clone());
        Ok(())
    }
}

#[async_trait]
impl EntryStorage for MemoryStorage {
    async fn create_entry(&mut self, entry: &LedgerEntry) -> ReconResult<()> {
        let description = entry.description.to_lowercase();
        let stall = {
            let hooks = read(&self.hooks)?;
            if hooks
                .entry_patterns
                .iter()
                .any(|pattern| description.contains(pattern))
            {
                return Err(ReconError::Storage(format!(
                    "entry rejected for transaction {}",
                    entry.transaction_id
                )));
            }
            hooks
                .slow_entries
                .iter()
                .find(|(pattern, _)| description.contains(pattern))
                .map(|(_, delay)| *delay)
        };
        write(&self.entries)?.insert(entry.id.clone(), entry.clone());
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn get_entry(&self, entry_id: &str) -> ReconResult<Option<LedgerEntry>> {
        Ok(read(&self.entries)?.get(entry_id).cloned())
    }

    async fn delete_entry(&mut self, entry_id: &str) -> ReconResult<()> {
        write(&self.entries)?.remove(entry_id);
        Ok(())
    }
}

#[async_trait]
impl RuleStorage for MemoryStorage {
    async fn list_rules(&self, owner_id: &str) -> ReconResult<Vec<Rule>> {
        let mut rules: Vec<Rule> = read(&self.rules)?
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn count_rules(&self, owner_id: &str) -> ReconResult<usize> {
        Ok(read(&self.rules)?
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .count())
    }

    async fn insert_rules(&mut self, rules: &[Rule]) -> ReconResult<()> {
        write(&self.rules)?.extend_from_slice(rules);
        Ok(())
    }

    async fn record_rule_hit(&mut self, rule_id: &str) -> ReconResult<()> {
        let mut rules = write(&self.rules)?;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| ReconError::Validation(format!("Rule not found: {rule_id}")))?;
        rule.times_applied += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn installment(id: &str, day: u32) -> CandidateObligation {
        CandidateObligation::new(
            id.to_string(),
            CandidateKind::Installment,
            BigDecimal::from_str("100.00").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            "Customer".to_string(),
        )
        .with_parent("recv-1")
    }

    #[tokio::test]
    async fn test_claim_checks_version_then_status() {
        let mut storage = MemoryStorage::new();
        storage.add_candidate(installment("i1", 5));

        let claimed = storage.claim_candidate("i1", 0, "t1").await.unwrap();
        assert_eq!(claimed.version, 1);
        assert_eq!(claimed.settled_by.as_deref(), Some("t1"));

        let stale = storage.claim_candidate("i1", 0, "t2").await.unwrap_err();
        assert!(matches!(stale, ReconError::Conflict(_)));
        let consumed = storage.claim_candidate("i1", 1, "t2").await.unwrap_err();
        assert!(matches!(consumed, ReconError::CandidateConsumed(_)));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let mut storage = MemoryStorage::new();
        storage.add_candidate(installment("i1", 5));
        storage.claim_candidate("i1", 0, "t1").await.unwrap();

        storage.release_candidate("i1", "t1").await.unwrap();
        storage.release_candidate("i1", "t1").await.unwrap();
        let candidate = storage.get_candidate("i1").await.unwrap().unwrap();
        assert!(candidate.is_outstanding());
        assert_eq!(candidate.version, 2);
    }

    #[tokio::test]
    async fn test_release_by_other_transaction_conflicts() {
        let mut storage = MemoryStorage::new();
        storage.add_candidate(installment("i1", 5));
        storage.claim_candidate("i1", 0, "t2").await.unwrap();

        let err = storage.release_candidate("i1", "t1").await.unwrap_err();
        assert!(matches!(err, ReconError::Conflict(_)));
        let candidate = storage.get_candidate("i1").await.unwrap().unwrap();
        assert_eq!(candidate.settled_by.as_deref(), Some("t2"));
        assert_eq!(candidate.version, 1);
    }

    #[tokio::test]
    async fn test_forced_conflicts_run_out() {
        let mut storage = MemoryStorage::new();
        storage.add_candidate(installment("i1", 5));
        storage.conflict_claims("i1", 1);

        let err = storage.claim_candidate("i1", 0, "t1").await.unwrap_err();
        assert!(matches!(err, ReconError::Conflict(_)));
        assert!(storage.claim_candidate("i1", 0, "t1").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_candidates_filters_window_and_status() {
        let mut storage = MemoryStorage::new();
        storage.add_candidate(installment("late", 20));
        storage.add_candidate(installment("b", 10));
        storage.add_candidate(installment("a", 10));
        storage.add_candidate(installment("settled", 11));
        storage.claim_candidate("settled", 0, "t1").await.unwrap();

        let listed = storage
            .list_candidates(
                CandidateKind::Installment,
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            )
            .await
            .unwrap();
        let ids: Vec<_> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(
            storage.recompute_aggregate_paid("recv-1").await.unwrap(),
            BigDecimal::from_str("100.00").unwrap()
        );
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let storage = MemoryStorage::new();
        let mut handle = storage.clone();
        let record = TransactionRecord::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            "DEPOSIT".to_string(),
            &BigDecimal::from(10),
        );
        handle.save_transactions(&[record.clone()]).await.unwrap();
        assert!(storage.get_transaction(&record.id).await.unwrap().is_some());

        storage.clear();
        assert!(handle.get_transaction(&record.id).await.unwrap().is_none());
    }
}
