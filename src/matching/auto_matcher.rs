//! Batch assignment of transactions to candidates

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::{ReconConfig, ScoringConfig};
use crate::matching::MatchScorer;
use crate::reconciliation::ReconciliationLedger;
use crate::traits::*;
use crate::types::*;

/// Outcome of committing auto-applicable proposals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoApplyReport {
    /// Proposals committed as matches
    pub applied: Vec<MatchResult>,
    /// Proposals below the top tier, left for confirmation
    pub advisory: Vec<MatchResult>,
    /// Proposals that failed to commit, with the reason
    pub failed: Vec<(MatchResult, String)>,
}

/// A scored pair kept for assignment
struct ScoredPair<'a> {
    transaction: &'a TransactionRecord,
    candidate: &'a CandidateObligation,
    score: u8,
    factors: Vec<MatchFactor>,
}

/// Greedy bipartite matcher: highest score first, each side used once
#[derive(Debug, Clone)]
pub struct AutoMatcher {
    scorer: MatchScorer,
    scoring: ScoringConfig,
}

impl AutoMatcher {
    pub fn new(config: &ReconConfig) -> Self {
        Self {
            scorer: MatchScorer::new(config),
            scoring: config.scoring.clone(),
        }
    }

    /// Propose a conflict-free set of matches against one kind of candidate.
    ///
    /// Only pending transactions and outstanding candidates not already in the
    /// working set are considered, so re-running over a partially resolved
    /// batch never proposes anything twice.
    pub fn propose(
        &self,
        transactions: &[TransactionRecord],
        candidates: &[CandidateObligation],
        working: &WorkingSet,
    ) -> ReconResult<Vec<MatchResult>> {
        let Some(kind) = pool_kind(candidates)? else {
            return Ok(Vec::new());
        };
        let threshold = self.scoring.min_score_for(kind);

        let open_transactions: Vec<&TransactionRecord> = transactions
            .iter()
            .filter(|t| t.is_pending() && !working.is_resolved(&t.id))
            .collect();
        let open_candidates: Vec<&CandidateObligation> = candidates
            .iter()
            .filter(|c| c.is_outstanding() && !working.is_consumed(&c.id))
            .collect();

        let mut pairs = Vec::new();
        for &transaction in &open_transactions {
            for &candidate in &open_candidates {
                if let Some(score) = self.scorer.score(transaction, candidate) {
                    if score.value >= threshold {
                        pairs.push(ScoredPair {
                            transaction,
                            candidate,
                            score: score.value,
                            factors: score.factors,
                        });
                    }
                }
            }
        }

        pairs.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.transaction.date.cmp(&b.transaction.date))
                .then_with(|| a.candidate.id.cmp(&b.candidate.id))
                .then_with(|| a.transaction.id.cmp(&b.transaction.id))
        });

        let mut used_transactions = HashSet::new();
        let mut used_candidates = HashSet::new();
        let mut results = Vec::new();
        for pair in pairs {
            if used_transactions.contains(pair.transaction.id.as_str())
                || used_candidates.contains(pair.candidate.id.as_str())
            {
                continue;
            }
            used_transactions.insert(pair.transaction.id.as_str());
            used_candidates.insert(pair.candidate.id.as_str());
            results.push(MatchResult {
                transaction_id: pair.transaction.id.clone(),
                candidate_id: pair.candidate.id.clone(),
                candidate_kind: kind,
                score: pair.score,
                tier: self.scoring.tier_for(pair.score),
                factors: pair.factors,
            });
        }

        info!(
            %kind,
            transactions = open_transactions.len(),
            candidates = open_candidates.len(),
            proposals = results.len(),
            "match proposals computed"
        );
        Ok(results)
    }

    /// Commit the auto-applicable proposals one at a time.
    ///
    /// Anything below the top tier is returned as advisory. A failed commit
    /// is recorded and the remaining proposals still run.
    pub async fn apply<S>(
        &self,
        ledger: &mut ReconciliationLedger<S>,
        proposals: Vec<MatchResult>,
        working: &mut WorkingSet,
    ) -> AutoApplyReport
    where
        S: StatementStorage + ObligationStorage + EntryStorage,
    {
        let mut report = AutoApplyReport::default();
        for proposal in proposals {
            if !proposal.is_auto_applicable() {
                report.advisory.push(proposal);
                continue;
            }
            match ledger
                .apply_match(&proposal.transaction_id, &proposal.candidate_id)
                .await
            {
                Ok(_) => {
                    working.consume(&proposal.transaction_id, &proposal.candidate_id);
                    debug!(
                        transaction_id = %proposal.transaction_id,
                        candidate_id = %proposal.candidate_id,
                        score = proposal.score,
                        "match auto-applied"
                    );
                    report.applied.push(proposal);
                }
                Err(e) => {
                    warn!(
                        transaction_id = %proposal.transaction_id,
                        candidate_id = %proposal.candidate_id,
                        error = %e,
                        recoverable = e.is_recoverable(),
                        "auto-apply failed"
                    );
                    report.failed.push((proposal, e.to_string()));
                }
            }
        }
        report
    }
}

/// The single kind shared by every candidate, `None` for an empty pool
fn pool_kind(candidates: &[CandidateObligation]) -> ReconResult<Option<CandidateKind>> {
    let Some(first) = candidates.first() else {
        return Ok(None);
    };
    if let Some(other) = candidates.iter().find(|c| c.kind != first.kind) {
        return Err(ReconError::MixedCandidatePool(first.kind, other.kind));
    }
    Ok(Some(first.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn credit(id: &str, day: u32, amount: &str) -> TransactionRecord {
        let mut record = TransactionRecord::new(
            date(day),
            format!("DEPOSIT {id}"),
            &BigDecimal::from_str(amount).unwrap(),
        );
        record.id = id.to_string();
        record
    }

    fn candidate(id: &str, kind: CandidateKind, day: u32, amount: &str) -> CandidateObligation {
        CandidateObligation::new(
            id.to_string(),
            kind,
            BigDecimal::from_str(amount).unwrap(),
            date(day),
            "Customer".to_string(),
        )
    }

    #[test]
    fn test_greedy_assigns_best_pairs_first() {
        let matcher = AutoMatcher::new(&ReconConfig::default());
        let transactions = vec![credit("t1", 10, "100.00"), credit("t2", 10, "100.00")];
        // c1 is a same-date exact match for both, c2 only near-date
        let candidates = vec![
            candidate("c2", CandidateKind::Installment, 11, "100.00"),
            candidate("c1", CandidateKind::Installment, 10, "100.00"),
        ];
        let results = matcher
            .propose(&transactions, &candidates, &WorkingSet::new())
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].candidate_id, "c1");
        assert_eq!(results[0].transaction_id, "t1");
        assert_eq!(results[0].score, 90);
        assert_eq!(results[1].candidate_id, "c2");
        assert_eq!(results[1].transaction_id, "t2");
    }

    #[test]
    fn test_no_candidate_is_proposed_twice() {
        let matcher = AutoMatcher::new(&ReconConfig::default());
        let transactions: Vec<_> = (1..=5)
            .map(|i| credit(&format!("t{i}"), 10, "250.00"))
            .collect();
        let candidates = vec![
            candidate("c1", CandidateKind::Installment, 10, "250.00"),
            candidate("c2", CandidateKind::Installment, 9, "250.00"),
        ];
        let results = matcher
            .propose(&transactions, &candidates, &WorkingSet::new())
            .unwrap();
        let ids: HashSet<_> = results.iter().map(|r| r.candidate_id.as_str()).collect();
        assert_eq!(results.len(), 2);
        assert_eq!(ids.len(), results.len());
    }

    #[test]
    fn test_tie_break_by_earliest_date_then_candidate_id() {
        let matcher = AutoMatcher::new(&ReconConfig::default());
        let transactions = vec![credit("late", 12, "80.00"), credit("early", 11, "80.00")];
        let candidates = vec![
            candidate("b", CandidateKind::Installment, 12, "80.00"),
            candidate("a", CandidateKind::Installment, 11, "80.00"),
        ];
        let results = matcher
            .propose(&transactions, &candidates, &WorkingSet::new())
            .unwrap();
        // early/a and late/b are both same-date 90s: earliest transaction first
        assert_eq!(results[0].transaction_id, "early");
        assert_eq!(results[0].candidate_id, "a");
        assert_eq!(results[1].transaction_id, "late");
        assert_eq!(results[1].candidate_id, "b");
    }

    #[test]
    fn test_resolved_items_are_not_reconsidered() {
        let matcher = AutoMatcher::new(&ReconConfig::default());
        let mut matched = credit("t1", 10, "100.00");
        matched.status = ReconciliationStatus::Matched;
        let transactions = vec![matched, credit("t2", 10, "100.00")];
        let candidates = vec![
            candidate("c1", CandidateKind::Installment, 10, "100.00"),
            candidate("c2", CandidateKind::Installment, 10, "100.00"),
        ];
        let mut working = WorkingSet::new();
        working.consume("t1", "c1");
        let results = matcher.propose(&transactions, &candidates, &working).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].transaction_id, "t2");
        assert_eq!(results[0].candidate_id, "c2");
    }

    #[test]
    fn test_threshold_depends_on_candidate_kind() {
        let matcher = AutoMatcher::new(&ReconConfig::default());
        // approximate value + within week: 30 + 5 + text
        let transactions = vec![credit("t1", 15, "103.00")];
        let installments = vec![candidate("i1", CandidateKind::Installment, 10, "100.00")];
        let entries = vec![candidate("e1", CandidateKind::LedgerEntry, 10, "100.00")];

        let mut close = transactions.clone();
        close[0].date = date(11);
        // 30 + 20 = 50: above the installment floor, below the ledger-entry floor
        assert_eq!(
            matcher.propose(&close, &installments, &WorkingSet::new()).unwrap().len(),
            1
        );
        assert!(matcher
            .propose(&close, &entries, &WorkingSet::new())
            .unwrap()
            .is_empty());
        assert!(matcher
            .propose(&transactions, &installments, &WorkingSet::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_mixed_pool_is_rejected() {
        let matcher = AutoMatcher::new(&ReconConfig::default());
        let candidates = vec![
            candidate("i1", CandidateKind::Installment, 10, "1.00"),
            candidate("e1", CandidateKind::LedgerEntry, 10, "1.00"),
        ];
        let err = matcher
            .propose(&[credit("t1", 10, "1.00")], &candidates, &WorkingSet::new())
            .unwrap_err();
        assert!(matches!(err, ReconError::MixedCandidatePool(_, _)));
    }
}
