//! Advisory anomaly detection over unresolved deposits and pending installments
//!
//! Nothing here mutates state. The detector only reports patterns that need a
//! human decision: duplicate deposits, partial payments, overpayments and
//! deposits that only settle an installment when summed in pairs.

use bigdecimal::{BigDecimal, ToPrimitive};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::{AnomalyConfig, ReconConfig, ToleranceConfig};
use crate::types::*;

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    tolerance: ToleranceConfig,
    bands: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: &ReconConfig) -> Self {
        Self {
            tolerance: config.tolerance.clone(),
            bands: config.anomaly.clone(),
        }
    }

    /// Run every check. Only pending credits and outstanding installments are considered.
    pub fn detect(
        &self,
        transactions: &[TransactionRecord],
        installments: &[CandidateObligation],
    ) -> Vec<Anomaly> {
        self.detect_with_settled(transactions, installments, &[])
    }

    /// Like [`detect`](Self::detect), with deposits already matched in the same
    /// batch and the installment each one took.
    ///
    /// Settled pairs only count toward duplicate groups: a second 500.00
    /// deposit is a duplicate even when the first one already took the only
    /// 500.00 installment.
    pub fn detect_with_settled(
        &self,
        transactions: &[TransactionRecord],
        installments: &[CandidateObligation],
        settled: &[(&TransactionRecord, &CandidateObligation)],
    ) -> Vec<Anomaly> {
        let deposits: Vec<&TransactionRecord> = transactions
            .iter()
            .filter(|t| t.is_pending() && t.direction == Direction::Credit)
            .collect();
        let pending: Vec<&CandidateObligation> = installments
            .iter()
            .filter(|c| c.kind == CandidateKind::Installment && c.is_outstanding())
            .filter(|c| c.amount > BigDecimal::from(0))
            .collect();

        let mut anomalies = Vec::new();
        let mut flagged: HashSet<String> = HashSet::new();

        for anomaly in self.duplicates(&deposits, &pending, settled) {
            flagged.extend(anomaly.transaction_ids().into_iter().map(str::to_string));
            anomalies.push(anomaly);
        }

        let partials: Vec<Anomaly> = deposits
            .iter()
            .filter(|t| !flagged.contains(t.id.as_str()))
            .filter_map(|t| self.partial(t, &pending))
            .collect();
        for anomaly in partials {
            flagged.extend(anomaly.transaction_ids().into_iter().map(str::to_string));
            anomalies.push(anomaly);
        }

        let overpayments: Vec<Anomaly> = deposits
            .iter()
            .filter(|t| !flagged.contains(t.id.as_str()))
            .filter_map(|t| self.overpayment(t, &pending))
            .collect();
        anomalies.extend(overpayments);

        anomalies.extend(self.grouped(&deposits, &pending));

        info!(
            deposits = deposits.len(),
            installments = pending.len(),
            settled = settled.len(),
            anomalies = anomalies.len(),
            "anomaly scan finished"
        );
        anomalies
    }

    /// Same-amount deposits outnumbering the installments of that amount.
    ///
    /// A group needs at least two deposits and one of them still pending.
    fn duplicates(
        &self,
        deposits: &[&TransactionRecord],
        installments: &[&CandidateObligation],
        settled: &[(&TransactionRecord, &CandidateObligation)],
    ) -> Vec<Anomaly> {
        let mut groups: BTreeMap<BigDecimal, Vec<&TransactionRecord>> = BTreeMap::new();
        for &deposit in deposits {
            groups
                .entry(deposit.amount.round(2))
                .or_default()
                .push(deposit);
        }
        let mut by_amount: BTreeMap<BigDecimal, Vec<&str>> = BTreeMap::new();
        for &installment in installments {
            by_amount
                .entry(installment.amount.round(2))
                .or_default()
                .push(installment.id.as_str());
        }
        for &(deposit, installment) in settled {
            if deposit.direction != Direction::Credit {
                continue;
            }
            if let Some(group) = groups.get_mut(&deposit.amount.round(2)) {
                group.push(deposit);
            }
            by_amount
                .entry(installment.amount.round(2))
                .or_default()
                .push(installment.id.as_str());
        }

        groups
            .into_iter()
            .filter(|(_, group)| group.len() >= 2)
            .filter_map(|(amount, group)| {
                let installment_ids: Vec<String> = by_amount
                    .get(&amount)
                    .map(|ids| ids.iter().map(|id| id.to_string()).collect())
                    .unwrap_or_default();
                if group.len() <= installment_ids.len() {
                    return None;
                }
                debug!(
                    %amount,
                    deposits = group.len(),
                    installments = installment_ids.len(),
                    "duplicate deposits"
                );
                Some(Anomaly::Duplicate {
                    transaction_ids: group.iter().map(|t| t.id.clone()).collect(),
                    amount,
                    installment_ids,
                })
            })
            .collect()
    }

    fn partial(
        &self,
        deposit: &TransactionRecord,
        installments: &[&CandidateObligation],
    ) -> Option<Anomaly> {
        installments.iter().find_map(|installment| {
            let ratio = &deposit.amount / &installment.amount;
            if ratio >= self.bands.partial_min && ratio < self.bands.partial_max {
                Some(Anomaly::Partial {
                    transaction_id: deposit.id.clone(),
                    installment_id: installment.id.clone(),
                    shortfall: &installment.amount - &deposit.amount,
                    percentage: as_percentage(&ratio),
                })
            } else {
                None
            }
        })
    }

    fn overpayment(
        &self,
        deposit: &TransactionRecord,
        installments: &[&CandidateObligation],
    ) -> Option<Anomaly> {
        installments.iter().find_map(|installment| {
            let ratio = &deposit.amount / &installment.amount;
            if ratio > self.bands.overpayment_min && ratio <= self.bands.overpayment_max {
                Some(Anomaly::Overpayment {
                    transaction_id: deposit.id.clone(),
                    installment_id: installment.id.clone(),
                    surplus: &deposit.amount - &installment.amount,
                    percentage: as_percentage(&ratio),
                })
            } else {
                None
            }
        })
    }

    /// Pairs of deposits whose sum settles an installment.
    ///
    /// Deposits that exactly match some installment on their own are left
    /// out. Each deposit and each installment appears in at most one pair.
    /// Installments are indexed by minor units so each pair costs one range
    /// lookup.
    fn grouped(
        &self,
        deposits: &[&TransactionRecord],
        installments: &[&CandidateObligation],
    ) -> Vec<Anomaly> {
        let exact = to_minor_units(&self.tolerance.exact).unwrap_or(0);
        let tolerance = to_minor_units(&self.tolerance.grouped).unwrap_or(0);

        let mut index: BTreeMap<i64, Vec<&CandidateObligation>> = BTreeMap::new();
        for &installment in installments {
            if let Some(cents) = to_minor_units(&installment.amount) {
                index.entry(cents).or_default().push(installment);
            }
        }

        let mut candidates: Vec<(&TransactionRecord, i64)> = deposits
            .iter()
            .filter_map(|&t| to_minor_units(&t.amount).map(|cents| (t, cents)))
            .filter(|(_, cents)| {
                index
                    .range(cents.saturating_sub(exact)..=cents.saturating_add(exact))
                    .next()
                    .is_none()
            })
            .collect();

        if let Some(cap) = self.bands.max_grouped_scan {
            if candidates.len() > cap {
                warn!(deposits = candidates.len(), cap, "grouped scan truncated");
                candidates.truncate(cap);
            }
        }

        let mut used_deposits: HashSet<&str> = HashSet::new();
        let mut found = Vec::new();

        for (i, &(first, first_cents)) in candidates.iter().enumerate() {
            if index.is_empty() {
                break;
            }
            for &(second, second_cents) in &candidates[i + 1..] {
                if used_deposits.contains(first.id.as_str()) {
                    break;
                }
                if used_deposits.contains(second.id.as_str()) {
                    continue;
                }
                let sum = first_cents.saturating_add(second_cents);
                let Some((cents, installment)) = index
                    .range(sum.saturating_sub(tolerance)..=sum.saturating_add(tolerance))
                    .next()
                    .map(|(cents, group)| (*cents, group[0]))
                else {
                    continue;
                };
                // settled installments leave the index
                if let Some(group) = index.get_mut(&cents) {
                    group.remove(0);
                    if group.is_empty() {
                        index.remove(&cents);
                    }
                }
                used_deposits.insert(first.id.as_str());
                used_deposits.insert(second.id.as_str());
                found.push(Anomaly::Grouped {
                    transaction_ids: [first.id.clone(), second.id.clone()],
                    installment_id: installment.id.clone(),
                    sum: &first.amount + &second.amount,
                });
            }
        }
        found
    }
}

/// Amount in whole minor units, `None` when it does not fit an `i64`
fn to_minor_units(amount: &BigDecimal) -> Option<i64> {
    (amount * BigDecimal::from(100)).round(0).to_i64()
}

/// Ratio as a percentage rounded to two decimals (`0.8` is `80.00`)
fn as_percentage(ratio: &BigDecimal) -> BigDecimal {
    (ratio * BigDecimal::from(100)).round(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn deposit(id: &str, amount: &str) -> TransactionRecord {
        let mut record = TransactionRecord::new(
            NaiveDate::from_ymd_opt(2024, 4, 10).unwrap(),
            format!("PIX {id}"),
            &dec(amount),
        );
        record.id = id.to_string();
        record
    }

    fn installment(id: &str, amount: &str) -> CandidateObligation {
        CandidateObligation::new(
            id.to_string(),
            CandidateKind::Installment,
            dec(amount),
            NaiveDate::from_ymd_opt(2024, 4, 10).unwrap(),
            "Customer".to_string(),
        )
    }

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(&ReconConfig::default())
    }

    #[test]
    fn test_partial_band_boundaries() {
        let installments = vec![installment("i1", "1000.00")];
        let at_floor = detector().detect(&[deposit("t1", "700.00")], &installments);
        assert_eq!(at_floor.len(), 1);
        assert_eq!(at_floor[0].kind(), AnomalyKind::Partial);

        assert!(detector()
            .detect(&[deposit("t1", "699.99")], &installments)
            .is_empty());
        // 99% is outside the band
        assert!(detector()
            .detect(&[deposit("t1", "990.00")], &installments)
            .is_empty());
    }

    #[test]
    fn test_overpayment_band_boundaries() {
        let installments = vec![installment("i1", "1000.00")];
        assert!(detector()
            .detect(&[deposit("t1", "1010.00")], &installments)
            .is_empty());

        let anomalies = detector().detect(&[deposit("t1", "1300.00")], &installments);
        assert_eq!(
            anomalies,
            vec![Anomaly::Overpayment {
                transaction_id: "t1".to_string(),
                installment_id: "i1".to_string(),
                surplus: dec("300.00"),
                percentage: dec("130.00"),
            }]
        );

        assert!(detector()
            .detect(&[deposit("t1", "1300.01")], &installments)
            .is_empty());
    }

    #[test]
    fn test_transaction_flagged_once() {
        // 850 is partial against both; the first installment wins
        let installments = vec![installment("i1", "1000.00"), installment("i2", "900.00")];
        let anomalies = detector().detect(&[deposit("t1", "850.00")], &installments);
        assert_eq!(anomalies.len(), 1);
        match &anomalies[0] {
            Anomaly::Partial { installment_id, .. } => assert_eq!(installment_id, "i1"),
            other => panic!("unexpected anomaly {other:?}"),
        }
    }

    #[test]
    fn test_duplicates_skip_partial_check() {
        let installments = vec![installment("i1", "1000.00")];
        let anomalies = detector().detect(
            &[deposit("t1", "800.00"), deposit("t2", "800.00")],
            &installments,
        );
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind(), AnomalyKind::Duplicate);
    }

    #[test]
    fn test_grouped_excludes_exact_individual_matches() {
        let installments = vec![installment("i1", "1000.00"), installment("i2", "300.00")];
        let anomalies = detector().detect(
            &[deposit("t1", "300.00"), deposit("t2", "700.00")],
            &installments,
        );
        assert!(anomalies.iter().all(|a| a.kind() != AnomalyKind::Grouped));
    }

    #[test]
    fn test_grouped_tolerates_five_minor_units() {
        let installments = vec![installment("i1", "1000.00")];
        let near = detector().detect(
            &[deposit("t1", "299.97"), deposit("t2", "699.98")],
            &installments,
        );
        assert!(near.iter().any(|a| a.kind() == AnomalyKind::Grouped));

        let far = detector().detect(
            &[deposit("t1", "299.90"), deposit("t2", "699.90")],
            &installments,
        );
        assert!(far.iter().all(|a| a.kind() != AnomalyKind::Grouped));
    }

    #[test]
    fn test_grouped_scan_cap() {
        let mut config = ReconConfig::default();
        config.anomaly.max_grouped_scan = Some(1);
        let anomalies = AnomalyDetector::new(&config).detect(
            &[deposit("t1", "300.00"), deposit("t2", "700.00")],
            &[installment("i1", "1000.00")],
        );
        assert!(anomalies.iter().all(|a| a.kind() != AnomalyKind::Grouped));
    }

    #[test]
    fn test_settled_deposit_counts_toward_duplicates() {
        let first = deposit("t1", "500.00");
        let taken = installment("i1", "500.00");
        let anomalies = detector().detect_with_settled(
            &[deposit("t2", "500.00")],
            &[],
            &[(&first, &taken)],
        );
        assert_eq!(
            anomalies,
            vec![Anomaly::Duplicate {
                transaction_ids: vec!["t2".to_string(), "t1".to_string()],
                amount: dec("500.00"),
                installment_ids: vec!["i1".to_string()],
            }]
        );

        // one deposit per installment is not a duplicate
        let anomalies = detector().detect_with_settled(
            &[deposit("t2", "500.00")],
            &[installment("i2", "500.00")],
            &[(&first, &taken)],
        );
        assert!(anomalies.iter().all(|a| a.kind() != AnomalyKind::Duplicate));
    }

    #[test]
    fn test_lone_deposit_is_not_a_duplicate() {
        assert!(detector()
            .detect(&[deposit("t1", "500.00")], &[])
            .is_empty());
    }

    #[test]
    fn test_grouped_scan_over_a_large_batch() {
        let deposits: Vec<TransactionRecord> = (0..1500)
            .map(|i| deposit(&format!("t{i}"), &format!("{}.37", 100 + i)))
            .collect();
        let mut installments: Vec<CandidateObligation> = (0..1500)
            .map(|i| installment(&format!("far{i}"), &format!("{}.00", 5_000_000 + i)))
            .collect();
        // (100 + 3).37 + (100 + 900).37, also reached by every i + j = 903
        installments.push(installment("target", "1103.74"));

        let grouped: Vec<Anomaly> = detector()
            .detect(&deposits, &installments)
            .into_iter()
            .filter(|a| a.kind() == AnomalyKind::Grouped)
            .collect();
        assert_eq!(
            grouped,
            vec![Anomaly::Grouped {
                transaction_ids: ["t0".to_string(), "t903".to_string()],
                installment_id: "target".to_string(),
                sum: dec("1103.74"),
            }]
        );
    }

    #[test]
    fn test_debits_and_resolved_are_ignored() {
        let mut matched = deposit("t1", "800.00");
        matched.status = ReconciliationStatus::Matched;
        let debit = deposit("t2", "-800.00");
        let anomalies = detector().detect(&[matched, debit], &[installment("i1", "1000.00")]);
        assert!(anomalies.is_empty());
    }
}
