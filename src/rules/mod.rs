//! Automation rules: first matching rule ignores a transaction or books an entry

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::reconciliation::ReconciliationLedger;
use crate::traits::*;
use crate::types::*;

/// A rule that fired but whose action could not be committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub transaction_id: String,
    pub rule_id: String,
    pub error: String,
}

/// Outcome of one rule pass over a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePassReport {
    /// (transaction id, rule id)
    pub ignored: Vec<(String, String)>,
    /// (transaction id, ledger entry id, rule id)
    pub entries_created: Vec<(String, String, String)>,
    /// Transactions left pending because the action failed
    pub failures: Vec<RuleFailure>,
}

impl RulePassReport {
    pub fn resolved_count(&self) -> usize {
        self.ignored.len() + self.entries_created.len()
    }
}

/// Evaluates rules in priority order, short-circuiting on the first hit
pub struct RuleEngine {
    validator: Box<dyn RuleValidator>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            validator: Box::new(DefaultRuleValidator),
        }
    }

    /// Create a rule engine with a custom validator
    pub fn with_validator(validator: Box<dyn RuleValidator>) -> Self {
        Self { validator }
    }

    /// Active, valid rules sorted by priority, each with its folded pattern
    fn ordered<'r>(&self, rules: &'r [Rule]) -> Vec<(&'r Rule, String)> {
        let mut ordered: Vec<(&Rule, String)> = rules
            .iter()
            .filter(|rule| rule.active)
            .filter(|rule| match self.validator.validate_rule(rule) {
                Ok(()) => true,
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "invalid rule skipped");
                    false
                }
            })
            .filter_map(|rule| rule.folded_pattern().map(|pattern| (rule, pattern)))
            .collect();
        ordered.sort_by(|(a, _), (b, _)| {
            a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id))
        });
        ordered
    }

    /// The first rule, in priority order, whose pattern occurs in the description
    pub fn first_match<'r>(&self, description: &str, rules: &'r [Rule]) -> Option<&'r Rule> {
        find_rule(&self.ordered(rules), &fold_case(description))
    }

    /// Run the rule pass over the pending transactions of a batch.
    ///
    /// A failed action leaves its transaction pending and is reported; the
    /// rest of the batch still runs.
    pub async fn apply<S>(
        &self,
        ledger: &mut ReconciliationLedger<S>,
        transactions: &[TransactionRecord],
        rules: &[Rule],
        working: &mut WorkingSet,
    ) -> RulePassReport
    where
        S: StatementStorage + ObligationStorage + EntryStorage + RuleStorage,
    {
        let ordered = self.ordered(rules);
        let mut report = RulePassReport::default();

        let open: Vec<&TransactionRecord> = transactions
            .iter()
            .filter(|t| t.is_pending() && !working.is_resolved(&t.id))
            .collect();

        for transaction in open {
            let Some(rule) = find_rule(&ordered, &fold_case(&transaction.description)) else {
                continue;
            };
            debug!(transaction_id = %transaction.id, rule_id = %rule.id, "rule fired");

            let outcome = match &rule.action {
                RuleAction::Ignore => ledger
                    .apply_ignore(&transaction.id, Some(&rule.id))
                    .await
                    .map(|_| None),
                RuleAction::CreateEntry {
                    direction,
                    category,
                } => {
                    let entry = LedgerEntry::for_transaction(
                        transaction,
                        direction.unwrap_or(transaction.direction),
                        Some(category.clone()),
                        EntryOrigin::Rule(rule.id.clone()),
                    );
                    let entry_id = entry.id.clone();
                    ledger
                        .apply_entry(&transaction.id, entry, &rule.id)
                        .await
                        .map(|_| Some(entry_id))
                }
            };

            match outcome {
                Ok(entry_id) => {
                    working.resolve_transaction(&transaction.id);
                    match entry_id {
                        Some(entry_id) => report.entries_created.push((
                            transaction.id.clone(),
                            entry_id,
                            rule.id.clone(),
                        )),
                        None => report
                            .ignored
                            .push((transaction.id.clone(), rule.id.clone())),
                    }
                    if let Err(e) = ledger.storage_mut().record_rule_hit(&rule.id).await {
                        warn!(rule_id = %rule.id, error = %e, "rule hit counter not updated");
                    }
                }
                Err(e) => {
                    warn!(
                        transaction_id = %transaction.id,
                        rule_id = %rule.id,
                        error = %e,
                        "rule action failed, transaction left pending"
                    );
                    report.failures.push(RuleFailure {
                        transaction_id: transaction.id.clone(),
                        rule_id: rule.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            ignored = report.ignored.len(),
            entries_created = report.entries_created.len(),
            failures = report.failures.len(),
            "rule pass finished"
        );
        report
    }

    /// Insert the starter rules when the owner has none. Returns how many were inserted.
    pub async fn seed_default_rules<R: RuleStorage>(
        &self,
        storage: &mut R,
        owner_id: &str,
    ) -> ReconResult<usize> {
        if storage.count_rules(owner_id).await? > 0 {
            debug!(owner_id, "rules already present, seeding skipped");
            return Ok(0);
        }
        let rules = default_rules(owner_id);
        storage.insert_rules(&rules).await?;
        info!(owner_id, count = rules.len(), "default rules seeded");
        Ok(rules.len())
    }
}

fn find_rule<'r>(ordered: &[(&'r Rule, String)], folded_description: &str) -> Option<&'r Rule> {
    ordered
        .iter()
        .find(|(_, pattern)| folded_description.contains(pattern.as_str()))
        .map(|(rule, _)| *rule)
}

/// Canonical starter set: bank fees, tax withholding, investment movements, interest
pub fn default_rules(owner_id: &str) -> Vec<Rule> {
    let entry = |direction, category: &str| RuleAction::CreateEntry {
        direction: Some(direction),
        category: category.to_string(),
    };
    vec![
        Rule::new(owner_id, 10, "bank fee", entry(Direction::Debit, "Bank fees")),
        Rule::new(owner_id, 20, "service charge", entry(Direction::Debit, "Bank fees")),
        Rule::new(owner_id, 30, "tarifa", entry(Direction::Debit, "Bank fees")),
        Rule::new(owner_id, 40, "withholding tax", entry(Direction::Debit, "Taxes")),
        Rule::new(owner_id, 50, "irrf", entry(Direction::Debit, "Taxes")),
        Rule::new(owner_id, 60, "iof", entry(Direction::Debit, "Taxes")),
        Rule::new(owner_id, 70, "redemption", RuleAction::Ignore),
        Rule::new(owner_id, 80, "resgate", RuleAction::Ignore),
        Rule::new(owner_id, 90, "investment application", RuleAction::Ignore),
        Rule::new(owner_id, 100, "aplicacao", RuleAction::Ignore),
        Rule::new(owner_id, 110, "interest credit", entry(Direction::Credit, "Interest income")),
        Rule::new(owner_id, 120, "rendimento", entry(Direction::Credit, "Interest income")),
    ]
}
