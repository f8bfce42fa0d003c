//! Core types and data structures for the reconciliation engine

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Direction of money movement on the bank account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Money coming into the account (deposits, receipts)
    Credit,
    /// Money leaving the account (payments, fees)
    Debit,
}

impl Direction {
    /// Direction implied by the sign of a signed statement amount
    pub fn from_signed(amount: &BigDecimal) -> Self {
        if *amount < BigDecimal::from(0) {
            Direction::Debit
        } else {
            Direction::Credit
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Credit => write!(f, "credit"),
            Direction::Debit => write!(f, "debit"),
        }
    }
}

/// Reconciliation status of a statement transaction.
///
/// `Matched` and `Ignored` are terminal until an explicit undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    Pending,
    Matched,
    Ignored,
}

impl fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciliationStatus::Pending => write!(f, "pending"),
            ReconciliationStatus::Matched => write!(f, "matched"),
            ReconciliationStatus::Ignored => write!(f, "ignored"),
        }
    }
}

/// One normalized movement from an imported bank statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Unique identifier for the record
    pub id: String,
    /// Statement batch this record was imported with
    pub statement_id: String,
    /// Bank account the statement belongs to, when known
    pub account_id: Option<String>,
    /// Posting date
    pub date: NaiveDate,
    /// Free-text description from the bank
    pub description: String,
    /// Magnitude of the movement, never negative
    pub amount: BigDecimal,
    /// Credit or debit
    pub direction: Direction,
    /// External document id (OFX FITID or check number)
    pub document_id: Option<String>,
    /// Current reconciliation status
    pub status: ReconciliationStatus,
    /// Linked ledger entry, set only while matched
    pub ledger_entry_id: Option<String>,
    /// Candidate obligation consumed by the match, if any
    pub matched_candidate_id: Option<String>,
    /// Rule that acted on this record, if any
    pub rule_id: Option<String>,
    /// When the record was created
    pub created_at: NaiveDateTime,
    /// When the record was last updated
    pub updated_at: NaiveDateTime,
}

impl TransactionRecord {
    /// Create a new pending record from a signed statement amount
    pub fn new(date: NaiveDate, description: String, signed_amount: &BigDecimal) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            statement_id: String::new(),
            account_id: None,
            date,
            description,
            amount: signed_amount.abs(),
            direction: Direction::from_signed(signed_amount),
            document_id: None,
            status: ReconciliationStatus::Pending,
            ledger_entry_id: None,
            matched_candidate_id: None,
            rule_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach an external document id
    pub fn with_document_id(mut self, document_id: Option<String>) -> Self {
        self.document_id = document_id;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == ReconciliationStatus::Pending
    }

    /// Amount with its sign restored (debits negative)
    pub fn signed_amount(&self) -> BigDecimal {
        match self.direction {
            Direction::Credit => self.amount.clone(),
            Direction::Debit => -self.amount.clone(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().naive_utc();
    }
}

/// The kind of obligation a candidate represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateKind {
    /// Receivable installment, settled by a credit
    Installment,
    /// Payable bill, settled by a debit
    Payable,
    /// Ledger entry not yet reconciled against the bank
    LedgerEntry,
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateKind::Installment => write!(f, "installment"),
            CandidateKind::Payable => write!(f, "payable"),
            CandidateKind::LedgerEntry => write!(f, "ledger_entry"),
        }
    }
}

/// Outstanding status of a candidate obligation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObligationStatus {
    Outstanding,
    Settled,
}

/// An installment, payable or ledger entry eligible for matching.
///
/// Owned by external collaborators; the engine reads it and requests updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateObligation {
    pub id: String,
    pub kind: CandidateKind,
    pub amount: BigDecimal,
    /// Due date for installments/payables, reference date for ledger entries
    pub date: NaiveDate,
    pub counterparty: String,
    /// Direction of the bank movement that would settle this obligation
    pub direction: Direction,
    /// Owning aggregate (receivable or payable header)
    pub parent_id: Option<String>,
    pub status: ObligationStatus,
    /// Transaction that consumed this candidate
    pub settled_by: Option<String>,
    /// Optimistic concurrency version, bumped on every claim/release
    pub version: u64,
}

impl CandidateObligation {
    /// Create a new outstanding candidate
    pub fn new(
        id: String,
        kind: CandidateKind,
        amount: BigDecimal,
        date: NaiveDate,
        counterparty: String,
    ) -> Self {
        let direction = match kind {
            CandidateKind::Installment | CandidateKind::LedgerEntry => Direction::Credit,
            CandidateKind::Payable => Direction::Debit,
        };
        Self {
            id,
            kind,
            amount,
            date,
            counterparty,
            direction,
            parent_id: None,
            status: ObligationStatus::Outstanding,
            settled_by: None,
            version: 0,
        }
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn is_outstanding(&self) -> bool {
        self.status == ObligationStatus::Outstanding
    }
}

/// What a rule does when its pattern fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    /// Mark the transaction ignored
    Ignore,
    /// Generate a ledger entry and link it
    CreateEntry {
        /// Falls back to the transaction's own direction when absent
        direction: Option<Direction>,
        category: String,
    },
}

/// User-defined automation rule, matched as a case-insensitive substring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    /// Scope the rule belongs to (company, tenant, user)
    pub owner_id: String,
    /// Ordering position, lower values are evaluated first
    pub priority: i32,
    pub pattern: String,
    pub action: RuleAction,
    pub active: bool,
    /// Frequency counter maintained by the rule store
    pub times_applied: u64,
}

impl Rule {
    pub fn new(owner_id: &str, priority: i32, pattern: &str, action: RuleAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            priority,
            pattern: pattern.to_string(),
            action,
            active: true,
            times_applied: 0,
        }
    }

    /// Pattern in matching form, `None` when blank
    pub fn folded_pattern(&self) -> Option<String> {
        let pattern = fold_case(self.pattern.trim());
        (!pattern.is_empty()).then_some(pattern)
    }

    /// Case- and accent-insensitive substring test against a description
    pub fn matches(&self, description: &str) -> bool {
        self.folded_pattern()
            .is_some_and(|pattern| fold_case(description).contains(&pattern))
    }
}

/// Lowercase and strip Latin diacritics, so `APLICAÇÃO` reads as `aplicacao`
pub fn fold_case(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
            'ç' => 'c',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ñ' => 'n',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ý' | 'ÿ' => 'y',
            other => other,
        })
        .collect()
}

/// Where a ledger entry came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOrigin {
    /// Generated by a `CreateEntry` rule
    Rule(String),
    /// Generated when a transaction was matched to an installment or payable
    Settlement(String),
}

/// Ledger entry generated by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub date: NaiveDate,
    pub description: String,
    pub amount: BigDecimal,
    pub direction: Direction,
    pub category: Option<String>,
    /// Statement transaction this entry reconciles
    pub transaction_id: String,
    pub origin: EntryOrigin,
    pub created_at: NaiveDateTime,
}

impl LedgerEntry {
    /// Build an entry that mirrors a statement transaction
    pub fn for_transaction(
        transaction: &TransactionRecord,
        direction: Direction,
        category: Option<String>,
        origin: EntryOrigin,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            date: transaction.date,
            description: transaction.description.clone(),
            amount: transaction.amount.clone(),
            direction,
            category,
            transaction_id: transaction.id.clone(),
            origin,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

/// Coarse confidence bucket derived from a match score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

/// A factor that contributed to a match score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchFactor {
    ExactValue,
    ApproximateValue,
    SameDate,
    NearDate,
    WithinWeek,
    ExactText,
    ContainedText,
    WordOverlap,
}

impl MatchFactor {
    pub fn label(&self) -> &'static str {
        match self {
            MatchFactor::ExactValue => "exact_value",
            MatchFactor::ApproximateValue => "approximate_value",
            MatchFactor::SameDate => "same_date",
            MatchFactor::NearDate => "near_date",
            MatchFactor::WithinWeek => "within_week",
            MatchFactor::ExactText => "exact_text",
            MatchFactor::ContainedText => "contained_text",
            MatchFactor::WordOverlap => "word_overlap",
        }
    }
}

impl fmt::Display for MatchFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Proposed pairing of a transaction with a candidate. Not persisted until committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub transaction_id: String,
    pub candidate_id: String,
    pub candidate_kind: CandidateKind,
    pub score: u8,
    pub tier: ConfidenceTier,
    pub factors: Vec<MatchFactor>,
}

impl MatchResult {
    /// Eligible for silent commit: top tier with exact value and same or near date
    pub fn is_auto_applicable(&self) -> bool {
        self.tier == ConfidenceTier::High
            && self.factors.contains(&MatchFactor::ExactValue)
            && (self.factors.contains(&MatchFactor::SameDate)
                || self.factors.contains(&MatchFactor::NearDate))
    }
}

/// Advisory pattern requiring manual review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Anomaly {
    /// More same-amount deposits than pending installments of that amount
    Duplicate {
        transaction_ids: Vec<String>,
        amount: BigDecimal,
        /// Pending installments sharing the amount
        installment_ids: Vec<String>,
    },
    /// Deposit covering 70% up to (excluding) 99% of an installment
    Partial {
        transaction_id: String,
        installment_id: String,
        shortfall: BigDecimal,
        percentage: BigDecimal,
    },
    /// Two deposits that together settle one installment
    Grouped {
        transaction_ids: [String; 2],
        installment_id: String,
        sum: BigDecimal,
    },
    /// Deposit exceeding an installment by more than 1% up to 30%
    Overpayment {
        transaction_id: String,
        installment_id: String,
        surplus: BigDecimal,
        percentage: BigDecimal,
    },
}

/// Discriminant of an [`Anomaly`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    Duplicate,
    Partial,
    Grouped,
    Overpayment,
}

impl Anomaly {
    pub fn kind(&self) -> AnomalyKind {
        match self {
            Anomaly::Duplicate { .. } => AnomalyKind::Duplicate,
            Anomaly::Partial { .. } => AnomalyKind::Partial,
            Anomaly::Grouped { .. } => AnomalyKind::Grouped,
            Anomaly::Overpayment { .. } => AnomalyKind::Overpayment,
        }
    }

    /// Transactions involved in this anomaly
    pub fn transaction_ids(&self) -> Vec<&str> {
        match self {
            Anomaly::Duplicate {
                transaction_ids, ..
            } => transaction_ids.iter().map(String::as_str).collect(),
            Anomaly::Grouped {
                transaction_ids, ..
            } => transaction_ids.iter().map(String::as_str).collect(),
            Anomaly::Partial { transaction_id, .. }
            | Anomaly::Overpayment { transaction_id, .. } => vec![transaction_id.as_str()],
        }
    }
}

/// Ids already resolved during a reconciliation run.
///
/// Passed explicitly through every stage so each one only considers what the
/// previous stages left open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingSet {
    pub resolved_transactions: HashSet<String>,
    pub consumed_candidates: HashSet<String>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve_transaction(&mut self, transaction_id: &str) {
        self.resolved_transactions
            .insert(transaction_id.to_string());
    }

    pub fn consume(&mut self, transaction_id: &str, candidate_id: &str) {
        self.resolve_transaction(transaction_id);
        self.consumed_candidates.insert(candidate_id.to_string());
    }

    pub fn is_resolved(&self, transaction_id: &str) -> bool {
        self.resolved_transactions.contains(transaction_id)
    }

    pub fn is_consumed(&self, candidate_id: &str) -> bool {
        self.consumed_candidates.contains(candidate_id)
    }
}

/// Errors that can occur in the reconciliation engine
#[derive(Debug, thiserror::Error)]
pub enum ReconError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Unreadable statement: {0}")]
    UnreadableStatement(String),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Candidate not found: {0}")]
    CandidateNotFound(String),
    #[error("Candidate already consumed: {0}")]
    CandidateConsumed(String),
    #[error("Transaction {transaction_id} is {from}, cannot {action}")]
    InvalidTransition {
        transaction_id: String,
        from: ReconciliationStatus,
        action: &'static str,
    },
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Candidate pool mixes {0} and {1}")]
    MixedCandidatePool(CandidateKind, CandidateKind),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Config parse error: {0}")]
    ConfigParse(String),
}

impl ReconError {
    /// Errors scoped to a single transaction that a batch records and moves past
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReconError::Conflict(_) | ReconError::CandidateConsumed(_) | ReconError::Timeout(_)
        )
    }
}

/// Result type for reconciliation operations
pub type ReconResult<T> = Result<T, ReconError>;
