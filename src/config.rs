//! Engine configuration: tolerances, scoring thresholds and batch limits
//!
//! Every value has a named default, so an empty TOML document yields the
//! standard engine behavior.

use bigdecimal::BigDecimal;
use serde::Deserialize;
use std::time::Duration;

use crate::types::*;

/// Amount in minor currency units (cents) as a decimal
pub(crate) fn minor_units(units: i64) -> BigDecimal {
    BigDecimal::new(units.into(), 2)
}

/// Percentage expressed as a ratio (`percent(70)` is `0.70`)
pub(crate) fn percent(value: i64) -> BigDecimal {
    BigDecimal::new(value.into(), 2)
}

/// Exact amount tolerance: 1 minor unit
pub const EXACT_TOLERANCE_MINOR_UNITS: i64 = 1;
/// Grouped-sum tolerance: 5 minor units
pub const GROUPED_TOLERANCE_MINOR_UNITS: i64 = 5;
/// Relative window for an approximate value match
pub const APPROXIMATE_TOLERANCE_PERCENT: i64 = 5;
/// Partial payment band, lower bound inclusive
pub const PARTIAL_MIN_PERCENT: i64 = 70;
/// Partial payment band, upper bound exclusive
pub const PARTIAL_MAX_PERCENT: i64 = 99;
/// Overpayment band, lower bound exclusive
pub const OVERPAYMENT_MIN_PERCENT: i64 = 101;
/// Overpayment band, upper bound inclusive
pub const OVERPAYMENT_MAX_PERCENT: i64 = 130;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    pub tolerance: ToleranceConfig,
    pub dates: DateWindowConfig,
    pub scoring: ScoringConfig,
    pub anomaly: AnomalyConfig,
    pub batch: BatchConfig,
}

/// Amount tolerances
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToleranceConfig {
    /// Absolute difference still considered an exact match
    pub exact: BigDecimal,
    /// Relative difference still considered an approximate match
    pub approximate_ratio: BigDecimal,
    /// Absolute difference allowed when two deposits sum to an installment
    pub grouped: BigDecimal,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            exact: minor_units(EXACT_TOLERANCE_MINOR_UNITS),
            approximate_ratio: percent(APPROXIMATE_TOLERANCE_PERCENT),
            grouped: minor_units(GROUPED_TOLERANCE_MINOR_UNITS),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DateWindowConfig {
    /// Days apart still scored as a near date
    pub near_days: i64,
    /// Days apart beyond which a pair is excluded
    pub max_days: i64,
}

impl Default for DateWindowConfig {
    fn default() -> Self {
        Self {
            near_days: 2,
            max_days: 7,
        }
    }
}

/// Score thresholds on the 0-100 scale
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub high_tier: u8,
    pub medium_tier: u8,
    pub min_installment_score: u8,
    pub min_payable_score: u8,
    pub min_ledger_entry_score: u8,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            high_tier: 80,
            medium_tier: 60,
            min_installment_score: 45,
            min_payable_score: 55,
            min_ledger_entry_score: 60,
        }
    }
}

impl ScoringConfig {
    /// Minimum score for a pair to be proposed against this kind of candidate
    pub fn min_score_for(&self, kind: CandidateKind) -> u8 {
        match kind {
            CandidateKind::Installment => self.min_installment_score,
            CandidateKind::Payable => self.min_payable_score,
            CandidateKind::LedgerEntry => self.min_ledger_entry_score,
        }
    }

    pub fn tier_for(&self, score: u8) -> ConfidenceTier {
        if score >= self.high_tier {
            ConfidenceTier::High
        } else if score >= self.medium_tier {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }
}

/// Ratio bands for partial and overpayment detection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub partial_min: BigDecimal,
    pub partial_max: BigDecimal,
    pub overpayment_min: BigDecimal,
    pub overpayment_max: BigDecimal,
    /// Largest pending set scanned for grouped pairs; `None` scans everything
    pub max_grouped_scan: Option<usize>,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            partial_min: percent(PARTIAL_MIN_PERCENT),
            partial_max: percent(PARTIAL_MAX_PERCENT),
            overpayment_min: percent(OVERPAYMENT_MIN_PERCENT),
            overpayment_max: percent(OVERPAYMENT_MAX_PERCENT),
            max_grouped_scan: None,
        }
    }
}

/// Whether matched proposals are committed or only returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Advisory,
    AutoApply,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Timeout applied to each storage call, in milliseconds
    pub external_call_timeout_ms: u64,
    /// Times a candidate claim is refetched and retried after a version conflict
    pub max_conflict_retries: u32,
    pub match_mode: MatchMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            external_call_timeout_ms: 5_000,
            max_conflict_retries: 3,
            match_mode: MatchMode::Advisory,
        }
    }
}

impl BatchConfig {
    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_millis(self.external_call_timeout_ms)
    }
}

impl ReconConfig {
    pub fn from_toml(input: &str) -> ReconResult<Self> {
        let config: ReconConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ReconResult<()> {
        let zero = BigDecimal::from(0);
        if self.tolerance.exact < zero
            || self.tolerance.approximate_ratio < zero
            || self.tolerance.grouped < zero
        {
            return Err(ReconError::Validation(
                "tolerances cannot be negative".to_string(),
            ));
        }

        if self.dates.near_days < 0 || self.dates.near_days > self.dates.max_days {
            return Err(ReconError::Validation(format!(
                "near date window ({}) must be between 0 and the max window ({})",
                self.dates.near_days, self.dates.max_days
            )));
        }

        let scoring = &self.scoring;
        if scoring.high_tier > 100 || scoring.medium_tier > scoring.high_tier {
            return Err(ReconError::Validation(format!(
                "tier thresholds must satisfy medium ({}) <= high ({}) <= 100",
                scoring.medium_tier, scoring.high_tier
            )));
        }
        for kind in [
            CandidateKind::Installment,
            CandidateKind::Payable,
            CandidateKind::LedgerEntry,
        ] {
            if scoring.min_score_for(kind) > 100 {
                return Err(ReconError::Validation(format!(
                    "minimum score for {kind} exceeds 100"
                )));
            }
        }

        let anomaly = &self.anomaly;
        if anomaly.partial_min >= anomaly.partial_max {
            return Err(ReconError::Validation(
                "partial band lower bound must be below its upper bound".to_string(),
            ));
        }
        if anomaly.overpayment_min >= anomaly.overpayment_max {
            return Err(ReconError::Validation(
                "overpayment band lower bound must be below its upper bound".to_string(),
            ));
        }
        if anomaly.partial_max > anomaly.overpayment_min {
            return Err(ReconError::Validation(
                "partial and overpayment bands overlap".to_string(),
            ));
        }

        Ok(())
    }
}
