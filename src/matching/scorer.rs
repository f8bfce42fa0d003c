//! Multi-factor compatibility score between a transaction and a candidate

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{DateWindowConfig, ReconConfig, ToleranceConfig};
use crate::types::*;

pub const EXACT_VALUE_WEIGHT: u8 = 60;
pub const APPROXIMATE_VALUE_WEIGHT: u8 = 30;
pub const SAME_DATE_WEIGHT: u8 = 30;
pub const NEAR_DATE_WEIGHT: u8 = 20;
pub const WITHIN_WEEK_WEIGHT: u8 = 5;
pub const EXACT_TEXT_WEIGHT: u8 = 10;
pub const CONTAINED_TEXT_WEIGHT: u8 = 7;
pub const WORD_OVERLAP_MAX_WEIGHT: u8 = 5;

/// Words this short carry no signal for overlap
const MIN_WORD_LEN: usize = 4;

/// Score on the 0-100 scale with the factors that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchScore {
    pub value: u8,
    pub factors: Vec<MatchFactor>,
}

/// Stateless scorer. Pairs outside the value or date window score `None`.
#[derive(Debug, Clone)]
pub struct MatchScorer {
    tolerance: ToleranceConfig,
    dates: DateWindowConfig,
}

impl MatchScorer {
    pub fn new(config: &ReconConfig) -> Self {
        Self {
            tolerance: config.tolerance.clone(),
            dates: config.dates.clone(),
        }
    }

    pub fn score(
        &self,
        transaction: &TransactionRecord,
        candidate: &CandidateObligation,
    ) -> Option<MatchScore> {
        if transaction.direction != candidate.direction {
            return None;
        }

        let mut factors = Vec::with_capacity(3);
        let mut value = 0u8;

        let (weight, factor) = self.value_factor(&transaction.amount, &candidate.amount)?;
        value += weight;
        factors.push(factor);

        let (weight, factor) = self.date_factor(transaction, candidate)?;
        value += weight;
        factors.push(factor);

        if let Some((weight, factor)) = text_factor(&transaction.description, &candidate.counterparty)
        {
            value += weight;
            factors.push(factor);
        }

        Some(MatchScore { value, factors })
    }

    fn value_factor(&self, amount: &BigDecimal, expected: &BigDecimal) -> Option<(u8, MatchFactor)> {
        let difference = (amount - expected).abs();
        if difference <= self.tolerance.exact {
            return Some((EXACT_VALUE_WEIGHT, MatchFactor::ExactValue));
        }
        if *expected > BigDecimal::from(0)
            && difference <= expected * &self.tolerance.approximate_ratio
        {
            return Some((APPROXIMATE_VALUE_WEIGHT, MatchFactor::ApproximateValue));
        }
        None
    }

    fn date_factor(
        &self,
        transaction: &TransactionRecord,
        candidate: &CandidateObligation,
    ) -> Option<(u8, MatchFactor)> {
        let days = (transaction.date - candidate.date).num_days().abs();
        if days == 0 {
            Some((SAME_DATE_WEIGHT, MatchFactor::SameDate))
        } else if days <= self.dates.near_days {
            Some((NEAR_DATE_WEIGHT, MatchFactor::NearDate))
        } else if days <= self.dates.max_days {
            Some((WITHIN_WEEK_WEIGHT, MatchFactor::WithinWeek))
        } else {
            None
        }
    }
}

/// Lowercase and keep only alphanumerics
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn significant_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_WORD_LEN)
        .map(str::to_lowercase)
        .collect()
}

fn text_factor(description: &str, counterparty: &str) -> Option<(u8, MatchFactor)> {
    let left = normalize_text(description);
    let right = normalize_text(counterparty);
    if left.is_empty() || right.is_empty() {
        return None;
    }
    if left == right {
        return Some((EXACT_TEXT_WEIGHT, MatchFactor::ExactText));
    }
    if left.contains(&right) || right.contains(&left) {
        return Some((CONTAINED_TEXT_WEIGHT, MatchFactor::ContainedText));
    }

    let left_words = significant_words(description);
    let right_words = significant_words(counterparty);
    let smaller = left_words.len().min(right_words.len());
    if smaller == 0 {
        return None;
    }
    let common = left_words.intersection(&right_words).count();
    let weight = (common * WORD_OVERLAP_MAX_WEIGHT as usize + smaller / 2) / smaller;
    if weight == 0 {
        return None;
    }
    Some((weight as u8, MatchFactor::WordOverlap))
}
