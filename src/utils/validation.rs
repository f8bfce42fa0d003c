//! Validation utilities

use crate::traits::*;
use crate::types::*;

/// Validate that an owner ID is valid
pub fn validate_owner_id(owner_id: &str) -> ReconResult<()> {
    if owner_id.trim().is_empty() {
        return Err(ReconError::Validation(
            "Owner ID cannot be empty".to_string(),
        ));
    }

    if owner_id.len() > 50 {
        return Err(ReconError::Validation(
            "Owner ID cannot exceed 50 characters".to_string(),
        ));
    }

    // Check for valid characters (alphanumeric, dashes, underscores)
    if !owner_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ReconError::Validation(
            "Owner ID can only contain alphanumeric characters, dashes, and underscores"
                .to_string(),
        ));
    }

    Ok(())
}

/// Validate that a rule pattern is usable as a substring match
pub fn validate_rule_pattern(pattern: &str) -> ReconResult<()> {
    if pattern.trim().is_empty() {
        return Err(ReconError::Validation(
            "Rule pattern cannot be empty".to_string(),
        ));
    }

    if pattern.chars().count() > 100 {
        return Err(ReconError::Validation(
            "Rule pattern cannot exceed 100 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate that a rule category is valid
pub fn validate_category(category: &str) -> ReconResult<()> {
    if category.trim().is_empty() {
        return Err(ReconError::Validation(
            "Entry category cannot be empty".to_string(),
        ));
    }

    if category.len() > 100 {
        return Err(ReconError::Validation(
            "Entry category cannot exceed 100 characters".to_string(),
        ));
    }

    Ok(())
}

/// Enhanced rule validator with detailed checks
pub struct EnhancedRuleValidator;

impl RuleValidator for EnhancedRuleValidator {
    fn validate_rule(&self, rule: &Rule) -> ReconResult<()> {
        // Basic validation
        DefaultRuleValidator.validate_rule(rule)?;

        validate_owner_id(&rule.owner_id)?;
        validate_rule_pattern(&rule.pattern)?;
        if let RuleAction::CreateEntry { category, .. } = &rule.action {
            validate_category(category)?;
        }

        if rule.priority < 0 {
            return Err(ReconError::Validation(format!(
                "Rule '{}' has a negative priority",
                rule.pattern
            )));
        }

        Ok(())
    }
}
