//! Spending-rules enforcement.
//!
//! Checks run in a fixed order and fail fast on the first violation:
//! per-transaction limit, rolling daily cap, blocklist, allowlist. Blocked
//! patterns win over allowed ones. Every error message carries the limit and
//! the offending value so an agent can relay it verbatim.

use alloy_primitives::U256;
use serde::Deserialize;

use crate::amount::{format_units, parse_units};
use crate::network::USDC_DECIMALS;
use crate::store::SpendingRules;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Amount {amount} USDC exceeds the per-transaction limit of {limit} USDC")]
    OverPerTransaction { limit: String, amount: String },
    #[error(
        "Amount {amount} USDC would exceed the daily cap of {cap} USDC ({spent} USDC already spent today)"
    )]
    OverDailyCap {
        cap: String,
        spent: String,
        amount: String,
    },
    #[error("Service {service} is blocked by pattern \"{pattern}\"")]
    Blocked { pattern: String, service: String },
    #[error("Service {service} is not on the allowed list")]
    NotAllowed { service: String },
    #[error("Rule limit \"{value}\" is not a valid USDC amount: {reason}")]
    InvalidLimit { value: String, reason: String },
}

/// Partial rules update. A limit field can be absent (keep), null (clear),
/// or a decimal string (replace); list fields replace wholesale.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesPatch {
    #[serde(default, with = "serde_with::rust::double_option")]
    pub max_per_transaction: Option<Option<String>>,
    #[serde(default, with = "serde_with::rust::double_option")]
    pub daily_cap: Option<Option<String>>,
    #[serde(default)]
    pub allowed_services: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_services: Option<Vec<String>>,
}

fn parse_limit(value: &str) -> Result<U256, RuleError> {
    parse_units(value, USDC_DECIMALS).map_err(|e| RuleError::InvalidLimit {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Apply a patch, validating limit strings and normalizing service patterns
/// to lowercase. Each present field individually replaces the stored one.
pub fn apply_patch(rules: &mut SpendingRules, patch: RulesPatch) -> Result<(), RuleError> {
    if let Some(limit) = patch.max_per_transaction {
        if let Some(value) = &limit {
            parse_limit(value)?;
        }
        rules.max_per_transaction = limit;
    }
    if let Some(cap) = patch.daily_cap {
        if let Some(value) = &cap {
            parse_limit(value)?;
        }
        rules.daily_cap = cap;
    }
    if let Some(allowed) = patch.allowed_services {
        rules.allowed_services = normalize(allowed);
    }
    if let Some(blocked) = patch.blocked_services {
        rules.blocked_services = normalize(blocked);
    }
    Ok(())
}

fn normalize(patterns: Vec<String>) -> Vec<String> {
    patterns
        .into_iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Validate a pending payment against the wallet's rules.
///
/// `today_spent` is the atomic USDC already settled today, recomputed from
/// the ledger by the caller on every invocation.
pub fn enforce(
    rules: &SpendingRules,
    today_spent: U256,
    amount: U256,
    service: &str,
) -> Result<(), RuleError> {
    if let Some(limit) = &rules.max_per_transaction {
        let limit_atomic = parse_limit(limit)?;
        if amount > limit_atomic {
            return Err(RuleError::OverPerTransaction {
                limit: limit.clone(),
                amount: format_units(amount, USDC_DECIMALS),
            });
        }
    }

    if let Some(cap) = &rules.daily_cap {
        let cap_atomic = parse_limit(cap)?;
        if today_spent.saturating_add(amount) > cap_atomic {
            return Err(RuleError::OverDailyCap {
                cap: cap.clone(),
                spent: format_units(today_spent, USDC_DECIMALS),
                amount: format_units(amount, USDC_DECIMALS),
            });
        }
    }

    let service = service.to_lowercase();
    for pattern in &rules.blocked_services {
        if service.contains(&pattern.to_lowercase()) {
            return Err(RuleError::Blocked {
                pattern: pattern.clone(),
                service,
            });
        }
    }

    if !rules.allowed_services.is_empty()
        && !rules
            .allowed_services
            .iter()
            .any(|pattern| service.contains(&pattern.to_lowercase()))
    {
        return Err(RuleError::NotAllowed { service });
    }

    Ok(())
}
