//! Conversions between atomic token units and human-readable decimal strings.
//!
//! Formatting keeps at least one fractional digit (`"0.0"` for zero), trims
//! trailing zeros in the fraction, and never uses scientific notation.
//! Parsing accepts plain decimal strings like `"5.00"` and scales them by the
//! token's decimal places.

use alloy_primitives::U256;
use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum AmountParseError {
    #[error("Invalid amount format: {0}")]
    InvalidFormat(String),
    #[error("Negative amounts are not allowed")]
    Negative,
    #[error("Too many decimal places: {given} given, token supports {supported}")]
    TooPrecise { given: u32, supported: u32 },
}

/// Format an atomic token amount as a human-readable decimal string.
pub fn format_units(atomic: U256, decimals: u8) -> String {
    if decimals == 0 {
        return format!("{atomic}.0");
    }
    let base = U256::from(10).pow(U256::from(decimals as u64));
    let int = atomic / base;
    let frac = atomic % base;

    let mut frac_str = frac.to_string();
    while frac_str.len() < decimals as usize {
        frac_str.insert(0, '0');
    }
    let trimmed = frac_str.trim_end_matches('0');
    if trimmed.is_empty() {
        format!("{int}.0")
    } else {
        format!("{int}.{trimmed}")
    }
}

/// Parse a human-readable decimal amount into atomic token units.
pub fn parse_units(input: &str, decimals: u8) -> Result<U256, AmountParseError> {
    let parsed = Decimal::from_str(input.trim())
        .map_err(|_| AmountParseError::InvalidFormat(input.to_string()))?;
    if parsed.is_sign_negative() {
        return Err(AmountParseError::Negative);
    }
    let scale = parsed.scale();
    let token_scale = decimals as u32;
    if scale > token_scale {
        return Err(AmountParseError::TooPrecise {
            given: scale,
            supported: token_scale,
        });
    }
    let multiplier = U256::from(10).pow(U256::from(token_scale - scale));
    let digits = parsed.mantissa().unsigned_abs();
    Ok(U256::from(digits) * multiplier)
}
