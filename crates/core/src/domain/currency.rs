use std::collections::HashMap;

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("invalid currency code `{code}`")]
    InvalidCurrency { code: String },
    #[error("no exchange rate from `{from}` to `{to}`")]
    UnknownRate { from: String, to: String },
}

/// Converts claim amounts into an organization's base currency.
pub trait CurrencyConverter {
    fn convert(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal, ConversionError>;
}

/// Fixed rate table. Converted amounts are rounded half away from zero to cents.
#[derive(Clone, Debug, Default)]
pub struct StaticRateConverter {
    rates: HashMap<(String, String), Decimal>,
}

impl StaticRateConverter {
    pub fn with_rate(mut self, from: &str, to: &str, rate: Decimal) -> Self {
        self.rates.insert((normalize_code(from), normalize_code(to)), rate);
        self
    }
}

impl CurrencyConverter for StaticRateConverter {
    fn convert(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal, ConversionError> {
        let from = checked_code(from)?;
        let to = checked_code(to)?;
        if from == to {
            return Ok(amount);
        }

        let rate = self
            .rates
            .get(&(from.clone(), to.clone()))
            .copied()
            .ok_or(ConversionError::UnknownRate { from, to })?;

        Ok((amount * rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

fn checked_code(code: &str) -> Result<String, ConversionError> {
    let normalized = normalize_code(code);
    if normalized.len() == 3 && normalized.chars().all(|ch| ch.is_ascii_alphabetic()) {
        Ok(normalized)
    } else {
        Err(ConversionError::InvalidCurrency { code: code.to_string() })
    }
}
