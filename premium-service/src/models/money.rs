use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// An amount in integer minor units (cents) with its ISO currency code.
///
/// Both supported currencies (USD, KES) use two decimal places.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub minor_units: i64,
    pub currency: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("amount {0} is not a whole number of major units")]
    Fractional(String),
}

impl Money {
    pub fn new(minor_units: i64, currency: impl Into<String>) -> Self {
        Self {
            minor_units,
            currency: currency.into().to_uppercase(),
        }
    }

    pub fn from_major(units: i64, currency: impl Into<String>) -> Self {
        Self::new(units * 100, currency)
    }

    /// Parse a provider decimal string such as `"9.99"`, `"100"` or `"99.9"`.
    pub fn parse(value: &str, currency: impl Into<String>) -> Result<Self, MoneyError> {
        let trimmed = value.trim();
        let invalid = || MoneyError::InvalidAmount(value.to_string());

        let (whole, fraction) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        // Extra precision is only accepted when it is zero ("9.990").
        let (cents, rest) = fraction.split_at(fraction.len().min(2));
        if rest.bytes().any(|b| b != b'0') {
            return Err(invalid());
        }

        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let cents: i64 = format!("{:0<2}", cents).parse().map_err(|_| invalid())?;

        whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(cents))
            .map(|minor| Self::new(minor, currency))
            .ok_or_else(invalid)
    }

    /// `"9.99"` style rendering used in provider order payloads.
    pub fn to_decimal_string(&self) -> String {
        format!("{}.{:02}", self.minor_units / 100, self.minor_units % 100)
    }

    /// Whole major units, for providers that reject fractional amounts.
    pub fn whole_units(&self) -> Result<i64, MoneyError> {
        if self.minor_units % 100 != 0 {
            return Err(MoneyError::Fractional(self.to_decimal_string()));
        }
        Ok(self.minor_units / 100)
    }

    pub fn same_as(&self, other: &Money) -> bool {
        self.minor_units == other.minor_units && self.currency.eq_ignore_ascii_case(&other.currency)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_decimal_string(), self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_decimals() {
        assert_eq!(Money::parse("9.99", "USD").unwrap().minor_units, 999);
        assert_eq!(Money::parse("99.9", "usd").unwrap().minor_units, 9990);
        assert_eq!(Money::parse("1300", "KES").unwrap().minor_units, 130000);
        assert_eq!(Money::parse("1.00", "USD").unwrap().minor_units, 100);
        assert_eq!(Money::parse("9.990", "USD").unwrap().minor_units, 999);
        assert_eq!(Money::parse("9.99", "usd").unwrap().currency, "USD");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Money::parse("", "USD").is_err());
        assert!(Money::parse("-1.00", "USD").is_err());
        assert!(Money::parse("9.999", "USD").is_err());
        assert!(Money::parse("abc", "USD").is_err());
        assert!(Money::parse(".50", "USD").is_err());
    }

    #[test]
    fn renders_two_decimals() {
        assert_eq!(Money::new(999, "USD").to_decimal_string(), "9.99");
        assert_eq!(Money::new(9999, "USD").to_decimal_string(), "99.99");
        assert_eq!(Money::from_major(1300, "KES").to_decimal_string(), "1300.00");
    }

    #[test]
    fn whole_units_rejects_cents() {
        assert_eq!(Money::from_major(1299, "KES").whole_units().unwrap(), 1299);
        assert!(Money::new(999, "KES").whole_units().is_err());
    }

    #[test]
    fn comparison_ignores_currency_case() {
        assert!(Money::new(999, "USD").same_as(&Money::new(999, "usd")));
        assert!(!Money::new(999, "USD").same_as(&Money::new(100, "USD")));
        assert!(!Money::new(999, "USD").same_as(&Money::new(999, "KES")));
    }
}
