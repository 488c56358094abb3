use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// A price-like numeric value in human-readable currency format.
/// Accepts strings like `"$0.01"`, `"1,000"`, or raw numbers.
///
/// Used by the middleware `price` shorthand to turn a human-readable amount
/// into atomic token units given a token's decimals.
#[derive(Debug, Clone, PartialEq)]
pub struct MoneyAmount(pub Decimal);

impl MoneyAmount {
    /// Number of digits after the decimal point in the original input.
    ///
    /// Checked against the token's decimals when scaling to atomic units.
    pub fn scale(&self) -> u32 {
        self.0.scale()
    }

    /// Absolute mantissa of the decimal value as an unsigned integer.
    ///
    /// The mantissa of `12.34` is `1234`.
    pub fn mantissa(&self) -> u128 {
        self.0.mantissa().unsigned_abs()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MoneyAmountParseError {
    #[error("Invalid number format")]
    InvalidFormat,
    #[error(
        "Amount must be between {} and {}",
        money_amount::MIN_STR,
        money_amount::MAX_STR
    )]
    OutOfRange,
    #[error("Negative value is not allowed")]
    Negative,
    #[error("Too big of a precision: {money} vs {token} on token")]
    WrongPrecision { money: u32, token: u32 },
}

mod money_amount {
    use super::*;
    use once_cell::sync::Lazy;

    pub const MIN_STR: &str = "0.000000001";
    pub const MAX_STR: &str = "999999999";

    pub static MIN: Lazy<Decimal> =
        Lazy::new(|| Decimal::from_str(MIN_STR).expect("valid decimal"));
    pub static MAX: Lazy<Decimal> =
        Lazy::new(|| Decimal::from_str(MAX_STR).expect("valid decimal"));
}

impl MoneyAmount {
    pub fn parse(input: &str) -> Result<Self, MoneyAmountParseError> {
        // Remove anything that isn't digit, dot, minus
        let cleaned = Regex::new(r"[^\d\.\-]+")
            .expect("static pattern")
            .replace_all(input, "")
            .to_string();

        let parsed =
            Decimal::from_str(&cleaned).map_err(|_| MoneyAmountParseError::InvalidFormat)?;

        if parsed.is_sign_negative() {
            return Err(MoneyAmountParseError::Negative);
        }

        if parsed < *money_amount::MIN || parsed > *money_amount::MAX {
            return Err(MoneyAmountParseError::OutOfRange);
        }

        Ok(MoneyAmount(parsed))
    }
}

impl FromStr for MoneyAmount {
    type Err = MoneyAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MoneyAmount::parse(s)
    }
}

impl TryFrom<&str> for MoneyAmount {
    type Error = MoneyAmountParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        MoneyAmount::from_str(value)
    }
}

impl From<u128> for MoneyAmount {
    fn from(value: u128) -> Self {
        MoneyAmount(Decimal::from(value))
    }
}

impl TryFrom<f64> for MoneyAmount {
    type Error = MoneyAmountParseError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        let decimal = Decimal::from_f64(value).ok_or(MoneyAmountParseError::OutOfRange)?;
        if decimal.is_sign_negative() {
            return Err(MoneyAmountParseError::Negative);
        }
        if decimal < *money_amount::MIN || decimal > *money_amount::MAX {
            return Err(MoneyAmountParseError::OutOfRange);
        }
        Ok(MoneyAmount(decimal))
    }
}

impl Display for MoneyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dollar_prefix() {
        let amount = MoneyAmount::parse("$10.50").unwrap();
        assert_eq!(amount.mantissa(), 1050);
        assert_eq!(amount.scale(), 2);
    }

    #[test]
    fn parses_thousands_separator() {
        let amount = MoneyAmount::parse("1,000").unwrap();
        assert_eq!(amount.mantissa(), 1000);
        assert_eq!(amount.scale(), 0);
    }

    #[test]
    fn rejects_negative() {
        assert!(matches!(
            MoneyAmount::parse("-5"),
            Err(MoneyAmountParseError::Negative)
        ));
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(matches!(
            MoneyAmount::parse("99999999999"),
            Err(MoneyAmountParseError::OutOfRange)
        ));
    }
}
