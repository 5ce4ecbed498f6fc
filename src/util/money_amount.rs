//! Human-readable prices.
//!
//! [`MoneyAmount`] parses strings like `"0.10"`, `"$10.50"` or `"1,000"` into a decimal and
//! converts it to token atomic units.
//!
//! ```rust
//! use x402_gate::util::money_amount::MoneyAmount;
//!
//! let price = MoneyAmount::parse("$0.10").unwrap();
//! assert_eq!(price.to_atomic(6).unwrap().to_string(), "100000");
//! ```

use alloy_primitives::U256;
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::LazyLock;

/// A non-negative decimal amount of currency.
#[derive(Debug, Clone, PartialEq)]
pub struct MoneyAmount(pub Decimal);

#[derive(Debug, thiserror::Error)]
pub enum MoneyAmountParseError {
    #[error("Invalid number format")]
    InvalidFormat,
    #[error(
        "Amount must be between {} and {}",
        constants::MIN_STR,
        constants::MAX_STR
    )]
    OutOfRange,
    #[error("Negative value is not allowed")]
    Negative,
    #[error("Amount does not fit into {0} token decimals")]
    Overflow(u32),
}

mod constants {
    use super::*;

    pub const MIN_STR: &str = "0.000000001";
    pub const MAX_STR: &str = "999999999";

    pub static MIN: LazyLock<Decimal> =
        LazyLock::new(|| Decimal::from_str(MIN_STR).expect("valid decimal"));
    pub static MAX: LazyLock<Decimal> =
        LazyLock::new(|| Decimal::from_str(MAX_STR).expect("valid decimal"));
}

static NON_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\d\.\-]+").expect("valid regex"));

impl MoneyAmount {
    /// Parses a price, ignoring currency symbols, separators and whitespace.
    pub fn parse(input: &str) -> Result<Self, MoneyAmountParseError> {
        let cleaned = NON_NUMERIC.replace_all(input, "");
        let parsed =
            Decimal::from_str(&cleaned).map_err(|_| MoneyAmountParseError::InvalidFormat)?;
        if parsed.is_sign_negative() {
            return Err(MoneyAmountParseError::Negative);
        }
        if parsed < *constants::MIN || parsed > *constants::MAX {
            return Err(MoneyAmountParseError::OutOfRange);
        }
        Ok(MoneyAmount(parsed))
    }

    /// Converts to atomic units at `decimals`, truncating toward zero.
    ///
    /// `0.1234567` at 6 decimals is `123456`.
    pub fn to_atomic(&self, decimals: u32) -> Result<U256, MoneyAmountParseError> {
        let factor = 10u64
            .checked_pow(decimals)
            .ok_or(MoneyAmountParseError::Overflow(decimals))?;
        let scaled = self
            .0
            .checked_mul(Decimal::from(factor))
            .ok_or(MoneyAmountParseError::Overflow(decimals))?
            .trunc();
        let atomic = scaled
            .to_u128()
            .ok_or(MoneyAmountParseError::Overflow(decimals))?;
        Ok(U256::from(atomic))
    }
}

impl FromStr for MoneyAmount {
    type Err = MoneyAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MoneyAmount::parse(s)
    }
}

impl Display for MoneyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}
