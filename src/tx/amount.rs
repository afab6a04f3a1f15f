//! Exact coin amounts
//!
//! Amounts are integer minor units end to end. Decimal text is only produced
//! or consumed at the edges (user input, node JSON), and never goes through
//! floating point.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Minor units per coin
pub const COIN: u64 = 100_000_000;

/// Largest representable amount (total supply)
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

const DECIMALS: usize = 8;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount cannot be negative")]
    Negative,
    #[error("amount has more than 8 decimal places")]
    TooPrecise,
    #[error("amount exceeds the maximum supply")]
    TooLarge,
    #[error("'{0}' is not a number")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_minor(minor: u64) -> Result<Self, AmountError> {
        if minor > MAX_MONEY {
            return Err(AmountError::TooLarge);
        }
        Ok(Amount(minor))
    }

    pub fn minor(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0
            .checked_add(other.0)
            .filter(|sum| *sum <= MAX_MONEY)
            .map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Sum, or `None` when it leaves the representable range
    pub fn checked_sum<I: IntoIterator<Item = Amount>>(amounts: I) -> Option<Amount> {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |acc, amount| acc.checked_add(amount))
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    /// Parse decimal coin text such as `"1"`, `"0.001"` or `".5"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError::Empty);
        }
        if s.starts_with('-') {
            return Err(AmountError::Negative);
        }
        let s = s.strip_prefix('+').unwrap_or(s);

        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        let digits_only = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (whole.is_empty() && frac.is_empty()) || !digits_only(whole) || !digits_only(frac) {
            return Err(AmountError::Invalid(s.to_string()));
        }

        // Trailing zeros beyond eight places carry no value
        let frac = frac.trim_end_matches('0');
        if frac.len() > DECIMALS {
            return Err(AmountError::TooPrecise);
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| AmountError::TooLarge)?
        };
        let frac_minor: u64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<width$}", frac, width = DECIMALS)
                .parse()
                .map_err(|_| AmountError::Invalid(s.to_string()))?
        };

        let minor = whole
            .checked_mul(COIN)
            .and_then(|w| w.checked_add(frac_minor))
            .ok_or(AmountError::TooLarge)?;
        Amount::from_minor(minor)
    }
}

impl fmt::Display for Amount {
    /// Shortest exact decimal form: `100000` minor units prints as `0.001`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / COIN;
        let frac = self.0 % COIN;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let frac = format!("{:08}", frac);
        write!(f, "{}.{}", whole, frac.trim_end_matches('0'))
    }
}

impl Serialize for Amount {
    /// Serialized as a JSON number whose text is the exact decimal
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let number: serde_json::Number = self
            .to_string()
            .parse()
            .map_err(serde::ser::Error::custom)?;
        number.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let number = serde_json::Number::deserialize(deserializer)?;
        number
            .to_string()
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exact_decimals() {
        assert_eq!("1".parse::<Amount>().unwrap().minor(), COIN);
        assert_eq!("0.001".parse::<Amount>().unwrap().minor(), 100_000);
        assert_eq!(".5".parse::<Amount>().unwrap().minor(), 50_000_000);
        assert_eq!("0.00000001".parse::<Amount>().unwrap().minor(), 1);
        assert_eq!("2.100000000".parse::<Amount>().unwrap().minor(), 210_000_000);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!("-1".parse::<Amount>(), Err(AmountError::Negative));
        assert_eq!("0.000000001".parse::<Amount>(), Err(AmountError::TooPrecise));
        assert_eq!("21000001".parse::<Amount>(), Err(AmountError::TooLarge));
        assert_eq!("".parse::<Amount>(), Err(AmountError::Empty));
        assert!(matches!("1e-5".parse::<Amount>(), Err(AmountError::Invalid(_))));
        assert!(matches!(".".parse::<Amount>(), Err(AmountError::Invalid(_))));
    }

    #[test]
    fn test_display_is_shortest_exact_form() {
        assert_eq!(Amount::from_minor(100_000).unwrap().to_string(), "0.001");
        assert_eq!(Amount::from_minor(3 * COIN).unwrap().to_string(), "3");
        assert_eq!(Amount::from_minor(1).unwrap().to_string(), "0.00000001");
    }

    #[test]
    fn test_json_number_text_is_exact() {
        let amount = Amount::from_minor(10_000).unwrap();
        assert_eq!(serde_json::to_string(&amount).unwrap(), "0.0001");

        // 0.1 + 0.2 style values survive unchanged
        let parsed: Amount = serde_json::from_str("0.30000000").unwrap();
        assert_eq!(parsed.minor(), 30_000_000);
    }

    #[test]
    fn test_checked_sum_stops_at_max_money() {
        let max = Amount::from_minor(MAX_MONEY).unwrap();
        assert_eq!(Amount::checked_sum([max, Amount::from_minor(1).unwrap()]), None);
        assert_eq!(
            Amount::checked_sum([Amount::from_minor(5).unwrap(), Amount::from_minor(7).unwrap()]),
            Some(Amount::from_minor(12).unwrap())
        );
    }
}
