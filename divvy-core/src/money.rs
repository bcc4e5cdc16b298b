//! Fixed-point monetary values
//!
//! All amounts are integer minor units (cents). Arithmetic never leaves the
//! integer domain; rounding happens only at the decimal-string boundary and
//! rounds half to even.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// A monetary amount in minor units (cents)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn abs(self) -> Money {
        Money(self.0.abs())
    }

    pub fn min(self, other: Money) -> Money {
        Money(self.0.min(other.0))
    }

    pub fn checked_add(self, other: Money) -> Result<Money> {
        self.0.checked_add(other.0).map(Money).ok_or(Error::Overflow)
    }

    pub fn checked_sub(self, other: Money) -> Result<Money> {
        self.0.checked_sub(other.0).map(Money).ok_or(Error::Overflow)
    }

    /// Parse a decimal string ("12.34", "-0.5", "7") into cents.
    ///
    /// Fractional digits beyond the cent are rounded half to even, the only
    /// place rounding is permitted.
    pub fn from_decimal_str(s: &str) -> Result<Money> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAmount("empty string".into()));
        }

        let (negative, rest) = match s.strip_prefix('-') {
            Some(r) => (true, r),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };

        let (int_part, frac_part) = match rest.split_once('.') {
            Some((i, f)) => (i, f),
            None => (rest, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(Error::InvalidAmount(format!("malformed amount: {s}")));
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(Error::InvalidAmount(format!("malformed amount: {s}")));
        }

        let whole: i64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| Error::InvalidAmount(format!("integer part out of range: {s}")))?
        };

        let mut frac = frac_part.chars();
        let d1 = frac.next().map(|c| c as i64 - '0' as i64).unwrap_or(0);
        let d2 = frac.next().map(|c| c as i64 - '0' as i64).unwrap_or(0);
        let mut cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(d1 * 10 + d2))
            .ok_or(Error::Overflow)?;

        // Half-to-even on the remaining digits
        let tail: String = frac.collect();
        if !tail.is_empty() {
            let first = tail.as_bytes()[0] - b'0';
            let rest_nonzero = tail.as_bytes()[1..].iter().any(|&b| b != b'0');
            let round_up = match first.cmp(&5) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => rest_nonzero || cents % 2 == 1,
            };
            if round_up {
                cents = cents.checked_add(1).ok_or(Error::Overflow)?;
            }
        }

        Ok(Money(if negative { -cents } else { cents }))
    }
}

// Overflowing i64 cents means the ledger is already corrupt; abort rather
// than wrap. Fallible paths use checked_add/checked_sub instead.
impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.checked_add(rhs.0).expect("money arithmetic overflow"))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        *self = *self + rhs;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0.checked_sub(rhs.0).expect("money arithmetic overflow"))
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        *self = *self - rhs;
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Money::from_cents(123_45).to_string(), "123.45");
        assert_eq!(Money::from_cents(-50).to_string(), "-0.50");
        assert_eq!(Money::ZERO.to_string(), "0.00");
        assert_eq!(Money::from_cents(7).to_string(), "0.07");
    }

    #[test]
    fn test_parse_plain() {
        assert_eq!(Money::from_decimal_str("12.34").unwrap(), Money::from_cents(1234));
        assert_eq!(Money::from_decimal_str("7").unwrap(), Money::from_cents(700));
        assert_eq!(Money::from_decimal_str("-0.5").unwrap(), Money::from_cents(-50));
        assert_eq!(Money::from_decimal_str(".25").unwrap(), Money::from_cents(25));
    }

    #[test]
    fn test_parse_rounds_half_to_even() {
        // .005 is exactly half a cent: round to the even cent
        assert_eq!(Money::from_decimal_str("1.005").unwrap(), Money::from_cents(100));
        assert_eq!(Money::from_decimal_str("1.015").unwrap(), Money::from_cents(102));
        // Anything past the half rounds up
        assert_eq!(Money::from_decimal_str("1.0051").unwrap(), Money::from_cents(101));
        assert_eq!(Money::from_decimal_str("1.0049").unwrap(), Money::from_cents(100));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Money::from_decimal_str("").is_err());
        assert!(Money::from_decimal_str("abc").is_err());
        assert!(Money::from_decimal_str("1.2.3").is_err());
        assert!(Money::from_decimal_str(".").is_err());
    }

    #[test]
    fn test_checked_overflow() {
        let max = Money::from_cents(i64::MAX);
        assert_eq!(max.checked_add(Money::from_cents(1)), Err(Error::Overflow));
        assert!(max.checked_sub(Money::from_cents(1)).is_ok());
    }

    #[test]
    fn test_serde_as_integer() {
        let m = Money::from_cents(9000);
        assert_eq!(serde_json::to_string(&m).unwrap(), "9000");
        let back: Money = serde_json::from_str("9000").unwrap();
        assert_eq!(back, m);
    }
}
