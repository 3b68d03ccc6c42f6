//! Exact money arithmetic.
//!
//! Amounts are stored as a signed integer count of thousandths (the
//! currency's smallest sub-unit), never as binary floating point, so
//! aggregating thousands of transactions cannot accumulate rounding error.

use core::fmt;
use core::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DomainError;

/// Fixed-point monetary amount with 3 fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    /// Scaled units per whole currency unit.
    pub const SCALE: i64 = 1_000;

    pub const ZERO: Amount = Amount(0);

    /// Smallest representable step (0.001); also the adjustment epsilon.
    pub const EPSILON: Amount = Amount(1);

    /// Build from a raw count of thousandths.
    pub const fn from_scaled(value: i64) -> Self {
        Amount(value)
    }

    /// Build from a whole number of currency units.
    pub const fn from_units(value: i64) -> Self {
        Amount(value * Self::SCALE)
    }

    pub const fn as_scaled(&self) -> i64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub const fn abs(&self) -> Amount {
        Amount(self.0.abs())
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    /// One percent of the amount, rounded half-up on the sub-unit.
    ///
    /// Used for reload commissions; informational only, never part of a
    /// balance computation.
    pub fn one_percent(&self) -> Amount {
        Amount((self.0 + 50) / 100)
    }

    /// Sum an i128 accumulation back into an `Amount`.
    ///
    /// Store aggregations widen to i128 while summing; the final total must
    /// still fit the fixed-point range.
    pub fn from_scaled_total(total: i128) -> Result<Amount, DomainError> {
        i64::try_from(total)
            .map(Amount)
            .map_err(|_| DomainError::invariant("amount aggregation overflowed"))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / Self::SCALE as u64;
        let frac = abs % Self::SCALE as u64;
        write!(f, "{sign}{whole}.{frac:03}")
    }
}

impl FromStr for Amount {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };

        if whole.is_empty() && frac.is_empty() {
            return Err(DomainError::validation(format!("malformed amount '{s}'")));
        }
        if frac.len() > 3 {
            return Err(DomainError::validation(format!(
                "amount '{s}' exceeds 3 decimal places"
            )));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(DomainError::validation(format!("malformed amount '{s}'")));
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| DomainError::validation(format!("amount '{s}' out of range")))?
        };

        let mut frac_scaled: i64 = if frac.is_empty() {
            0
        } else {
            frac.parse()
                .map_err(|_| DomainError::validation(format!("malformed amount '{s}'")))?
        };
        for _ in frac.len()..3 {
            frac_scaled *= 10;
        }

        let scaled = whole
            .checked_mul(Self::SCALE)
            .and_then(|w| w.checked_add(frac_scaled))
            .ok_or_else(|| DomainError::validation(format!("amount '{s}' out of range")))?;

        Ok(Amount(if negative { -scaled } else { scaled }))
    }
}

impl std::ops::Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl std::ops::Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

/// Serialized as the canonical 3-decimal string (`"10.000"`) so JSON
/// consumers never see a binary float.
impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Accepts both the canonical string form and plain JSON numbers (the mobile
/// clients send numbers).
impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        struct AmountVisitor;

        impl<'de> Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal string with up to 3 fractional digits, or a number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.parse().map_err(|e: DomainError| E::custom(e))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                v.checked_mul(Amount::SCALE)
                    .map(Amount)
                    .ok_or_else(|| E::custom("amount out of range"))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                i64::try_from(v)
                    .ok()
                    .and_then(|v| v.checked_mul(Amount::SCALE))
                    .map(Amount)
                    .ok_or_else(|| E::custom("amount out of range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
                let scaled = (v * Amount::SCALE as f64).round();
                if !scaled.is_finite() || scaled < i64::MIN as f64 || scaled > i64::MAX as f64 {
                    return Err(E::custom("amount out of range"));
                }
                Ok(Amount(scaled as i64))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}
