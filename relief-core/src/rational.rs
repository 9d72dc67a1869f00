use std::cmp::Ordering;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RatioParseError {
    #[error("invalid ratio {0:?}")]
    Malformed(String),
    #[error("ratio {0:?} has a zero denominator")]
    ZeroDenominator(String),
}

/// Exact fraction used for intermediate allocation quantities.
///
/// Values are kept normalized (`den > 0`, numerator and denominator coprime),
/// so derived equality and hashing compare values rather than spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ratio {
    num: i128,
    den: i128,
}

impl Ratio {
    pub const ZERO: Ratio = Ratio { num: 0, den: 1 };
    pub const ONE: Ratio = Ratio { num: 1, den: 1 };

    /// Returns `None` for a zero denominator.
    pub fn new(num: i128, den: i128) -> Option<Self> {
        if den == 0 {
            return None;
        }
        Some(Self::normalized(num, den))
    }

    pub fn from_integer(value: u64) -> Self {
        Self {
            num: i128::from(value),
            den: 1,
        }
    }

    fn normalized(num: i128, den: i128) -> Self {
        let sign = if den < 0 { -1 } else { 1 };
        let divisor = gcd(num.abs(), den.abs()).max(1);
        Self {
            num: sign * num / divisor,
            den: sign * den / divisor,
        }
    }

    pub fn numer(&self) -> i128 {
        self.num
    }

    pub fn denom(&self) -> i128 {
        self.den
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn is_positive(&self) -> bool {
        self.num > 0
    }

    pub fn is_integer(&self) -> bool {
        self.den == 1
    }

    pub fn floor(&self) -> i128 {
        self.num.div_euclid(self.den)
    }

    pub fn fract(&self) -> Ratio {
        Self::normalized(self.num.rem_euclid(self.den), self.den)
    }

    /// Whole units below this value; negative values clamp to zero.
    pub fn whole_units(&self) -> u64 {
        self.floor().clamp(0, i128::from(u64::MAX)) as u64
    }

    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

fn gcd(mut a: i128, mut b: i128) -> i128 {
    while b != 0 {
        let rem = a % b;
        a = b;
        b = rem;
    }
    a
}

impl Default for Ratio {
    fn default() -> Self {
        Ratio::ZERO
    }
}

impl From<u64> for Ratio {
    fn from(value: u64) -> Self {
        Ratio::from_integer(value)
    }
}

impl PartialOrd for Ratio {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ratio {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.num * other.den).cmp(&(other.num * self.den))
    }
}

impl Add for Ratio {
    type Output = Ratio;

    fn add(self, rhs: Ratio) -> Ratio {
        if self.den == rhs.den {
            return Ratio::normalized(self.num + rhs.num, self.den);
        }
        Ratio::normalized(self.num * rhs.den + rhs.num * self.den, self.den * rhs.den)
    }
}

impl Sub for Ratio {
    type Output = Ratio;

    fn sub(self, rhs: Ratio) -> Ratio {
        if self.den == rhs.den {
            return Ratio::normalized(self.num - rhs.num, self.den);
        }
        Ratio::normalized(self.num * rhs.den - rhs.num * self.den, self.den * rhs.den)
    }
}

impl Mul for Ratio {
    type Output = Ratio;

    fn mul(self, rhs: Ratio) -> Ratio {
        Ratio::normalized(self.num * rhs.num, self.den * rhs.den)
    }
}

impl AddAssign for Ratio {
    fn add_assign(&mut self, rhs: Ratio) {
        *self = *self + rhs;
    }
}

impl SubAssign for Ratio {
    fn sub_assign(&mut self, rhs: Ratio) {
        *self = *self - rhs;
    }
}

impl Sum for Ratio {
    fn sum<I: Iterator<Item = Ratio>>(iter: I) -> Ratio {
        iter.fold(Ratio::ZERO, |acc, value| acc + value)
    }
}

impl<'a> Sum<&'a Ratio> for Ratio {
    fn sum<I: Iterator<Item = &'a Ratio>>(iter: I) -> Ratio {
        iter.fold(Ratio::ZERO, |acc, value| acc + *value)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl FromStr for Ratio {
    type Err = RatioParseError;

    /// Accepts `"3"`, `"1/10"` and plain decimals such as `"0.15"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let malformed = || RatioParseError::Malformed(s.to_string());

        if let Some((num, den)) = raw.split_once('/') {
            let num: i128 = num.trim().parse().map_err(|_| malformed())?;
            let den: i128 = den.trim().parse().map_err(|_| malformed())?;
            return Ratio::new(num, den).ok_or_else(|| RatioParseError::ZeroDenominator(s.to_string()));
        }

        if let Some((whole, fraction)) = raw.split_once('.') {
            if fraction.is_empty()
                || fraction.len() > 18
                || !fraction.chars().all(|c| c.is_ascii_digit())
            {
                return Err(malformed());
            }
            let negative = whole.starts_with('-');
            let whole: i128 = match whole.trim_start_matches('-') {
                "" => 0,
                digits => digits.parse().map_err(|_| malformed())?,
            };
            let scale = 10_i128.pow(fraction.len() as u32);
            let fraction: i128 = fraction.parse().map_err(|_| malformed())?;
            let magnitude = whole * scale + fraction;
            let num = if negative { -magnitude } else { magnitude };
            return Ok(Ratio::normalized(num, scale));
        }

        let num: i128 = raw.parse().map_err(|_| malformed())?;
        Ok(Ratio::normalized(num, 1))
    }
}

impl Serialize for Ratio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ratio {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RatioVisitor;

        impl<'de> Visitor<'de> for RatioVisitor {
            type Value = Ratio;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a fraction such as \"1/10\", a decimal string, or an integer")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Ratio, E> {
                value.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Ratio, E> {
                Ok(Ratio::from_integer(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Ratio, E> {
                Ok(Ratio::normalized(i128::from(value), 1))
            }
        }

        deserializer.deserialize_any(RatioVisitor)
    }
}
