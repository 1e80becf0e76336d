//! Kubernetes resource quantities
//!
//! Quantities are parsed into an exact decimal (`mantissa * 10^exponent`) so
//! that conversions never pick up floating point noise. `"0.1"` is exactly
//! 100 millicores, and `"4Gi"` at scale 10^6 rounds up to 4295.

use std::cmp::Ordering;

use crate::{Error, Result};

/// A parsed resource quantity
#[derive(Clone, Copy, Debug)]
pub struct Quantity {
    mantissa: i128,
    exponent: i32,
}

impl Quantity {
    /// Parse a quantity string such as `500m`, `1.5`, `4Gi` or `1e3`
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(Error::quantity(raw, "empty quantity"));
        }

        let split = s
            .char_indices()
            .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+'))))
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);

        let (mut mantissa, mut exponent) = parse_decimal(number).ok_or_else(|| {
            Error::quantity(raw, "expected a decimal number followed by an optional suffix")
        })?;

        match suffix {
            "" => {}
            "m" => exponent -= 3,
            "k" => exponent += 3,
            "M" => exponent += 6,
            "G" => exponent += 9,
            "T" => exponent += 12,
            "P" => exponent += 15,
            "E" => exponent += 18,
            "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => {
                let power = match suffix {
                    "Ki" => 10,
                    "Mi" => 20,
                    "Gi" => 30,
                    "Ti" => 40,
                    "Pi" => 50,
                    _ => 60,
                };
                mantissa = mantissa
                    .checked_mul(1i128 << power)
                    .ok_or_else(|| Error::quantity(raw, "value out of range"))?;
            }
            other if other.starts_with(['e', 'E']) => {
                let exp: i32 = other[1..]
                    .parse()
                    .map_err(|_| Error::quantity(raw, format!("unknown suffix '{other}'")))?;
                exponent = exponent
                    .checked_add(exp)
                    .ok_or_else(|| Error::quantity(raw, "exponent out of range"))?;
            }
            other => return Err(Error::quantity(raw, format!("unknown suffix '{other}'"))),
        }

        Ok(Self { mantissa, exponent })
    }

    /// Value in thousandths, rounded up
    pub fn milli_value(&self) -> i64 {
        self.scaled_value(-3)
    }

    /// Value in units of `10^scale`, rounded up.
    ///
    /// Saturates at the `i64` bounds.
    pub fn scaled_value(&self, scale: i32) -> i64 {
        let shift = self.exponent - scale;
        let scaled = if shift >= 0 {
            pow10(shift).and_then(|p| self.mantissa.checked_mul(p))
        } else {
            Some(match pow10(-shift) {
                Some(p) => ceil_div(self.mantissa, p),
                // Divisor larger than any mantissa: rounds up to 1 or down to 0
                None => i128::from(self.mantissa > 0),
            })
        };
        match scaled {
            Some(v) => v.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
            None if self.mantissa < 0 => i64::MIN,
            None => i64::MAX,
        }
    }

    /// Whole-unit value, rounded up
    pub fn value(&self) -> i64 {
        self.scaled_value(0)
    }

    /// True when the quantity is strictly greater than zero
    pub fn is_positive(&self) -> bool {
        self.mantissa > 0
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        let base = self.exponent.min(other.exponent);
        let lhs = pow10(self.exponent - base).and_then(|p| self.mantissa.checked_mul(p));
        let rhs = pow10(other.exponent - base).and_then(|p| other.mantissa.checked_mul(p));
        match (lhs, rhs) {
            (Some(l), Some(r)) => l.cmp(&r),
            // Exponents too far apart for exact alignment
            _ => {
                let l = self.mantissa as f64 * 10f64.powi(self.exponent);
                let r = other.mantissa as f64 * 10f64.powi(other.exponent);
                l.partial_cmp(&r).unwrap_or(Ordering::Equal)
            }
        }
    }
}

fn parse_decimal(number: &str) -> Option<(i128, i32)> {
    let (negative, digits) = match number.as_bytes().first()? {
        b'-' => (true, &number[1..]),
        b'+' => (false, &number[1..]),
        _ => (false, number),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if frac_part.contains('.') {
        return None;
    }

    let mut mantissa: i128 = 0;
    for c in int_part.chars().chain(frac_part.chars()) {
        let d = c.to_digit(10)?;
        mantissa = mantissa.checked_mul(10)?.checked_add(i128::from(d))?;
    }
    let exponent = -i32::try_from(frac_part.len()).ok()?;
    Some((if negative { -mantissa } else { mantissa }, exponent))
}

fn pow10(exp: i32) -> Option<i128> {
    10i128.checked_pow(u32::try_from(exp).ok()?)
}

fn ceil_div(n: i128, d: i128) -> i128 {
    let q = n / d;
    if n % d > 0 {
        q + 1
    } else {
        q
    }
}
