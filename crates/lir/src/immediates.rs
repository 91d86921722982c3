//! Immediate operands.
//!
//! Float immediates are stored as their bit pattern so that instructions
//! stay `Copy`, `Eq` and `Hash` even for NaN payloads.

use std::fmt;
use std::str::FromStr;

/// An IEEE 754 binary64 immediate, stored as bits.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Ieee64(u64);

impl Ieee64 {
    pub fn with_bits(bits: u64) -> Ieee64 {
        Ieee64(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }
}

impl From<f64> for Ieee64 {
    fn from(val: f64) -> Ieee64 {
        Ieee64(val.to_bits())
    }
}

impl From<Ieee64> for f64 {
    fn from(imm: Ieee64) -> f64 {
        f64::from_bits(imm.0)
    }
}

impl fmt::Display for Ieee64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let val = f64::from_bits(self.0);
        if val.is_finite() {
            // Rust's shortest round-trip representation, with a `.0` so
            // the text never reads like an integer immediate.
            if val == val.trunc() && val.abs() < 1e15 {
                write!(f, "{:.1}", val)
            } else {
                write!(f, "{}", val)
            }
        } else {
            write!(f, "0x{:016x}", self.0)
        }
    }
}

impl FromStr for Ieee64 {
    type Err = String;

    fn from_str(s: &str) -> Result<Ieee64, String> {
        if let Some(hex) = s.strip_prefix("0x") {
            let bits =
                u64::from_str_radix(hex, 16).map_err(|_| format!("bad float bits: {}", s))?;
            return Ok(Ieee64(bits));
        }
        let val: f64 = s.parse().map_err(|_| format!("bad float immediate: {}", s))?;
        Ok(Ieee64::from(val))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips() {
        for val in [0.0, 1.0, -2.5, 0.1, f64::NAN, f64::INFINITY] {
            let imm = Ieee64::from(val);
            let back: Ieee64 = imm.to_string().parse().unwrap();
            assert_eq!(imm.bits(), back.bits(), "{}", imm);
        }
    }
}
