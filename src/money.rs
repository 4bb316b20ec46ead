//! Fixed-point USDC amounts: one unit is one micro-USDC (1e-6 USDC), matching
//! USDC's 6 on-chain decimals. Internally a `u128` -- plenty of headroom
//! above the spec's 10^15 micro-USDC round-trip bound -- so ledger arithmetic
//! never touches floating point. On-chain amounts observed by the deposit
//! watcher arrive as `alloy_primitives::U256` and are narrowed at that
//! boundary (`evm.rs`), not here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use crate::error::CoreError;

const DECIMALS: u32 = 6;
const SCALE: u128 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Micros(pub u128);

impl Micros {
    pub const ZERO: Micros = Micros(0);

    pub fn from_micros(v: u128) -> Self {
        Micros(v)
    }

    pub fn checked_add(self, other: Micros) -> Option<Micros> {
        self.0.checked_add(other.0).map(Micros)
    }

    pub fn checked_sub(self, other: Micros) -> Option<Micros> {
        self.0.checked_sub(other.0).map(Micros)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Multiplies by a plain integer count (e.g. sizing a hold for `n`
    /// upcoming calls at a per-call price).
    pub fn checked_mul_u64(self, n: u64) -> Option<Micros> {
        self.0.checked_mul(n as u128).map(Micros)
    }

    /// Splits `self` into `(fee, remainder)` where `fee` is `bps`
    /// basis-points of the total, rounded down -- the remainder is what the
    /// other party actually receives after the platform's take rate.
    pub fn take_fee_bps(self, bps: u32) -> (Micros, Micros) {
        let fee = self.0 * bps as u128 / 10_000;
        (Micros(fee), Micros(self.0 - fee))
    }

    /// Parse a decimal-fraction string ("12.34", "0.000001", "5") into micros.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit() || b == b'.' || b == b'-') {
            return Err(CoreError::Internal(format!("invalid amount: {s}")));
        }
        if s.starts_with('-') {
            return Err(CoreError::Internal("amount must be non-negative".into()));
        }
        let mut parts = s.splitn(2, '.');
        let whole = parts.next().unwrap_or("0");
        let frac = parts.next().unwrap_or("");
        if frac.len() > DECIMALS as usize {
            return Err(CoreError::Internal(format!(
                "amount has more than {DECIMALS} decimal places"
            )));
        }
        let whole_v: u128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| CoreError::Internal(format!("invalid amount: {s}")))? };
        let mut frac_padded = frac.to_string();
        while frac_padded.len() < DECIMALS as usize {
            frac_padded.push('0');
        }
        let frac_v: u128 = if frac_padded.is_empty() {
            0
        } else {
            frac_padded.parse().map_err(|_| CoreError::Internal(format!("invalid amount: {s}")))?
        };
        let total = whole_v
            .checked_mul(SCALE)
            .and_then(|w| w.checked_add(frac_v))
            .ok_or_else(|| CoreError::Internal("amount overflow".into()))?;
        Ok(Micros(total))
    }

    /// Render as a decimal-fraction string with exactly `DECIMALS` places.
    pub fn format(self) -> String {
        let whole = self.0 / SCALE;
        let frac = self.0 % SCALE;
        format!("{whole}.{frac:0width$}", width = DECIMALS as usize)
    }
}

impl fmt::Display for Micros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl FromStr for Micros {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Micros::parse(s)
    }
}

impl Add for Micros {
    type Output = Micros;
    fn add(self, rhs: Micros) -> Micros {
        Micros(self.0 + rhs.0)
    }
}

impl Sub for Micros {
    type Output = Micros;
    fn sub(self, rhs: Micros) -> Micros {
        Micros(self.0 - rhs.0)
    }
}

impl Serialize for Micros {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.format())
    }
}

impl<'de> Deserialize<'de> for Micros {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Micros::parse(&s).map_err(serde::de::Error::custom)
    }
}
