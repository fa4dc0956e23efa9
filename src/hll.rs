//! HyperLogLog cardinality sketch.
//!
//! Fixed-memory unique-count estimator over byte strings. Used per
//! attribute key (value cardinality) and per metric (active-series
//! tracking). A sketch with precision `p` holds `2^p` one-byte registers,
//! so the default `p = 14` costs 16 KiB and estimates with roughly 0.81%
//! standard error.

use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::error::{Error, Result};

pub const MIN_PRECISION: u8 = 4;
pub const MAX_PRECISION: u8 = 18;
pub const DEFAULT_PRECISION: u8 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

fn hash64(value: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(value);
    hasher.finish()
}

impl HyperLogLog {
    /// Build a sketch with `2^precision` registers. Out-of-range precision
    /// silently falls back to [`DEFAULT_PRECISION`].
    pub fn new(precision: u8) -> Self {
        let precision = if (MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            precision
        } else {
            DEFAULT_PRECISION
        };
        HyperLogLog {
            precision,
            registers: vec![0u8; 1 << precision],
        }
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Register-wise observe: low `p` hash bits pick the register, the
    /// leading-zero rank of the remaining bits is max-merged into it.
    pub fn insert(&mut self, value: &[u8]) {
        let hash = hash64(value);
        let idx = (hash & ((1u64 << self.precision) - 1)) as usize;
        let rest = hash >> self.precision;
        let rank = if rest == 0 {
            64 - self.precision + 1
        } else {
            (rest.leading_zeros() as u8 - self.precision) + 1
        };
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    /// Harmonic-mean estimate with the standard small- and large-range
    /// corrections. Returns the floor of the corrected estimate.
    pub fn count(&self) -> u64 {
        let m = self.registers.len() as f64;
        let mut sum = 0.0f64;
        let mut zeros = 0u64;
        for &r in &self.registers {
            sum += 1.0 / (1u64 << r) as f64;
            if r == 0 {
                zeros += 1;
            }
        }

        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m),
        };

        let mut estimate = alpha * m * m / sum;

        if estimate <= 2.5 * m && zeros != 0 {
            // Small range: linear counting over empty registers.
            estimate = m * (m / zeros as f64).ln();
        } else if estimate > (1u64 << 32) as f64 / 30.0 {
            let two32 = (1u64 << 32) as f64;
            estimate = -two32 * (1.0 - estimate / two32).ln();
        }

        estimate.floor() as u64
    }

    /// Register-wise max union. Both sketches must share a precision;
    /// mixing precisions would silently corrupt the estimate, so it is a
    /// hard error.
    pub fn merge(&mut self, other: &HyperLogLog) -> Result<()> {
        if self.precision != other.precision {
            return Err(Error::PrecisionMismatch {
                ours: self.precision,
                theirs: other.precision,
            });
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
        Ok(())
    }

    /// One precision byte followed by the raw registers: `1 + 2^p` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.registers.len());
        out.push(self.precision);
        out.extend_from_slice(&self.registers);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Some((&precision, registers)) = bytes.split_first() else {
            return Err(Error::Format("empty HLL buffer".into()));
        };
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(Error::Format(format!(
                "HLL precision {precision} outside [{MIN_PRECISION}, {MAX_PRECISION}]"
            )));
        }
        let expected = 1usize << precision;
        if registers.len() != expected {
            return Err(Error::Format(format!(
                "HLL buffer holds {} registers, precision {precision} needs {expected}",
                registers.len()
            )));
        }
        Ok(HyperLogLog {
            precision,
            registers: registers.to_vec(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        HyperLogLog::new(DEFAULT_PRECISION)
    }
}
