use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::Result;
use crate::hll::HyperLogLog;

pub const DEFAULT_MAX_SAMPLES: usize = 10;

/// Serde transport for an HLL sketch: precision plus base64 registers, so
/// key state survives cross-process session transfer.
pub mod sketch_serde {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::hll::HyperLogLog;

    #[derive(Serialize, Deserialize)]
    struct Encoded {
        precision: u8,
        registers: String,
    }

    pub fn serialize<S: Serializer>(hll: &HyperLogLog, s: S) -> Result<S::Ok, S::Error> {
        let bytes = hll.to_bytes();
        Encoded {
            precision: hll.precision(),
            registers: STANDARD.encode(&bytes[1..]),
        }
        .serialize(s)
    }

    /// Corrupt sketch bytes reset the sketch rather than fail the whole
    /// entity; the error is logged and processing continues.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<HyperLogLog, D::Error> {
        let encoded = Encoded::deserialize(d)?;
        let registers = match STANDARD.decode(&encoded.registers) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("undecodable HLL registers, resetting sketch: {e}");
                return Ok(HyperLogLog::default());
            }
        };
        let mut bytes = Vec::with_capacity(1 + registers.len());
        bytes.push(encoded.precision);
        bytes.extend_from_slice(&registers);
        match HyperLogLog::from_bytes(&bytes) {
            Ok(hll) => Ok(hll),
            Err(e) => {
                tracing::warn!("corrupt HLL sketch, resetting: {e}");
                Ok(HyperLogLog::default())
            }
        }
    }
}

fn sorted_samples<S: Serializer>(samples: &Vec<String>, s: S) -> std::result::Result<S::Ok, S::Error> {
    let mut sorted = samples.clone();
    sorted.sort();
    sorted.serialize(s)
}

fn default_max_samples() -> usize {
    DEFAULT_MAX_SAMPLES
}

/// Aggregate state for one attribute key under one parent entity: how
/// often it was seen, an estimate of how many distinct values it took,
/// and a bounded set of example values.
///
/// `sample_values` keeps order of first sight in memory and is sorted only
/// when serialized. `percentage` is owned by the parent entity, which
/// recomputes it against its own sample count after every merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyState {
    pub count: u64,
    pub percentage: f64,
    pub estimated_cardinality: u64,
    #[serde(rename = "sample_values", serialize_with = "sorted_samples")]
    samples: Vec<String>,
    #[serde(with = "sketch_serde")]
    sketch: HyperLogLog,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip, default = "default_max_samples")]
    max_samples: usize,
}

impl KeyState {
    pub fn new(precision: u8, max_samples: usize, now: DateTime<Utc>) -> Self {
        KeyState {
            count: 0,
            percentage: 0.0,
            estimated_cardinality: 0,
            samples: Vec::new(),
            sketch: HyperLogLog::new(precision),
            first_seen: now,
            last_seen: now,
            max_samples,
        }
    }

    pub fn observe(&mut self, value: &str, now: DateTime<Utc>) {
        self.count += 1;
        self.sketch.insert(value.as_bytes());
        if self.samples.len() < self.max_samples && !self.samples.iter().any(|s| s == value) {
            self.samples.push(value.to_string());
        }
        self.refresh_cardinality();
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Combine two key states built from disjoint observation streams.
    /// Counter addition, HLL union, and first-seen-wins sample union are
    /// all commutative, so merge order does not matter.
    pub fn merge(&mut self, other: &KeyState) -> Result<()> {
        self.count += other.count;
        self.sketch.merge(&other.sketch)?;
        for sample in &other.samples {
            if self.samples.len() >= self.max_samples {
                break;
            }
            if !self.samples.iter().any(|s| s == sample) {
                self.samples.push(sample.clone());
            }
        }
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.refresh_cardinality();
        Ok(())
    }

    /// The estimate is floored by two pieces of exact evidence: the
    /// sample list (the sketch can undershoot by one at tiny counts) and
    /// its own previous value (the estimator can dip a little when it
    /// crosses a correction boundary, but reported cardinality must
    /// never move backward).
    fn refresh_cardinality(&mut self) {
        self.estimated_cardinality = self
            .estimated_cardinality
            .max(self.sketch.count())
            .max(self.samples.len() as u64);
    }

    /// Called by the parent after any merge or observation batch so the
    /// stored percentage is never stale.
    pub fn set_parent_total(&mut self, parent_sample_count: u64) {
        self.percentage = if parent_sample_count == 0 {
            0.0
        } else {
            100.0 * self.count as f64 / parent_sample_count as f64
        };
    }

    /// Samples in order of first sight (serialization sorts, this does not).
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn sketch(&self) -> &HyperLogLog {
        &self.sketch
    }

    pub fn sketch_bytes(&self) -> Vec<u8> {
        self.sketch.to_bytes()
    }

    /// Rebuild key state from a persisted catalog row. A corrupt sketch
    /// resets to empty with zero cardinality; the caller logs it.
    pub fn from_parts(
        count: u64,
        sketch: HyperLogLog,
        samples: Vec<String>,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
        max_samples: usize,
    ) -> Self {
        let mut state = KeyState {
            count,
            percentage: 0.0,
            estimated_cardinality: 0,
            samples,
            sketch,
            first_seen,
            last_seen,
            max_samples,
        };
        state.samples.truncate(max_samples);
        state.refresh_cardinality();
        state
    }
}
