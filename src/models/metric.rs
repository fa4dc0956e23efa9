use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::keystate::sketch_serde;
use super::{KeyMap, ServicesMap, merge_key_maps, merge_services, refresh_percentages};
use crate::error::Result;
use crate::hll::HyperLogLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Gauge,
    Sum,
    Histogram,
    ExponentialHistogram,
    Summary,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Sum => "sum",
            MetricKind::Histogram => "histogram",
            MetricKind::ExponentialHistogram => "exponential_histogram",
            MetricKind::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Temporality {
    #[default]
    Unspecified,
    Delta,
    Cumulative,
}

impl Temporality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Temporality::Unspecified => "unspecified",
            Temporality::Delta => "delta",
            Temporality::Cumulative => "cumulative",
        }
    }
}

/// Kind-specific payload. Serialized with a `type` discriminator; unknown
/// discriminators are rejected on deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricData {
    Gauge,
    Sum {
        temporality: Temporality,
        is_monotonic: bool,
    },
    Histogram {
        /// Union of explicit bucket bounds observed across data points.
        explicit_bounds: Vec<f64>,
    },
    ExponentialHistogram {
        /// Union of observed scales.
        scales: Vec<i32>,
    },
    Summary,
}

impl MetricData {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricData::Gauge => MetricKind::Gauge,
            MetricData::Sum { .. } => MetricKind::Sum,
            MetricData::Histogram { .. } => MetricKind::Histogram,
            MetricData::ExponentialHistogram { .. } => MetricKind::ExponentialHistogram,
            MetricData::Summary => MetricKind::Summary,
        }
    }

    /// Variant-wise union. Monotonicity ORs, temporality upgrades away
    /// from unspecified, bounds and scales set-union. A kind clash keeps
    /// the first-seen variant (name identity is immutable, so this only
    /// happens when an instrument is redeclared).
    fn merge(&mut self, other: &MetricData) {
        match (self, other) {
            (
                MetricData::Sum { temporality, is_monotonic },
                MetricData::Sum { temporality: t2, is_monotonic: m2 },
            ) => {
                if *temporality == Temporality::Unspecified {
                    *temporality = *t2;
                }
                *is_monotonic |= *m2;
            }
            (
                MetricData::Histogram { explicit_bounds },
                MetricData::Histogram { explicit_bounds: other_bounds },
            ) => {
                for bound in other_bounds {
                    if !explicit_bounds.iter().any(|b| b == bound) {
                        explicit_bounds.push(*bound);
                    }
                }
                explicit_bounds.sort_by(|a, b| a.total_cmp(b));
            }
            (
                MetricData::ExponentialHistogram { scales },
                MetricData::ExponentialHistogram { scales: other_scales },
            ) => {
                for scale in other_scales {
                    if !scales.contains(scale) {
                        scales.push(*scale);
                    }
                }
                scales.sort_unstable();
            }
            _ => {}
        }
    }
}

/// Sorted `k=v` list joined by `,`: the deterministic identity of one
/// label combination, fed to the active-series sketch.
pub fn label_fingerprint(labels: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (i, (key, value)) in labels.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

/// Everything we keep about one metric name. Raw data-point values are
/// never stored; label values survive only as bounded samples inside the
/// per-key state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricMetadata {
    pub name: String,
    pub kind: MetricKind,
    pub unit: String,
    pub description: String,
    pub data: MetricData,
    pub label_keys: KeyMap,
    pub resource_keys: KeyMap,
    pub services: ServicesMap,
    pub sample_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(with = "sketch_serde")]
    pub active_series: HyperLogLog,
}

impl MetricMetadata {
    pub fn new(name: String, data: MetricData, precision: u8, now: DateTime<Utc>) -> Self {
        MetricMetadata {
            name,
            kind: data.kind(),
            unit: String::new(),
            description: String::new(),
            data,
            label_keys: KeyMap::new(),
            resource_keys: KeyMap::new(),
            services: ServicesMap::new(),
            sample_count: 0,
            first_seen: now,
            last_seen: now,
            active_series: HyperLogLog::new(precision),
        }
    }

    pub fn active_series_count(&self) -> u64 {
        self.active_series.count()
    }

    /// Merge another observation of the same metric name. Identity is
    /// immutable; only content merges. All operations are commutative and
    /// associative over disjoint observations.
    pub fn merge(&mut self, other: &MetricMetadata) -> Result<()> {
        self.sample_count += other.sample_count;
        if self.unit.is_empty() {
            self.unit = other.unit.clone();
        }
        if self.description.is_empty() {
            self.description = other.description.clone();
        }
        self.data.merge(&other.data);
        merge_key_maps(&mut self.label_keys, &other.label_keys)?;
        merge_key_maps(&mut self.resource_keys, &other.resource_keys)?;
        merge_services(&mut self.services, &other.services);
        self.active_series.merge(&other.active_series)?;
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.refresh_percentages();
        Ok(())
    }

    pub fn refresh_percentages(&mut self) {
        refresh_percentages(&mut self.label_keys, self.sample_count);
        refresh_percentages(&mut self.resource_keys, self.sample_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::keystate::KeyState;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn meta_with_series(name: &str, range: std::ops::Range<u32>) -> MetricMetadata {
        let mut meta = MetricMetadata::new(name.into(), MetricData::Gauge, 14, now());
        for i in range {
            let labels = BTreeMap::from([
                ("host".to_string(), format!("host-{i}")),
                ("region".to_string(), "eu".to_string()),
            ]);
            meta.active_series.insert(label_fingerprint(&labels).as_bytes());
            meta.sample_count += 1;
            let mut values = meta
                .label_keys
                .remove("host")
                .unwrap_or_else(|| KeyState::new(14, 10, now()));
            values.observe(&format!("host-{i}"), now());
            meta.label_keys.insert("host".into(), values);
        }
        meta
    }

    #[test]
    fn fingerprint_is_sorted_and_stable() {
        let labels = BTreeMap::from([
            ("zone".to_string(), "b".to_string()),
            ("app".to_string(), "api".to_string()),
        ]);
        assert_eq!(label_fingerprint(&labels), "app=api,zone=b");
        assert_eq!(label_fingerprint(&BTreeMap::new()), "");
    }

    #[test]
    fn merge_of_disjoint_halves_matches_whole() {
        let mut left = meta_with_series("http_requests_total", 0..500);
        let right = meta_with_series("http_requests_total", 500..1000);
        left.merge(&right).unwrap();

        assert_eq!(left.sample_count, 1000);
        let series = left.active_series_count();
        assert!(
            (900..=1100).contains(&series),
            "active series {series} outside [900, 1100]"
        );
        assert_eq!(left.label_keys.len(), 1);
        assert_eq!(left.label_keys["host"].count, 1000);
    }

    #[test]
    fn merge_unions_histogram_bounds() {
        let mut a = MetricMetadata::new(
            "latency".into(),
            MetricData::Histogram { explicit_bounds: vec![0.1, 0.5] },
            14,
            now(),
        );
        let b = MetricMetadata::new(
            "latency".into(),
            MetricData::Histogram { explicit_bounds: vec![0.5, 1.0, 5.0] },
            14,
            now(),
        );
        a.merge(&b).unwrap();
        assert_eq!(
            a.data,
            MetricData::Histogram { explicit_bounds: vec![0.1, 0.5, 1.0, 5.0] }
        );
    }

    #[test]
    fn merge_upgrades_sum_fields() {
        let mut a = MetricMetadata::new(
            "events".into(),
            MetricData::Sum { temporality: Temporality::Unspecified, is_monotonic: false },
            14,
            now(),
        );
        let b = MetricMetadata::new(
            "events".into(),
            MetricData::Sum { temporality: Temporality::Cumulative, is_monotonic: true },
            14,
            now(),
        );
        a.merge(&b).unwrap();
        assert_eq!(
            a.data,
            MetricData::Sum { temporality: Temporality::Cumulative, is_monotonic: true }
        );
    }

    #[test]
    fn data_serde_uses_type_discriminator() {
        let json = serde_json::to_value(&MetricData::Sum {
            temporality: Temporality::Delta,
            is_monotonic: true,
        })
        .unwrap();
        assert_eq!(json["type"], "sum");

        let err = serde_json::from_value::<MetricData>(
            serde_json::json!({ "type": "tachometer" }),
        );
        assert!(err.is_err());
    }

    #[test]
    fn percentages_follow_sample_count() {
        let mut meta = meta_with_series("m", 0..100);
        meta.refresh_percentages();
        assert!((meta.label_keys["host"].percentage - 100.0).abs() < f64::EPSILON);
        let other = meta_with_series("m", 100..300);
        meta.merge(&other).unwrap();
        assert!((meta.label_keys["host"].percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(meta.sample_count, 300);
    }
}
