use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::keystate::sketch_serde;
use crate::error::Result;
use crate::hll::HyperLogLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Metric,
    Span,
    Log,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Metric => "metric",
            SignalType::Span => "span",
            SignalType::Log => "log",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metric" => Some(SignalType::Metric),
            "span" => Some(SignalType::Span),
            "log" => Some(SignalType::Log),
            _ => None,
        }
    }
}

/// Where a key was seen on its parent: resource attributes, signal
/// attributes, or both. Transitions never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeScope {
    Resource,
    Attribute,
    Both,
}

impl AttributeScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeScope::Resource => "resource",
            AttributeScope::Attribute => "attribute",
            AttributeScope::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resource" => Some(AttributeScope::Resource),
            "attribute" => Some(AttributeScope::Attribute),
            "both" => Some(AttributeScope::Both),
            _ => None,
        }
    }

    /// x → x stays, x → y widens to both, both absorbs everything.
    pub fn widen(self, other: AttributeScope) -> AttributeScope {
        if self == other { self } else { AttributeScope::Both }
    }
}

/// Process-global record for one attribute key, independent of which
/// entity it appeared on. Values pass through only long enough to feed
/// the sketch and the bounded sample list; they are never persisted raw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeCatalogEntry {
    pub key: String,
    pub signal_types: BTreeSet<SignalType>,
    pub scope: AttributeScope,
    pub count: u64,
    pub estimated_cardinality: u64,
    pub sample_values: Vec<String>,
    #[serde(with = "sketch_serde")]
    pub sketch: HyperLogLog,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip, default = "default_max_samples")]
    max_samples: usize,
}

fn default_max_samples() -> usize {
    super::keystate::DEFAULT_MAX_SAMPLES
}

impl AttributeCatalogEntry {
    pub fn new(
        key: String,
        signal: SignalType,
        scope: AttributeScope,
        precision: u8,
        max_samples: usize,
        now: DateTime<Utc>,
    ) -> Self {
        AttributeCatalogEntry {
            key,
            signal_types: BTreeSet::from([signal]),
            scope,
            count: 0,
            estimated_cardinality: 0,
            sample_values: Vec::new(),
            sketch: HyperLogLog::new(precision),
            first_seen: now,
            last_seen: now,
            max_samples,
        }
    }

    pub fn observe(
        &mut self,
        value: &str,
        signal: SignalType,
        scope: AttributeScope,
        now: DateTime<Utc>,
    ) {
        self.count += 1;
        self.signal_types.insert(signal);
        self.scope = self.scope.widen(scope);
        self.sketch.insert(value.as_bytes());
        if self.sample_values.len() < self.max_samples
            && !self.sample_values.iter().any(|s| s == value)
        {
            self.sample_values.push(value.to_string());
        }
        self.refresh_cardinality();
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Union with a peer entry for the same key (e.g. the persisted row
    /// during cold-start hydration). Mismatched sketch precisions fail
    /// loudly; silently dropping registers would corrupt the estimate.
    pub fn merge(&mut self, other: &AttributeCatalogEntry) -> Result<()> {
        self.count += other.count;
        self.signal_types.extend(other.signal_types.iter().copied());
        self.scope = self.scope.widen(other.scope);
        self.sketch.merge(&other.sketch)?;
        for sample in &other.sample_values {
            if self.sample_values.len() >= self.max_samples {
                break;
            }
            if !self.sample_values.iter().any(|s| s == sample) {
                self.sample_values.push(sample.clone());
            }
        }
        self.refresh_cardinality();
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        Ok(())
    }

    /// Reported cardinality never moves backward; exact sample evidence
    /// is the floor.
    fn refresh_cardinality(&mut self) {
        self.estimated_cardinality = self
            .estimated_cardinality
            .max(self.sketch.count())
            .max(self.sample_values.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn entry(scope: AttributeScope) -> AttributeCatalogEntry {
        AttributeCatalogEntry::new("http.method".into(), SignalType::Span, scope, 14, 10, now())
    }

    #[test]
    fn scope_widens_and_never_reverts() {
        assert_eq!(
            AttributeScope::Resource.widen(AttributeScope::Resource),
            AttributeScope::Resource
        );
        assert_eq!(
            AttributeScope::Resource.widen(AttributeScope::Attribute),
            AttributeScope::Both
        );
        assert_eq!(
            AttributeScope::Both.widen(AttributeScope::Resource),
            AttributeScope::Both
        );
    }

    #[test]
    fn observe_widens_scope_and_collects_signals() {
        let mut e = entry(AttributeScope::Attribute);
        e.observe("GET", SignalType::Span, AttributeScope::Attribute, now());
        e.observe("POST", SignalType::Log, AttributeScope::Resource, now());
        assert_eq!(e.scope, AttributeScope::Both);
        assert_eq!(e.count, 2);
        assert!(e.signal_types.contains(&SignalType::Span));
        assert!(e.signal_types.contains(&SignalType::Log));
        assert_eq!(e.sample_values, ["GET", "POST"]);
    }

    #[test]
    fn merge_unions_signal_types() {
        let mut a = entry(AttributeScope::Attribute);
        a.observe("GET", SignalType::Span, AttributeScope::Attribute, now());
        let mut b = AttributeCatalogEntry::new(
            "http.method".into(),
            SignalType::Metric,
            AttributeScope::Attribute,
            14,
            10,
            now(),
        );
        b.observe("PUT", SignalType::Metric, AttributeScope::Attribute, now());
        a.merge(&b).unwrap();
        assert_eq!(a.count, 2);
        assert_eq!(a.signal_types.len(), 2);
        assert_eq!(a.scope, AttributeScope::Attribute);
    }

    #[test]
    fn merge_rejects_precision_mismatch() {
        let mut a = entry(AttributeScope::Attribute);
        let b = AttributeCatalogEntry::new(
            "http.method".into(),
            SignalType::Span,
            AttributeScope::Attribute,
            10,
            10,
            now(),
        );
        assert!(a.merge(&b).is_err());
    }
}
