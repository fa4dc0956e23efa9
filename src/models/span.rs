use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{KeyMap, ServicesMap, merge_key_maps, merge_services, refresh_percentages};
use crate::error::Result;

/// OTLP span kind, carried both as the wire integer and its canonical
/// string so the REST surface never makes clients decode enum values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanKind {
    #[default]
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => SpanKind::Internal,
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Unspecified,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            SpanKind::Unspecified => 0,
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
            SpanKind::Producer => 4,
            SpanKind::Consumer => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Unspecified => "SPAN_KIND_UNSPECIFIED",
            SpanKind::Internal => "SPAN_KIND_INTERNAL",
            SpanKind::Server => "SPAN_KIND_SERVER",
            SpanKind::Client => "SPAN_KIND_CLIENT",
            SpanKind::Producer => "SPAN_KIND_PRODUCER",
            SpanKind::Consumer => "SPAN_KIND_CONSUMER",
        }
    }
}

/// Running total plus the worst single span, per dropped-count class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedCounter {
    pub total: u64,
    pub max_per_span: u64,
}

impl DroppedCounter {
    pub fn record(&mut self, dropped: u64) {
        self.total += dropped;
        self.max_per_span = self.max_per_span.max(dropped);
    }

    fn merge(&mut self, other: &DroppedCounter) {
        self.total += other.total;
        self.max_per_span = self.max_per_span.max(other.max_per_span);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedStats {
    pub attributes: DroppedCounter,
    pub events: DroppedCounter,
    pub links: DroppedCounter,
}

impl DroppedStats {
    fn merge(&mut self, other: &DroppedStats) {
        self.attributes.merge(&other.attributes);
        self.events.merge(&other.events);
        self.links.merge(&other.links);
    }
}

/// Everything we keep about one span name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanMetadata {
    pub name: String,
    pub kind: i32,
    pub kind_name: String,
    pub attribute_keys: KeyMap,
    pub resource_keys: KeyMap,
    pub link_attribute_keys: KeyMap,
    /// Per event name, the attribute keys seen on that event.
    pub event_attribute_keys: BTreeMap<String, KeyMap>,
    pub event_names: BTreeSet<String>,
    pub status_codes: BTreeSet<String>,
    pub dropped: DroppedStats,
    pub span_count: u64,
    pub services: ServicesMap,
    pub name_patterns: BTreeSet<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SpanMetadata {
    pub fn new(name: String, kind: SpanKind, now: DateTime<Utc>) -> Self {
        SpanMetadata {
            name,
            kind: kind.as_i32(),
            kind_name: kind.as_str().to_string(),
            attribute_keys: KeyMap::new(),
            resource_keys: KeyMap::new(),
            link_attribute_keys: KeyMap::new(),
            event_attribute_keys: BTreeMap::new(),
            event_names: BTreeSet::new(),
            status_codes: BTreeSet::new(),
            dropped: DroppedStats::default(),
            span_count: 0,
            services: ServicesMap::new(),
            name_patterns: BTreeSet::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Keys contributed by events, counted per (event name, key) pair.
    pub fn event_key_count(&self) -> usize {
        self.event_attribute_keys.values().map(|m| m.len()).sum()
    }

    pub fn merge(&mut self, other: &SpanMetadata) -> Result<()> {
        self.span_count += other.span_count;
        merge_key_maps(&mut self.attribute_keys, &other.attribute_keys)?;
        merge_key_maps(&mut self.resource_keys, &other.resource_keys)?;
        merge_key_maps(&mut self.link_attribute_keys, &other.link_attribute_keys)?;
        for (event, keys) in &other.event_attribute_keys {
            let entry = self.event_attribute_keys.entry(event.clone()).or_default();
            merge_key_maps(entry, keys)?;
        }
        self.event_names.extend(other.event_names.iter().cloned());
        self.status_codes.extend(other.status_codes.iter().cloned());
        self.name_patterns.extend(other.name_patterns.iter().cloned());
        self.dropped.merge(&other.dropped);
        merge_services(&mut self.services, &other.services);
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.refresh_percentages();
        Ok(())
    }

    pub fn refresh_percentages(&mut self) {
        refresh_percentages(&mut self.attribute_keys, self.span_count);
        refresh_percentages(&mut self.resource_keys, self.span_count);
        refresh_percentages(&mut self.link_attribute_keys, self.span_count);
        for keys in self.event_attribute_keys.values_mut() {
            refresh_percentages(keys, self.span_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::keystate::KeyState;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn kind_roundtrips_between_integer_and_string() {
        assert_eq!(SpanKind::from_i32(2), SpanKind::Server);
        assert_eq!(SpanKind::Server.as_i32(), 2);
        assert_eq!(SpanKind::Server.as_str(), "SPAN_KIND_SERVER");
        assert_eq!(SpanKind::from_i32(42), SpanKind::Unspecified);
    }

    #[test]
    fn dropped_counter_tracks_total_and_max() {
        let mut counter = DroppedCounter::default();
        counter.record(3);
        counter.record(10);
        counter.record(1);
        assert_eq!(counter.total, 14);
        assert_eq!(counter.max_per_span, 10);
    }

    #[test]
    fn merge_unions_events_statuses_and_dropped() {
        let mut a = SpanMetadata::new("GET /users".into(), SpanKind::Server, now());
        a.span_count = 5;
        a.event_names.insert("exception".into());
        a.status_codes.insert("ERROR".into());
        a.dropped.attributes.record(4);
        let mut event_keys = KeyMap::new();
        let mut state = KeyState::new(14, 10, now());
        state.observe("NullPointerException", now());
        event_keys.insert("exception.type".into(), state);
        a.event_attribute_keys.insert("exception".into(), event_keys);

        let mut b = SpanMetadata::new("GET /users".into(), SpanKind::Server, now());
        b.span_count = 7;
        b.event_names.insert("retry".into());
        b.status_codes.insert("OK".into());
        b.dropped.attributes.record(9);

        a.merge(&b).unwrap();
        assert_eq!(a.span_count, 12);
        assert!(a.event_names.contains("exception") && a.event_names.contains("retry"));
        assert!(a.status_codes.contains("OK") && a.status_codes.contains("ERROR"));
        assert_eq!(a.dropped.attributes.total, 13);
        assert_eq!(a.dropped.attributes.max_per_span, 9);
        assert_eq!(a.event_key_count(), 1);
    }

    #[test]
    fn merge_keeps_earliest_first_seen_latest_last_seen() {
        let early = Utc::now() - chrono::Duration::hours(2);
        let late = Utc::now();
        let mut a = SpanMetadata::new("op".into(), SpanKind::Client, late);
        let b = SpanMetadata::new("op".into(), SpanKind::Client, early);
        a.merge(&b).unwrap();
        assert_eq!(a.first_seen, early);
        assert_eq!(a.last_seen, late);
    }
}
