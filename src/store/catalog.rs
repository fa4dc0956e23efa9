//! In-memory attribute catalog backed by the `attribute_catalog` table.
//!
//! Every key observation lands in the cache; a flusher mirrors dirty
//! entries to ClickHouse every `attribute_flush_interval` and on
//! shutdown. The cache is authoritative; the table is a durable mirror,
//! read back exactly once (lazily, on first access) after a cold start.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeZone, Utc};
use clickhouse::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{AttributeObservation, AttributeQuery, AttributeSort, Page};
use crate::error::{Error, Result};
use crate::hll::HyperLogLog;
use crate::models::attribute::{AttributeCatalogEntry, AttributeScope, SignalType};

pub const DEFAULT_ATTRIBUTE_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Durable shape of one catalog entry. The sketch travels as opaque
/// base64 bytes; ClickHouse never unions sketches, merges happen here.
#[derive(Debug, Clone, clickhouse::Row, Serialize, Deserialize)]
pub struct AttributeRow {
    pub key: String,
    pub hll_sketch: String,
    pub count: u64,
    pub estimated_cardinality: u64,
    pub value_samples: Vec<String>,
    pub signal_types: Vec<String>,
    pub scope: String,
    pub first_seen: i64,
    pub last_seen: i64,
}

pub(crate) fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl AttributeRow {
    pub fn from_entry(entry: &AttributeCatalogEntry) -> Self {
        AttributeRow {
            key: entry.key.clone(),
            hll_sketch: BASE64.encode(entry.sketch.to_bytes()),
            count: entry.count,
            estimated_cardinality: entry.estimated_cardinality,
            value_samples: {
                let mut samples = entry.sample_values.clone();
                samples.sort();
                samples
            },
            signal_types: entry.signal_types.iter().map(|t| t.as_str().to_string()).collect(),
            scope: entry.scope.as_str().to_string(),
            first_seen: millis(entry.first_seen),
            last_seen: millis(entry.last_seen),
        }
    }

    /// Rebuild the in-memory entry. A corrupt sketch resets to empty with
    /// zero cardinality and gets logged; the row's counters survive.
    pub fn into_entry(self, max_samples: usize) -> AttributeCatalogEntry {
        let sketch = BASE64
            .decode(&self.hll_sketch)
            .map_err(|e| Error::Format(format!("catalog sketch for {:?}: {e}", self.key)))
            .and_then(|bytes| HyperLogLog::from_bytes(&bytes));
        let (sketch, cardinality) = match sketch {
            Ok(sketch) => (sketch, self.estimated_cardinality),
            Err(e) => {
                tracing::error!("resetting corrupt sketch for attribute {:?}: {e}", self.key);
                (HyperLogLog::default(), 0)
            }
        };
        let signal_types: BTreeSet<SignalType> = self
            .signal_types
            .iter()
            .filter_map(|s| SignalType::parse(s))
            .collect();
        let mut entry = AttributeCatalogEntry::new(
            self.key,
            *signal_types.iter().next().unwrap_or(&SignalType::Metric),
            AttributeScope::parse(&self.scope).unwrap_or(AttributeScope::Attribute),
            sketch.precision(),
            max_samples,
            from_millis(self.first_seen),
        );
        entry.signal_types = signal_types;
        entry.count = self.count;
        entry.estimated_cardinality = cardinality;
        entry.sample_values = self.value_samples;
        entry.sample_values.truncate(max_samples);
        entry.sketch = sketch;
        entry.last_seen = from_millis(self.last_seen);
        entry
    }
}

pub struct AttributeCache {
    client: Client,
    precision: u8,
    max_samples: usize,
    entries: RwLock<HashMap<String, AttributeCatalogEntry>>,
    dirty: std::sync::Mutex<BTreeSet<String>>,
    hydrated: tokio::sync::OnceCell<()>,
}

impl AttributeCache {
    pub fn new(client: Client, precision: u8, max_samples: usize) -> Self {
        AttributeCache {
            client,
            precision,
            max_samples,
            entries: RwLock::new(HashMap::new()),
            dirty: std::sync::Mutex::new(BTreeSet::new()),
            hydrated: tokio::sync::OnceCell::new(),
        }
    }

    /// Read the whole catalog table once. A backend failure here starts
    /// the cache empty rather than wedging ingest; the mirror catches up
    /// on the next flush.
    async fn hydrate(&self) {
        self.hydrated
            .get_or_init(|| async {
                let rows = self
                    .client
                    .query(
                        "SELECT key, hll_sketch, count, estimated_cardinality, value_samples, \
                         signal_types, scope, first_seen, last_seen \
                         FROM metascope.attribute_catalog FINAL",
                    )
                    .fetch_all::<AttributeRow>()
                    .await;
                match rows {
                    Ok(rows) => {
                        let count = rows.len();
                        let mut entries =
                            self.entries.write().unwrap_or_else(|e| e.into_inner());
                        for row in rows {
                            let entry = row.into_entry(self.max_samples);
                            entries.insert(entry.key.clone(), entry);
                        }
                        tracing::info!("hydrated {count} attribute catalog entries");
                    }
                    Err(e) => {
                        tracing::error!("attribute catalog hydration failed, starting cold: {e}");
                    }
                }
            })
            .await;
    }

    pub async fn observe(&self, observations: Vec<AttributeObservation>) -> Result<()> {
        self.hydrate().await;
        let now = Utc::now();
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            for obs in observations {
                let entry = entries.entry(obs.key.clone()).or_insert_with(|| {
                    AttributeCatalogEntry::new(
                        obs.key.clone(),
                        obs.signal,
                        obs.scope,
                        self.precision,
                        self.max_samples,
                        now,
                    )
                });
                entry.observe(&obs.value, obs.signal, obs.scope, now);
                dirty.insert(obs.key);
            }
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<AttributeCatalogEntry> {
        self.hydrate().await;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("attribute {key:?}")))
    }

    pub async fn all(&self) -> Vec<AttributeCatalogEntry> {
        self.hydrate().await;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().cloned().collect()
    }

    pub async fn query(&self, query: AttributeQuery) -> Result<Page<AttributeCatalogEntry>> {
        self.hydrate().await;
        let mut items: Vec<AttributeCatalogEntry> = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries
                .values()
                .filter(|e| {
                    query.signal_type.is_none_or(|t| e.signal_types.contains(&t))
                        && query.scope.is_none_or(|s| e.scope == s)
                        && query.min_cardinality.is_none_or(|c| e.estimated_cardinality >= c)
                })
                .cloned()
                .collect()
        };
        match query.sort_by {
            AttributeSort::Key => items.sort_by(|a, b| a.key.cmp(&b.key)),
            AttributeSort::Cardinality => items.sort_by(|a, b| {
                a.estimated_cardinality
                    .cmp(&b.estimated_cardinality)
                    .then_with(|| a.key.cmp(&b.key))
            }),
            AttributeSort::Count => {
                items.sort_by(|a, b| a.count.cmp(&b.count).then_with(|| a.key.cmp(&b.key)));
            }
            AttributeSort::LastSeen => {
                items.sort_by(|a, b| a.last_seen.cmp(&b.last_seen).then_with(|| a.key.cmp(&b.key)));
            }
        }
        if query.descending {
            items.reverse();
        }
        Ok(Page::paginate(items, query.page))
    }

    pub async fn clear(&self) -> Result<()> {
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            entries.clear();
            dirty.clear();
        }
        self.client
            .query("TRUNCATE TABLE metascope.attribute_catalog")
            .execute()
            .await?;
        Ok(())
    }

    /// Mirror one row per dirty key. Returns how many rows were written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let keys: Vec<String> = {
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *dirty).into_iter().collect()
        };
        if keys.is_empty() {
            return Ok(0);
        }
        let rows: Vec<AttributeRow> = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            keys.iter()
                .filter_map(|k| entries.get(k))
                .map(AttributeRow::from_entry)
                .collect()
        };

        let result: Result<()> = async {
            let mut insert = self.client.insert("metascope.attribute_catalog")?;
            for row in &rows {
                insert.write(row).await?;
            }
            insert.end().await?;
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            // Put the keys back so the next cycle retries them.
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            dirty.extend(keys);
            tracing::warn!("attribute catalog flush failed, will retry: {e}");
        }
        result.map(|_| rows.len())
    }
}

/// Long-running flusher in front of [`AttributeCache::flush_dirty`].
/// Ticks every `interval` and drains once more when shutdown flips.
pub fn spawn_flusher(
    cache: std::sync::Arc<AttributeCache>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match cache.flush_dirty().await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!("flushed {n} attribute catalog rows"),
                        Err(e) => tracing::warn!("attribute flush cycle failed: {e}"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if let Err(e) = cache.flush_dirty().await {
                        tracing::error!("final attribute flush failed: {e}");
                    }
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> AttributeCatalogEntry {
        let mut e = AttributeCatalogEntry::new(
            "http.route".into(),
            SignalType::Span,
            AttributeScope::Attribute,
            14,
            10,
            Utc::now(),
        );
        for route in ["/users", "/orders", "/health"] {
            e.observe(route, SignalType::Span, AttributeScope::Attribute, Utc::now());
        }
        e.observe("/admin", SignalType::Log, AttributeScope::Resource, Utc::now());
        e
    }

    #[test]
    fn row_roundtrip_preserves_entry() {
        let original = entry();
        let row = AttributeRow::from_entry(&original);
        assert_eq!(row.count, 4);
        assert_eq!(row.scope, "both");
        // Serialized samples are sorted.
        let mut expected = original.sample_values.clone();
        expected.sort();
        assert_eq!(row.value_samples, expected);

        let restored = row.into_entry(10);
        assert_eq!(restored.key, original.key);
        assert_eq!(restored.count, original.count);
        assert_eq!(restored.scope, original.scope);
        assert_eq!(restored.signal_types, original.signal_types);
        assert_eq!(restored.sketch, original.sketch);
        assert_eq!(restored.estimated_cardinality, original.estimated_cardinality);
    }

    #[test]
    fn corrupt_sketch_resets_entry_not_counters() {
        let mut row = AttributeRow::from_entry(&entry());
        row.hll_sketch = "@@garbage@@".into();
        let restored = row.into_entry(10);
        assert!(restored.sketch.is_empty());
        assert_eq!(restored.estimated_cardinality, 0);
        assert_eq!(restored.count, 4);
    }

    #[test]
    fn truncated_sketch_bytes_also_reset() {
        let mut row = AttributeRow::from_entry(&entry());
        let mut bytes = BASE64.decode(&row.hll_sketch).unwrap();
        bytes.truncate(100);
        row.hll_sketch = BASE64.encode(&bytes);
        let restored = row.into_entry(10);
        assert!(restored.sketch.is_empty());
    }

    #[test]
    fn millis_roundtrip() {
        let now = Utc::now();
        let restored = from_millis(millis(now));
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
    }
}
