//! Sharded in-process backend.
//!
//! One map per signal class, each behind its own read/write lock, plus
//! the global attribute catalog and the set of every service name ever
//! seen. Merges run write-exclusive; lookups share read locks. Nothing is
//! awaited or called out to while a lock is held, and `clear` takes the
//! locks in one fixed order so concurrent clears cannot deadlock.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use super::{AttributeObservation, AttributeQuery, AttributeSort, MetadataStore, Page, PageParams};
use crate::error::{Error, Result};
use crate::models::attribute::AttributeCatalogEntry;
use crate::models::log::LogMetadata;
use crate::models::metric::MetricMetadata;
use crate::models::span::SpanMetadata;

pub struct MemoryStoreConfig {
    pub hll_precision: u8,
    pub max_samples_per_key: usize,
    /// 0 disables bounded-memory eviction.
    pub max_entities_per_shard: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        MemoryStoreConfig {
            hll_precision: crate::hll::DEFAULT_PRECISION,
            max_samples_per_key: crate::models::keystate::DEFAULT_MAX_SAMPLES,
            max_entities_per_shard: 0,
        }
    }
}

pub struct MemoryStore {
    config: MemoryStoreConfig,
    metrics: RwLock<HashMap<String, MetricMetadata>>,
    spans: RwLock<HashMap<String, SpanMetadata>>,
    logs: RwLock<HashMap<String, LogMetadata>>,
    catalog: RwLock<HashMap<String, AttributeCatalogEntry>>,
    services: RwLock<BTreeSet<String>>,
    evictions: AtomicU64,
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        MemoryStore {
            config,
            metrics: RwLock::new(HashMap::new()),
            spans: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
            catalog: RwLock::new(HashMap::new()),
            services: RwLock::new(BTreeSet::new()),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn note_services<'a>(&self, names: impl Iterator<Item = &'a String>) {
        let mut guard = self.services.write().unwrap_or_else(|e| e.into_inner());
        for name in names {
            if !guard.contains(name) {
                guard.insert(name.clone());
            }
        }
    }

    /// Shard-cap enforcement: drop the entity with the oldest last_seen.
    /// Not an error; the eviction counter is the observable.
    fn evict_oldest<T>(&self, map: &mut HashMap<String, T>, last_seen: impl Fn(&T) -> chrono::DateTime<Utc>) {
        let cap = self.config.max_entities_per_shard;
        if cap == 0 {
            return;
        }
        while map.len() > cap {
            let victim = map
                .iter()
                .min_by_key(|(_, v)| last_seen(v))
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            map.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn upsert_metric(&self, meta: MetricMetadata) -> Result<()> {
        self.note_services(meta.services.keys());
        let mut map = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(&meta.name) {
            Some(existing) => existing.merge(&meta)?,
            None => {
                map.insert(meta.name.clone(), meta);
            }
        }
        self.evict_oldest(&mut map, |m| m.last_seen);
        Ok(())
    }

    async fn upsert_span(&self, meta: SpanMetadata) -> Result<()> {
        self.note_services(meta.services.keys());
        let mut map = self.spans.write().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(&meta.name) {
            Some(existing) => existing.merge(&meta)?,
            None => {
                map.insert(meta.name.clone(), meta);
            }
        }
        self.evict_oldest(&mut map, |m| m.last_seen);
        Ok(())
    }

    async fn upsert_log(&self, meta: LogMetadata) -> Result<()> {
        self.note_services(meta.services.keys());
        let mut map = self.logs.write().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(&meta.severity_text) {
            Some(existing) => existing.merge(&meta)?,
            None => {
                map.insert(meta.severity_text.clone(), meta);
            }
        }
        self.evict_oldest(&mut map, |m| m.last_seen);
        Ok(())
    }

    async fn observe_attributes(&self, observations: Vec<AttributeObservation>) -> Result<()> {
        let now = Utc::now();
        let mut map = self.catalog.write().unwrap_or_else(|e| e.into_inner());
        for obs in observations {
            let entry = map.entry(obs.key.clone()).or_insert_with(|| {
                AttributeCatalogEntry::new(
                    obs.key.clone(),
                    obs.signal,
                    obs.scope,
                    self.config.hll_precision,
                    self.config.max_samples_per_key,
                    now,
                )
            });
            entry.observe(&obs.value, obs.signal, obs.scope, now);
        }
        Ok(())
    }

    async fn list_metrics(
        &self,
        page: PageParams,
        service: Option<&str>,
    ) -> Result<Page<MetricMetadata>> {
        let mut items: Vec<MetricMetadata> = {
            let map = self.metrics.read().unwrap_or_else(|e| e.into_inner());
            map.values()
                .filter(|m| service.is_none_or(|s| m.services.contains_key(s)))
                .cloned()
                .collect()
        };
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Page::paginate(items, page))
    }

    async fn get_metric(&self, name: &str) -> Result<MetricMetadata> {
        let map = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        map.get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("metric {name:?}")))
    }

    async fn list_spans(
        &self,
        page: PageParams,
        service: Option<&str>,
    ) -> Result<Page<SpanMetadata>> {
        let mut items: Vec<SpanMetadata> = {
            let map = self.spans.read().unwrap_or_else(|e| e.into_inner());
            map.values()
                .filter(|m| service.is_none_or(|s| m.services.contains_key(s)))
                .cloned()
                .collect()
        };
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Page::paginate(items, page))
    }

    async fn get_span(&self, name: &str) -> Result<SpanMetadata> {
        let map = self.spans.read().unwrap_or_else(|e| e.into_inner());
        map.get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("span {name:?}")))
    }

    async fn list_logs(
        &self,
        page: PageParams,
        service: Option<&str>,
    ) -> Result<Page<LogMetadata>> {
        let mut items: Vec<LogMetadata> = {
            let map = self.logs.read().unwrap_or_else(|e| e.into_inner());
            map.values()
                .filter(|m| service.is_none_or(|s| m.services.contains_key(s)))
                .cloned()
                .collect()
        };
        items.sort_by(|a, b| a.severity_text.cmp(&b.severity_text));
        Ok(Page::paginate(items, page))
    }

    async fn get_log(&self, severity: &str) -> Result<LogMetadata> {
        let map = self.logs.read().unwrap_or_else(|e| e.into_inner());
        map.get(severity)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("log severity {severity:?}")))
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        let guard = self.services.read().unwrap_or_else(|e| e.into_inner());
        Ok(guard.iter().cloned().collect())
    }

    async fn query_attributes(&self, query: AttributeQuery) -> Result<Page<AttributeCatalogEntry>> {
        let mut items: Vec<AttributeCatalogEntry> = {
            let map = self.catalog.read().unwrap_or_else(|e| e.into_inner());
            map.values()
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
            AttributeSort::Cardinality => {
                items.sort_by(|a, b| {
                    a.estimated_cardinality
                        .cmp(&b.estimated_cardinality)
                        .then_with(|| a.key.cmp(&b.key))
                });
            }
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

    async fn get_attribute(&self, key: &str) -> Result<AttributeCatalogEntry> {
        let map = self.catalog.read().unwrap_or_else(|e| e.into_inner());
        map.get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("attribute {key:?}")))
    }

    async fn all_metrics(&self) -> Result<Vec<MetricMetadata>> {
        let map = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.values().cloned().collect())
    }

    async fn all_spans(&self) -> Result<Vec<SpanMetadata>> {
        let map = self.spans.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.values().cloned().collect())
    }

    async fn all_logs(&self) -> Result<Vec<LogMetadata>> {
        let map = self.logs.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.values().cloned().collect())
    }

    async fn all_attributes(&self) -> Result<Vec<AttributeCatalogEntry>> {
        let map = self.catalog.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.values().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        // Fixed acquisition order: metrics, spans, logs, catalog, services.
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        let mut spans = self.spans.write().unwrap_or_else(|e| e.into_inner());
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        let mut catalog = self.catalog.write().unwrap_or_else(|e| e.into_inner());
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        metrics.clear();
        spans.clear();
        logs.clear();
        catalog.clear();
        services.clear();
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metric::MetricData;
    use crate::models::span::SpanKind;

    fn store() -> MemoryStore {
        MemoryStore::new(MemoryStoreConfig::default())
    }

    fn metric(name: &str, service: &str) -> MetricMetadata {
        let mut meta = MetricMetadata::new(name.into(), MetricData::Gauge, 14, Utc::now());
        meta.sample_count = 1;
        meta.services.insert(service.into(), 1);
        meta
    }

    #[tokio::test]
    async fn upsert_inserts_then_merges() {
        let s = store();
        s.upsert_metric(metric("cpu_usage", "api")).await.unwrap();
        s.upsert_metric(metric("cpu_usage", "worker")).await.unwrap();

        let got = s.get_metric("cpu_usage").await.unwrap();
        assert_eq!(got.sample_count, 2);
        assert_eq!(got.services.len(), 2);
        assert_eq!(s.list_services().await.unwrap(), ["api", "worker"]);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let s = store();
        let err = s.get_metric("nope").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        let err = s.get_span("nope").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn list_filters_by_service_and_counts_filtered_total() {
        let s = store();
        for i in 0..5 {
            s.upsert_metric(metric(&format!("m_{i}"), "api")).await.unwrap();
        }
        for i in 5..8 {
            s.upsert_metric(metric(&format!("m_{i}"), "worker")).await.unwrap();
        }

        let page = s
            .list_metrics(PageParams::default(), Some("api"))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert!(page.data.iter().all(|m| m.services.contains_key("api")));
    }

    #[tokio::test]
    async fn pagination_is_ordered_and_exhaustive() {
        let s = store();
        for i in 0..250 {
            s.upsert_metric(metric(&format!("m_{i:03}"), "api")).await.unwrap();
        }

        let first = s
            .list_metrics(PageParams { limit: 100, offset: 0 }, None)
            .await
            .unwrap();
        assert_eq!(first.data.len(), 100);
        assert_eq!(first.total, 250);
        assert!(first.has_more);
        assert_eq!(first.data[0].name, "m_000");
        assert_eq!(first.data[99].name, "m_099");

        let last = s
            .list_metrics(PageParams { limit: 100, offset: 200 }, None)
            .await
            .unwrap();
        assert_eq!(last.data.len(), 50);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn shard_cap_evicts_oldest_last_seen() {
        let s = MemoryStore::new(MemoryStoreConfig {
            max_entities_per_shard: 3,
            ..MemoryStoreConfig::default()
        });
        let base = Utc::now();
        for i in 0..5 {
            let mut m = metric(&format!("m_{i}"), "api");
            m.first_seen = base + chrono::Duration::seconds(i);
            m.last_seen = base + chrono::Duration::seconds(i);
            s.upsert_metric(m).await.unwrap();
        }
        assert_eq!(s.all_metrics().await.unwrap().len(), 3);
        assert_eq!(s.evictions(), 2);
        // The oldest two are the ones gone.
        assert!(s.get_metric("m_0").await.is_err());
        assert!(s.get_metric("m_1").await.is_err());
        assert!(s.get_metric("m_4").await.is_ok());
    }

    #[tokio::test]
    async fn memory_backend_reports_zero_flush_failures() {
        // No durable mirror, so the write path has nothing to fail.
        let s = store();
        let stats = s.flush_stats();
        assert_eq!(stats.failed_flushes, 0);
        assert_eq!(stats.spilled_rows, 0);
    }

    #[tokio::test]
    async fn clear_wipes_everything() {
        let s = store();
        s.upsert_metric(metric("m", "api")).await.unwrap();
        let mut span = SpanMetadata::new("op".into(), SpanKind::Server, Utc::now());
        span.services.insert("api".into(), 1);
        s.upsert_span(span).await.unwrap();
        s.clear().await.unwrap();
        assert!(s.all_metrics().await.unwrap().is_empty());
        assert!(s.all_spans().await.unwrap().is_empty());
        assert!(s.list_services().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn attribute_catalog_observes_and_filters() {
        use crate::models::attribute::{AttributeScope, SignalType};
        let s = store();
        s.observe_attributes(vec![
            AttributeObservation {
                key: "http.method".into(),
                value: "GET".into(),
                signal: SignalType::Span,
                scope: AttributeScope::Attribute,
            },
            AttributeObservation {
                key: "host.name".into(),
                value: "ip-10-0-0-1".into(),
                signal: SignalType::Metric,
                scope: AttributeScope::Resource,
            },
        ])
        .await
        .unwrap();

        let page = s
            .query_attributes(AttributeQuery {
                signal_type: Some(SignalType::Span),
                ..AttributeQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.data[0].key, "http.method");

        let entry = s.get_attribute("host.name").await.unwrap();
        assert_eq!(entry.scope, AttributeScope::Resource);
        assert_eq!(entry.count, 1);
    }
}
