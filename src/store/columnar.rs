//! ClickHouse-backed store.
//!
//! The sharded in-process maps stay authoritative for merges and reads;
//! every upsert additionally appends the merged entity snapshot to the
//! columnar mirror through a batch buffer (one buffer per entity class).
//! `ReplacingMergeTree(last_seen)` keeps the freshest snapshot per
//! identity, so appends are idempotent-on-merge. On a cold start the
//! entity tables are read back once to reseed the maps; per-key sketches
//! live in the attribute catalog, which hydrates itself lazily.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clickhouse::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::batch::{BatchBuffer, BatchConfig, BulkSink};
use super::catalog::{AttributeCache, from_millis, millis, spawn_flusher};
use super::memory::{MemoryStore, MemoryStoreConfig};
use super::{AttributeObservation, AttributeQuery, MetadataStore, Page, PageParams};
use crate::error::Result;
use crate::models::attribute::AttributeCatalogEntry;
use crate::models::keystate::KeyState;
use crate::models::log::LogMetadata;
use crate::models::metric::{MetricData, MetricMetadata, Temporality};
use crate::models::span::{SpanKind, SpanMetadata};

#[derive(Debug, Clone)]
pub struct ColumnarConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub attribute_flush_interval: Duration,
    pub recovery_dir: PathBuf,
    /// When off, key observations go to the legacy `attribute_values`
    /// log instead of the catalog mirror.
    pub catalog_enabled: bool,
    pub hll_precision: u8,
    pub max_samples_per_key: usize,
    pub max_entities_per_shard: usize,
}

// ── Row shapes ──

#[derive(Debug, Clone, clickhouse::Row, Serialize, Deserialize)]
struct MetricRow {
    name: String,
    service_name: String,
    kind: String,
    unit: String,
    temporality: String,
    is_monotonic: bool,
    label_keys: Vec<String>,
    resource_keys: Vec<String>,
    sample_count: u64,
    services: Vec<String>,
    first_seen: i64,
    last_seen: i64,
}

#[derive(Debug, Clone, clickhouse::Row, Serialize, Deserialize)]
struct SpanRow {
    name: String,
    service_name: String,
    kind: String,
    attribute_keys: Vec<String>,
    resource_keys: Vec<String>,
    event_names: Vec<String>,
    has_links: bool,
    status_codes: Vec<String>,
    dropped_attributes: u64,
    dropped_events: u64,
    dropped_links: u64,
    sample_count: u64,
    services: Vec<String>,
    first_seen: i64,
    last_seen: i64,
}

#[derive(Debug, Clone, clickhouse::Row, Serialize, Deserialize)]
struct LogRow {
    pattern_template: String,
    severity: String,
    severity_number: i32,
    service_name: String,
    attribute_keys: Vec<String>,
    resource_keys: Vec<String>,
    example_body: String,
    flags: u8,
    sample_count: u64,
    services: Vec<String>,
    first_seen: i64,
    last_seen: i64,
}

const LOG_FLAG_TRACE: u8 = 1;
const LOG_FLAG_SPAN: u8 = 2;

#[derive(Debug, Clone, clickhouse::Row, Serialize, Deserialize)]
struct AttributeValueRow {
    key: String,
    value: String,
    signal_type: String,
    scope: String,
    observation_count: u64,
}

// ── Entity ↔ row conversion ──

/// One row per contributing service; `sample_count` is that service's
/// share so the services map reassembles on hydration.
fn metric_rows(meta: &MetricMetadata) -> Vec<MetricRow> {
    let (temporality, is_monotonic) = match &meta.data {
        MetricData::Sum { temporality, is_monotonic } => (temporality.as_str(), *is_monotonic),
        _ => (Temporality::Unspecified.as_str(), false),
    };
    let services: Vec<String> = meta.services.keys().cloned().collect();
    meta.services
        .iter()
        .map(|(service, count)| MetricRow {
            name: meta.name.clone(),
            service_name: service.clone(),
            kind: meta.kind.as_str().to_string(),
            unit: meta.unit.clone(),
            temporality: temporality.to_string(),
            is_monotonic,
            label_keys: meta.label_keys.keys().cloned().collect(),
            resource_keys: meta.resource_keys.keys().cloned().collect(),
            sample_count: *count,
            services: services.clone(),
            first_seen: millis(meta.first_seen),
            last_seen: millis(meta.last_seen),
        })
        .collect()
}

fn metric_from_rows(rows: &[MetricRow], precision: u8, max_samples: usize) -> Option<MetricMetadata> {
    let first = rows.first()?;
    let kind = match first.kind.as_str() {
        "sum" => MetricData::Sum {
            temporality: match first.temporality.as_str() {
                "delta" => Temporality::Delta,
                "cumulative" => Temporality::Cumulative,
                _ => Temporality::Unspecified,
            },
            is_monotonic: first.is_monotonic,
        },
        "histogram" => MetricData::Histogram { explicit_bounds: Vec::new() },
        "exponential_histogram" => MetricData::ExponentialHistogram { scales: Vec::new() },
        "summary" => MetricData::Summary,
        _ => MetricData::Gauge,
    };
    let now = Utc::now();
    let mut meta = MetricMetadata::new(first.name.clone(), kind, precision, now);
    meta.unit = first.unit.clone();
    meta.first_seen = from_millis(rows.iter().map(|r| r.first_seen).min()?);
    meta.last_seen = from_millis(rows.iter().map(|r| r.last_seen).max()?);
    for row in rows {
        meta.sample_count += row.sample_count;
        meta.services.insert(row.service_name.clone(), row.sample_count);
        for key in &row.label_keys {
            meta.label_keys
                .entry(key.clone())
                .or_insert_with(|| KeyState::new(precision, max_samples, now));
        }
        for key in &row.resource_keys {
            meta.resource_keys
                .entry(key.clone())
                .or_insert_with(|| KeyState::new(precision, max_samples, now));
        }
    }
    meta.refresh_percentages();
    Some(meta)
}

fn span_rows(meta: &SpanMetadata) -> Vec<SpanRow> {
    let services: Vec<String> = meta.services.keys().cloned().collect();
    meta.services
        .iter()
        .map(|(service, count)| SpanRow {
            name: meta.name.clone(),
            service_name: service.clone(),
            kind: meta.kind_name.clone(),
            attribute_keys: meta.attribute_keys.keys().cloned().collect(),
            resource_keys: meta.resource_keys.keys().cloned().collect(),
            event_names: meta.event_names.iter().cloned().collect(),
            has_links: !meta.link_attribute_keys.is_empty(),
            status_codes: meta.status_codes.iter().cloned().collect(),
            dropped_attributes: meta.dropped.attributes.total,
            dropped_events: meta.dropped.events.total,
            dropped_links: meta.dropped.links.total,
            sample_count: *count,
            services: services.clone(),
            first_seen: millis(meta.first_seen),
            last_seen: millis(meta.last_seen),
        })
        .collect()
}

fn span_from_rows(rows: &[SpanRow], precision: u8, max_samples: usize) -> Option<SpanMetadata> {
    let first = rows.first()?;
    let kind = (0..=5)
        .map(SpanKind::from_i32)
        .find(|k| k.as_str() == first.kind)
        .unwrap_or_default();
    let now = Utc::now();
    let mut meta = SpanMetadata::new(first.name.clone(), kind, now);
    meta.first_seen = from_millis(rows.iter().map(|r| r.first_seen).min()?);
    meta.last_seen = from_millis(rows.iter().map(|r| r.last_seen).max()?);
    for row in rows {
        meta.span_count += row.sample_count;
        meta.services.insert(row.service_name.clone(), row.sample_count);
        meta.event_names.extend(row.event_names.iter().cloned());
        meta.status_codes.extend(row.status_codes.iter().cloned());
        meta.dropped.attributes.total = meta.dropped.attributes.total.max(row.dropped_attributes);
        meta.dropped.events.total = meta.dropped.events.total.max(row.dropped_events);
        meta.dropped.links.total = meta.dropped.links.total.max(row.dropped_links);
        for key in &row.attribute_keys {
            meta.attribute_keys
                .entry(key.clone())
                .or_insert_with(|| KeyState::new(precision, max_samples, now));
        }
        for key in &row.resource_keys {
            meta.resource_keys
                .entry(key.clone())
                .or_insert_with(|| KeyState::new(precision, max_samples, now));
        }
    }
    meta.refresh_percentages();
    Some(meta)
}

/// Per-severity service rows carry an empty template; template rows carry
/// the cross-service template count (equal on every row, so hydration
/// takes the max instead of summing).
fn log_rows(meta: &LogMetadata) -> Vec<LogRow> {
    let services: Vec<String> = meta.services.keys().cloned().collect();
    let flags = (meta.has_trace_context as u8 * LOG_FLAG_TRACE)
        | (meta.has_span_context as u8 * LOG_FLAG_SPAN);
    let attribute_keys: Vec<String> = meta.attribute_keys.keys().cloned().collect();
    let resource_keys: Vec<String> = meta.resource_keys.keys().cloned().collect();
    let base = |template: &str, example: &str, service: &str, count: u64| LogRow {
        pattern_template: template.to_string(),
        severity: meta.severity_text.clone(),
        severity_number: meta.severity_number,
        service_name: service.to_string(),
        attribute_keys: attribute_keys.clone(),
        resource_keys: resource_keys.clone(),
        example_body: example.to_string(),
        flags,
        sample_count: count,
        services: services.clone(),
        first_seen: millis(meta.first_seen),
        last_seen: millis(meta.last_seen),
    };

    let mut rows = Vec::new();
    for (service, count) in &meta.services {
        rows.push(base("", "", service, *count));
    }
    for template in meta.body_templates.values() {
        for service in &services {
            rows.push(base(&template.template, &template.example, service, template.count));
        }
    }
    rows
}

fn log_from_rows(rows: &[LogRow]) -> Option<LogMetadata> {
    let first = rows.first()?;
    let now = Utc::now();
    let mut meta = LogMetadata::new(first.severity.clone(), first.severity_number, now);
    meta.first_seen = from_millis(rows.iter().map(|r| r.first_seen).min()?);
    meta.last_seen = from_millis(rows.iter().map(|r| r.last_seen).max()?);
    for row in rows {
        meta.has_trace_context |= row.flags & LOG_FLAG_TRACE != 0;
        meta.has_span_context |= row.flags & LOG_FLAG_SPAN != 0;
        if row.pattern_template.is_empty() {
            meta.record_count += row.sample_count;
            meta.services.insert(row.service_name.clone(), row.sample_count);
        } else {
            let entry = meta
                .body_templates
                .entry(row.pattern_template.clone())
                .or_insert_with(|| crate::models::log::BodyTemplate {
                    template: row.pattern_template.clone(),
                    count: 0,
                    example: row.example_body.clone(),
                });
            entry.count = entry.count.max(row.sample_count);
        }
    }
    Some(meta)
}

// ── Sink plumbing ──

struct TableSink {
    client: Client,
    table: &'static str,
}

#[async_trait]
impl<T> BulkSink<T> for TableSink
where
    T: clickhouse::Row + Serialize + Send + Sync + 'static,
{
    async fn insert_batch(&self, rows: &[T]) -> Result<()> {
        let mut insert = self.client.insert::<T>(self.table)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await?;
        Ok(())
    }
}

// ── Store ──

pub struct ColumnarStore {
    client: Client,
    memory: MemoryStore,
    cache: Arc<AttributeCache>,
    catalog_enabled: bool,
    metric_buffer: BatchBuffer<MetricRow>,
    span_buffer: BatchBuffer<SpanRow>,
    log_buffer: BatchBuffer<LogRow>,
    value_buffer: BatchBuffer<AttributeValueRow>,
    shutdown_tx: watch::Sender<bool>,
    flusher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ColumnarStore {
    /// Connect, reseed the in-process maps from the mirror, and start the
    /// background flushers. Migrations must already have run.
    pub async fn open(config: ColumnarConfig) -> Result<Self> {
        let client = Client::default()
            .with_url(&config.url)
            .with_user(&config.user)
            .with_password(&config.password);

        let memory = MemoryStore::new(MemoryStoreConfig {
            hll_precision: config.hll_precision,
            max_samples_per_key: config.max_samples_per_key,
            max_entities_per_shard: config.max_entities_per_shard,
        });
        hydrate_entities(&client, &memory, config.hll_precision, config.max_samples_per_key)
            .await?;

        let cache = Arc::new(AttributeCache::new(
            client.clone(),
            config.hll_precision,
            config.max_samples_per_key,
        ));

        let buffer = |label: &'static str| BatchConfig {
            label,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            recovery_dir: Some(config.recovery_dir.clone()),
        };
        let sink = |table: &'static str| TableSink { client: client.clone(), table };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = spawn_flusher(cache.clone(), config.attribute_flush_interval, shutdown_rx);

        Ok(ColumnarStore {
            metric_buffer: BatchBuffer::new(buffer("metrics"), Arc::new(sink("metascope.metrics"))),
            span_buffer: BatchBuffer::new(buffer("spans"), Arc::new(sink("metascope.spans"))),
            log_buffer: BatchBuffer::new(buffer("logs"), Arc::new(sink("metascope.logs"))),
            value_buffer: BatchBuffer::new(
                buffer("attribute_values"),
                Arc::new(sink("metascope.attribute_values")),
            ),
            client,
            memory,
            cache,
            catalog_enabled: config.catalog_enabled,
            shutdown_tx,
            flusher: std::sync::Mutex::new(Some(flusher)),
        })
    }

    /// Flushes that exhausted their retries, across all four entity
    /// buffers.
    pub fn flush_failures(&self) -> u64 {
        self.metric_buffer.failed_flushes()
            + self.span_buffer.failed_flushes()
            + self.log_buffer.failed_flushes()
            + self.value_buffer.failed_flushes()
    }

    /// Rows serialized to recovery files after exhausted retries.
    pub fn spilled_rows(&self) -> u64 {
        self.metric_buffer.spilled_rows()
            + self.span_buffer.spilled_rows()
            + self.log_buffer.spilled_rows()
            + self.value_buffer.spilled_rows()
    }
}

async fn hydrate_entities(
    client: &Client,
    memory: &MemoryStore,
    precision: u8,
    max_samples: usize,
) -> Result<()> {
    let metric_rows_back = client
        .query(
            "SELECT name, service_name, kind, unit, temporality, is_monotonic, label_keys, \
             resource_keys, sample_count, services, first_seen, last_seen \
             FROM metascope.metrics FINAL",
        )
        .fetch_all::<MetricRow>()
        .await?;
    let mut grouped: HashMap<String, Vec<MetricRow>> = HashMap::new();
    for row in metric_rows_back {
        grouped.entry(row.name.clone()).or_default().push(row);
    }
    let metric_count = grouped.len();
    for rows in grouped.values() {
        if let Some(meta) = metric_from_rows(rows, precision, max_samples) {
            memory.upsert_metric(meta).await?;
        }
    }

    let span_rows_back = client
        .query(
            "SELECT name, service_name, kind, attribute_keys, resource_keys, event_names, \
             has_links, status_codes, dropped_attributes, dropped_events, dropped_links, \
             sample_count, services, first_seen, last_seen \
             FROM metascope.spans FINAL",
        )
        .fetch_all::<SpanRow>()
        .await?;
    let mut grouped: HashMap<String, Vec<SpanRow>> = HashMap::new();
    for row in span_rows_back {
        grouped.entry(row.name.clone()).or_default().push(row);
    }
    let span_count = grouped.len();
    for rows in grouped.values() {
        if let Some(meta) = span_from_rows(rows, precision, max_samples) {
            memory.upsert_span(meta).await?;
        }
    }

    let log_rows_back = client
        .query(
            "SELECT pattern_template, severity, severity_number, service_name, attribute_keys, \
             resource_keys, example_body, flags, sample_count, services, first_seen, last_seen \
             FROM metascope.logs FINAL",
        )
        .fetch_all::<LogRow>()
        .await?;
    let mut grouped: HashMap<String, Vec<LogRow>> = HashMap::new();
    for row in log_rows_back {
        grouped.entry(row.severity.clone()).or_default().push(row);
    }
    let log_count = grouped.len();
    for rows in grouped.values() {
        if let Some(meta) = log_from_rows(rows) {
            memory.upsert_log(meta).await?;
        }
    }

    tracing::info!(
        "reseeded {metric_count} metrics, {span_count} spans, {log_count} log severities from the mirror"
    );
    Ok(())
}

#[async_trait]
impl MetadataStore for ColumnarStore {
    async fn upsert_metric(&self, meta: MetricMetadata) -> Result<()> {
        let name = meta.name.clone();
        self.memory.upsert_metric(meta).await?;
        let merged = self.memory.get_metric(&name).await?;
        for row in metric_rows(&merged) {
            self.metric_buffer.append(row).await?;
        }
        Ok(())
    }

    async fn upsert_span(&self, meta: SpanMetadata) -> Result<()> {
        let name = meta.name.clone();
        self.memory.upsert_span(meta).await?;
        let merged = self.memory.get_span(&name).await?;
        for row in span_rows(&merged) {
            self.span_buffer.append(row).await?;
        }
        Ok(())
    }

    async fn upsert_log(&self, meta: LogMetadata) -> Result<()> {
        let severity = meta.severity_text.clone();
        self.memory.upsert_log(meta).await?;
        let merged = self.memory.get_log(&severity).await?;
        for row in log_rows(&merged) {
            self.log_buffer.append(row).await?;
        }
        Ok(())
    }

    async fn observe_attributes(&self, observations: Vec<AttributeObservation>) -> Result<()> {
        if self.catalog_enabled {
            self.cache.observe(observations).await
        } else {
            // Legacy path: raw observation log, counts sum-merged by the
            // table engine. The in-process catalog still serves reads.
            for obs in &observations {
                self.value_buffer
                    .append(AttributeValueRow {
                        key: obs.key.clone(),
                        value: obs.value.clone(),
                        signal_type: obs.signal.as_str().to_string(),
                        scope: obs.scope.as_str().to_string(),
                        observation_count: 1,
                    })
                    .await?;
            }
            self.memory.observe_attributes(observations).await
        }
    }

    async fn list_metrics(
        &self,
        page: PageParams,
        service: Option<&str>,
    ) -> Result<Page<MetricMetadata>> {
        self.memory.list_metrics(page, service).await
    }

    async fn get_metric(&self, name: &str) -> Result<MetricMetadata> {
        self.memory.get_metric(name).await
    }

    async fn list_spans(
        &self,
        page: PageParams,
        service: Option<&str>,
    ) -> Result<Page<SpanMetadata>> {
        self.memory.list_spans(page, service).await
    }

    async fn get_span(&self, name: &str) -> Result<SpanMetadata> {
        self.memory.get_span(name).await
    }

    async fn list_logs(
        &self,
        page: PageParams,
        service: Option<&str>,
    ) -> Result<Page<LogMetadata>> {
        self.memory.list_logs(page, service).await
    }

    async fn get_log(&self, severity: &str) -> Result<LogMetadata> {
        self.memory.get_log(severity).await
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        self.memory.list_services().await
    }

    async fn query_attributes(&self, query: AttributeQuery) -> Result<Page<AttributeCatalogEntry>> {
        if self.catalog_enabled {
            self.cache.query(query).await
        } else {
            self.memory.query_attributes(query).await
        }
    }

    async fn get_attribute(&self, key: &str) -> Result<AttributeCatalogEntry> {
        if self.catalog_enabled {
            self.cache.get(key).await
        } else {
            self.memory.get_attribute(key).await
        }
    }

    async fn all_metrics(&self) -> Result<Vec<MetricMetadata>> {
        self.memory.all_metrics().await
    }

    async fn all_spans(&self) -> Result<Vec<SpanMetadata>> {
        self.memory.all_spans().await
    }

    async fn all_logs(&self) -> Result<Vec<LogMetadata>> {
        self.memory.all_logs().await
    }

    async fn all_attributes(&self) -> Result<Vec<AttributeCatalogEntry>> {
        if self.catalog_enabled {
            Ok(self.cache.all().await)
        } else {
            self.memory.all_attributes().await
        }
    }

    fn flush_stats(&self) -> super::FlushStats {
        super::FlushStats {
            failed_flushes: self.flush_failures(),
            spilled_rows: self.spilled_rows(),
        }
    }

    async fn clear(&self) -> Result<()> {
        self.memory.clear().await?;
        self.cache.clear().await?;
        for table in ["metrics", "spans", "logs", "attribute_values"] {
            self.client
                .query(&format!("TRUNCATE TABLE metascope.{table}"))
                .execute()
                .await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.metric_buffer.trigger_flush();
        self.span_buffer.trigger_flush();
        self.log_buffer.trigger_flush();
        self.value_buffer.trigger_flush();
        if self.catalog_enabled {
            self.cache.flush_dirty().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Stop intake and drain each buffer within its own deadline, then
        // mirror the catalog one last time.
        self.metric_buffer.close().await?;
        self.span_buffer.close().await?;
        self.log_buffer.close().await?;
        self.value_buffer.close().await?;
        let _ = self.shutdown_tx.send(true);
        let handle = self.flusher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!("attribute flusher exited abnormally: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::log::BodyTemplate;

    #[test]
    fn metric_rows_split_per_service_and_reassemble() {
        let mut meta =
            MetricMetadata::new("cpu".into(), MetricData::Gauge, 14, Utc::now());
        meta.sample_count = 10;
        meta.services.insert("api".into(), 6);
        meta.services.insert("worker".into(), 4);
        meta.label_keys
            .insert("host".into(), KeyState::new(14, 10, Utc::now()));

        let rows = metric_rows(&meta);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().map(|r| r.sample_count).sum::<u64>(), 10);
        assert!(rows.iter().all(|r| r.services.len() == 2));

        let restored = metric_from_rows(&rows, 14, 10).unwrap();
        assert_eq!(restored.name, "cpu");
        assert_eq!(restored.sample_count, 10);
        assert_eq!(restored.services, meta.services);
        assert!(restored.label_keys.contains_key("host"));
    }

    #[test]
    fn sum_metric_rows_keep_kind_fields() {
        let meta = MetricMetadata::new(
            "requests".into(),
            MetricData::Sum { temporality: Temporality::Cumulative, is_monotonic: true },
            14,
            Utc::now(),
        );
        let mut meta = meta;
        meta.services.insert("api".into(), 1);
        let rows = metric_rows(&meta);
        assert_eq!(rows[0].kind, "sum");
        assert_eq!(rows[0].temporality, "cumulative");
        assert!(rows[0].is_monotonic);

        let restored = metric_from_rows(&rows, 14, 10).unwrap();
        assert_eq!(
            restored.data,
            MetricData::Sum { temporality: Temporality::Cumulative, is_monotonic: true }
        );
    }

    #[test]
    fn log_rows_separate_severity_and_template_rows() {
        let mut meta = LogMetadata::new("ERROR".into(), 17, Utc::now());
        meta.record_count = 9;
        meta.services.insert("api".into(), 5);
        meta.services.insert("worker".into(), 4);
        meta.has_trace_context = true;
        meta.body_templates.insert(
            "timeout after <NUM> ms".into(),
            BodyTemplate {
                template: "timeout after <NUM> ms".into(),
                count: 7,
                example: "timeout after 300 ms".into(),
            },
        );

        let rows = log_rows(&meta);
        // 2 severity rows + 2 template rows (one per service).
        assert_eq!(rows.len(), 4);
        let severity_rows: Vec<_> =
            rows.iter().filter(|r| r.pattern_template.is_empty()).collect();
        assert_eq!(severity_rows.iter().map(|r| r.sample_count).sum::<u64>(), 9);
        assert!(rows.iter().all(|r| r.flags & LOG_FLAG_TRACE != 0));

        let restored = log_from_rows(&rows).unwrap();
        assert_eq!(restored.record_count, 9);
        assert_eq!(restored.services, meta.services);
        assert_eq!(restored.body_templates["timeout after <NUM> ms"].count, 7);
        assert!(restored.has_trace_context);
        assert!(!restored.has_span_context);
    }

    #[test]
    fn span_rows_roundtrip_kind_and_dropped_totals() {
        let mut meta = SpanMetadata::new("GET /x".into(), SpanKind::Server, Utc::now());
        meta.span_count = 3;
        meta.services.insert("api".into(), 3);
        meta.status_codes.insert("OK".into());
        meta.event_names.insert("exception".into());
        meta.dropped.attributes.record(5);

        let rows = span_rows(&meta);
        assert_eq!(rows[0].kind, "SPAN_KIND_SERVER");
        assert_eq!(rows[0].dropped_attributes, 5);

        let restored = span_from_rows(&rows, 14, 10).unwrap();
        assert_eq!(restored.kind_name, "SPAN_KIND_SERVER");
        assert_eq!(restored.kind, 2);
        assert_eq!(restored.span_count, 3);
        assert!(restored.event_names.contains("exception"));
        assert_eq!(restored.dropped.attributes.total, 5);
    }
}
