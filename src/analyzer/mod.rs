//! Analyzers: decoded OTLP payloads in, metadata entities out.
//!
//! Each signal class has an analyzer that walks the payload, builds the
//! per-identity entities, and collects the key observations destined for
//! the global attribute catalog. Entities are built per occurrence; the
//! store's merge-on-upsert makes repeated identities converge.

mod logs;
mod metrics;
mod spans;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::miner::{Masker, TemplateMiner};
use crate::models::KeyMap;
use crate::models::keystate::KeyState;
use crate::pdata::{ExportLogsRequest, ExportMetricsRequest, ExportTraceRequest};
use crate::store::{AttributeObservation, FlushStats, MetadataStore};

/// Process-wide ingest counters, surfaced on the health endpoint.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub metric_payloads: AtomicU64,
    pub span_payloads: AtomicU64,
    pub log_payloads: AtomicU64,
    pub metrics_observed: AtomicU64,
    pub spans_observed: AtomicU64,
    pub log_records_observed: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct IngestSnapshot {
    pub metric_payloads: u64,
    pub span_payloads: u64,
    pub log_payloads: u64,
    pub metrics_observed: u64,
    pub spans_observed: u64,
    pub log_records_observed: u64,
    /// Durable-mirror flushes that exhausted their retries. Always zero
    /// on the in-memory backend.
    pub batch_flush_failures: u64,
    /// Rows those flushes spilled to recovery files.
    pub spilled_rows: u64,
}

impl IngestStats {
    /// Combine the ingest counters with the store's write-path failure
    /// counters into one health snapshot.
    pub fn snapshot(&self, flush: FlushStats) -> IngestSnapshot {
        IngestSnapshot {
            metric_payloads: self.metric_payloads.load(Ordering::Relaxed),
            span_payloads: self.span_payloads.load(Ordering::Relaxed),
            log_payloads: self.log_payloads.load(Ordering::Relaxed),
            metrics_observed: self.metrics_observed.load(Ordering::Relaxed),
            spans_observed: self.spans_observed.load(Ordering::Relaxed),
            log_records_observed: self.log_records_observed.load(Ordering::Relaxed),
            batch_flush_failures: flush.failed_flushes,
            spilled_rows: flush.spilled_rows,
        }
    }
}

/// Per-key limits shared by every analyzer.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerConfig {
    pub hll_precision: u8,
    pub max_samples_per_key: usize,
}

pub struct Analyzer {
    store: Arc<dyn MetadataStore>,
    /// None disables template mining entirely.
    miner: Option<Arc<TemplateMiner>>,
    masker: Masker,
    config: AnalyzerConfig,
    stats: Arc<IngestStats>,
}

impl Analyzer {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        miner: Option<Arc<TemplateMiner>>,
        masker: Masker,
        config: AnalyzerConfig,
    ) -> Self {
        Analyzer {
            store,
            miner,
            masker,
            config,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn miner(&self) -> Option<&Arc<TemplateMiner>> {
        self.miner.as_ref()
    }

    pub async fn consume_metrics(&self, req: ExportMetricsRequest) -> Result<()> {
        self.stats.metric_payloads.fetch_add(1, Ordering::Relaxed);
        let outcome = metrics::analyze(&req.resource_metrics, self.config);
        self.stats
            .metrics_observed
            .fetch_add(outcome.entities.len() as u64, Ordering::Relaxed);
        for entity in outcome.entities {
            self.store.upsert_metric(entity).await?;
        }
        self.store.observe_attributes(outcome.observations).await
    }

    pub async fn consume_traces(&self, req: ExportTraceRequest) -> Result<()> {
        self.stats.span_payloads.fetch_add(1, Ordering::Relaxed);
        let outcome = spans::analyze(&req.resource_spans, &self.masker, self.config);
        self.stats
            .spans_observed
            .fetch_add(outcome.span_count, Ordering::Relaxed);
        for entity in outcome.entities {
            self.store.upsert_span(entity).await?;
        }
        self.store.observe_attributes(outcome.observations).await
    }

    pub async fn consume_logs(&self, req: ExportLogsRequest) -> Result<()> {
        self.stats.log_payloads.fetch_add(1, Ordering::Relaxed);
        let outcome = logs::analyze(
            &req.resource_logs,
            self.miner.as_deref(),
            &self.masker,
            self.config,
        )?;
        self.stats
            .log_records_observed
            .fetch_add(outcome.record_count, Ordering::Relaxed);
        for entity in outcome.entities {
            self.store.upsert_log(entity).await?;
        }
        self.store.observe_attributes(outcome.observations).await
    }
}

/// Observe one key/value on the per-entity key map.
pub(super) fn observe_key(
    map: &mut KeyMap,
    key: &str,
    value: &str,
    config: AnalyzerConfig,
    now: DateTime<Utc>,
) {
    map.entry(key.to_string())
        .or_insert_with(|| KeyState::new(config.hll_precision, config.max_samples_per_key, now))
        .observe(value, now);
}

pub(super) fn catalog_observation(
    key: &str,
    value: &str,
    signal: crate::models::attribute::SignalType,
    scope: crate::models::attribute::AttributeScope,
) -> AttributeObservation {
    AttributeObservation {
        key: key.to_string(),
        value: value.to_string(),
        signal,
        scope,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_folds_in_store_flush_counters() {
        let stats = IngestStats::default();
        stats.metric_payloads.fetch_add(3, Ordering::Relaxed);
        stats.log_records_observed.fetch_add(12, Ordering::Relaxed);

        let snapshot = stats.snapshot(FlushStats { failed_flushes: 2, spilled_rows: 250 });
        assert_eq!(snapshot.metric_payloads, 3);
        assert_eq!(snapshot.log_records_observed, 12);
        assert_eq!(snapshot.batch_flush_failures, 2);
        assert_eq!(snapshot.spilled_rows, 250);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["batch_flush_failures"], 2);
        assert_eq!(json["spilled_rows"], 250);
    }
}
