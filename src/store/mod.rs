pub mod batch;
pub mod catalog;
pub mod columnar;
pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::attribute::{AttributeCatalogEntry, AttributeScope, SignalType};
use crate::models::log::LogMetadata;
use crate::models::metric::MetricMetadata;
use crate::models::span::SpanMetadata;

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Validated pagination window. `limit` clamps to the ceiling rather than
/// erroring, matching the rest of the read surface.
#[derive(Debug, Clone, Copy)]
pub struct PageParams {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageParams {
    fn default() -> Self {
        PageParams { limit: DEFAULT_PAGE_LIMIT, offset: 0 }
    }
}

impl PageParams {
    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Result<Self> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit == 0 {
            return Err(Error::InvalidInput("limit must be positive".into()));
        }
        Ok(PageParams {
            limit: limit.min(MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0),
        })
    }
}

/// List-response envelope. `total` counts filtered rows, not the
/// pre-filter population.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Slice an already-filtered, already-sorted collection.
    pub fn paginate(items: Vec<T>, params: PageParams) -> Page<T> {
        let total = items.len();
        let data: Vec<T> = items
            .into_iter()
            .skip(params.offset)
            .take(params.limit)
            .collect();
        let has_more = params.offset + data.len() < total;
        Page {
            data,
            total,
            limit: params.limit,
            offset: params.offset,
            has_more,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributeSort {
    #[default]
    Key,
    Cardinality,
    Count,
    LastSeen,
}

impl AttributeSort {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "key" => Ok(AttributeSort::Key),
            "cardinality" => Ok(AttributeSort::Cardinality),
            "count" => Ok(AttributeSort::Count),
            "last_seen" => Ok(AttributeSort::LastSeen),
            other => Err(Error::InvalidInput(format!("unknown sort key {other:?}"))),
        }
    }
}

/// Filters for the attribute-catalog read path.
#[derive(Debug, Clone, Default)]
pub struct AttributeQuery {
    pub signal_type: Option<SignalType>,
    pub scope: Option<AttributeScope>,
    pub min_cardinality: Option<u64>,
    pub sort_by: AttributeSort,
    pub descending: bool,
    pub page: PageParams,
}

/// One key observation on its way to the global attribute catalog. The
/// value lives only long enough to feed the sketch and the sample list.
#[derive(Debug, Clone)]
pub struct AttributeObservation {
    pub key: String,
    pub value: String,
    pub signal: SignalType,
    pub scope: AttributeScope,
}

/// Durable-mirror write health: flushes that exhausted their retries and
/// the rows those flushes spilled to recovery files.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FlushStats {
    pub failed_flushes: u64,
    pub spilled_rows: u64,
}

/// Upsert-by-identity plus paginated reads; implemented by the sharded
/// in-process backend and the columnar backend.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert_metric(&self, meta: MetricMetadata) -> Result<()>;
    async fn upsert_span(&self, meta: SpanMetadata) -> Result<()>;
    async fn upsert_log(&self, meta: LogMetadata) -> Result<()>;
    async fn observe_attributes(&self, observations: Vec<AttributeObservation>) -> Result<()>;

    async fn list_metrics(
        &self,
        page: PageParams,
        service: Option<&str>,
    ) -> Result<Page<MetricMetadata>>;
    async fn get_metric(&self, name: &str) -> Result<MetricMetadata>;
    async fn list_spans(
        &self,
        page: PageParams,
        service: Option<&str>,
    ) -> Result<Page<SpanMetadata>>;
    async fn get_span(&self, name: &str) -> Result<SpanMetadata>;
    async fn list_logs(
        &self,
        page: PageParams,
        service: Option<&str>,
    ) -> Result<Page<LogMetadata>>;
    async fn get_log(&self, severity: &str) -> Result<LogMetadata>;

    async fn list_services(&self) -> Result<Vec<String>>;

    async fn query_attributes(&self, query: AttributeQuery) -> Result<Page<AttributeCatalogEntry>>;
    async fn get_attribute(&self, key: &str) -> Result<AttributeCatalogEntry>;

    /// Read-only snapshots for the query engine. Snapshots are clones
    /// taken under the shard read locks; callers never hold references
    /// into the shard maps.
    async fn all_metrics(&self) -> Result<Vec<MetricMetadata>>;
    async fn all_spans(&self) -> Result<Vec<SpanMetadata>>;
    async fn all_logs(&self) -> Result<Vec<LogMetadata>>;
    async fn all_attributes(&self) -> Result<Vec<AttributeCatalogEntry>>;

    /// Write-path failure counters, surfaced on the health endpoint.
    /// Backends without a durable mirror have nothing to fail.
    fn flush_stats(&self) -> FlushStats {
        FlushStats::default()
    }

    /// Admin wipe of every entity and the catalog.
    async fn clear(&self) -> Result<()>;
    /// Push pending writes to the durable mirror, if any.
    async fn flush(&self) -> Result<()>;
    /// Stop intake, flush, and release resources. Bounded by the
    /// caller's deadline.
    async fn close(&self) -> Result<()>;
}
