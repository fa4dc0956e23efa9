//! Decoded OTLP v1 payload shapes.
//!
//! This is the boundary contract with the receiver layer: the analyzers
//! consume these structs, however they were decoded. The serde attributes
//! follow the OTLP/HTTP JSON encoding (camelCase fields, oneof variants
//! as sibling optional fields, 64-bit integers accepted as strings or
//! numbers), so the bundled HTTP intake can deserialize collector
//! traffic directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// service.name fallback when the resource doesn't carry one.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// OTLP JSON encodes 64-bit integers as strings; protobuf-JSON emitters
/// disagree on whether to quote them, so accept both.
mod flex {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number<T> {
        Raw(T),
        Text(String),
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        match Option::<Number<u64>>::deserialize(d)? {
            None => Ok(None),
            Some(Number::Raw(n)) => Ok(Some(n)),
            Some(Number::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        match Option::<Number<i64>>::deserialize(d)? {
            None => Ok(None),
            Some(Number::Raw(n)) => Ok(Some(n)),
            Some(Number::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }
}

// ── Common ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnyValue {
    pub string_value: Option<String>,
    pub bool_value: Option<bool>,
    #[serde(deserialize_with = "flex::opt_i64")]
    pub int_value: Option<i64>,
    pub double_value: Option<f64>,
    pub array_value: Option<ArrayValue>,
    pub kvlist_value: Option<KeyValueList>,
    pub bytes_value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayValue {
    pub values: Vec<AnyValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValueList {
    pub values: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValue {
    pub key: String,
    pub value: Option<AnyValue>,
}

impl AnyValue {
    /// Flatten to the string the metadata layer samples and sketches.
    /// Composite values render as compact JSON.
    pub fn render(&self) -> String {
        if let Some(s) = &self.string_value {
            return s.clone();
        }
        if let Some(b) = self.bool_value {
            return b.to_string();
        }
        if let Some(i) = self.int_value {
            return i.to_string();
        }
        if let Some(d) = self.double_value {
            return d.to_string();
        }
        if let Some(a) = &self.array_value {
            return serde_json::to_string(&a.values.iter().map(AnyValue::render).collect::<Vec<_>>())
                .unwrap_or_default();
        }
        if let Some(kv) = &self.kvlist_value {
            let map: BTreeMap<&str, String> = kv
                .values
                .iter()
                .map(|kv| (kv.key.as_str(), kv.value.as_ref().map(AnyValue::render).unwrap_or_default()))
                .collect();
            return serde_json::to_string(&map).unwrap_or_default();
        }
        if let Some(bytes) = &self.bytes_value {
            return bytes.clone();
        }
        String::new()
    }
}

/// Render an attribute list into an ordered key → value map.
pub fn attributes_to_map(attributes: &[KeyValue]) -> BTreeMap<String, String> {
    attributes
        .iter()
        .filter(|kv| !kv.key.is_empty())
        .map(|kv| {
            (
                kv.key.clone(),
                kv.value.as_ref().map(AnyValue::render).unwrap_or_default(),
            )
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

impl Resource {
    pub fn service_name(&self) -> String {
        self.attributes
            .iter()
            .find(|kv| kv.key == "service.name")
            .and_then(|kv| kv.value.as_ref())
            .and_then(|v| v.string_value.clone())
            .unwrap_or_else(|| UNKNOWN_SERVICE.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstrumentationScope {
    pub name: String,
    pub version: String,
}

// ── Metrics ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportMetricsRequest {
    pub resource_metrics: Vec<ResourceMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceMetrics {
    pub resource: Option<Resource>,
    pub scope_metrics: Vec<ScopeMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopeMetrics {
    pub scope: Option<InstrumentationScope>,
    pub metrics: Vec<Metric>,
}

/// The metric-data oneof, encoded as sibling optional fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metric {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub gauge: Option<Gauge>,
    pub sum: Option<Sum>,
    pub histogram: Option<Histogram>,
    pub exponential_histogram: Option<ExponentialHistogram>,
    pub summary: Option<Summary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Gauge {
    pub data_points: Vec<NumberDataPoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Sum {
    pub data_points: Vec<NumberDataPoint>,
    pub aggregation_temporality: i32,
    pub is_monotonic: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Histogram {
    pub data_points: Vec<HistogramDataPoint>,
    pub aggregation_temporality: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExponentialHistogram {
    pub data_points: Vec<ExponentialHistogramDataPoint>,
    pub aggregation_temporality: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Summary {
    pub data_points: Vec<SummaryDataPoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NumberDataPoint {
    pub attributes: Vec<KeyValue>,
    #[serde(deserialize_with = "flex::opt_u64")]
    pub time_unix_nano: Option<u64>,
    pub as_double: Option<f64>,
    #[serde(deserialize_with = "flex::opt_i64")]
    pub as_int: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistogramDataPoint {
    pub attributes: Vec<KeyValue>,
    #[serde(deserialize_with = "flex::opt_u64")]
    pub time_unix_nano: Option<u64>,
    pub explicit_bounds: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExponentialHistogramDataPoint {
    pub attributes: Vec<KeyValue>,
    #[serde(deserialize_with = "flex::opt_u64")]
    pub time_unix_nano: Option<u64>,
    pub scale: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SummaryDataPoint {
    pub attributes: Vec<KeyValue>,
    #[serde(deserialize_with = "flex::opt_u64")]
    pub time_unix_nano: Option<u64>,
}

// ── Traces ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportTraceRequest {
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSpans {
    pub resource: Option<Resource>,
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopeSpans {
    pub scope: Option<InstrumentationScope>,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub name: String,
    pub kind: i32,
    pub attributes: Vec<KeyValue>,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
    pub status: Option<SpanStatus>,
    pub dropped_attributes_count: u32,
    pub dropped_events_count: u32,
    pub dropped_links_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpanEvent {
    pub name: String,
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpanLink {
    pub trace_id: String,
    pub span_id: String,
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpanStatus {
    pub code: i32,
    pub message: String,
}

impl SpanStatus {
    pub fn code_str(&self) -> &'static str {
        match self.code {
            1 => "OK",
            2 => "ERROR",
            _ => "UNSET",
        }
    }
}

// ── Logs ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportLogsRequest {
    pub resource_logs: Vec<ResourceLogs>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLogs {
    pub resource: Option<Resource>,
    pub scope_logs: Vec<ScopeLogs>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopeLogs {
    pub scope: Option<InstrumentationScope>,
    pub log_records: Vec<LogRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogRecord {
    #[serde(deserialize_with = "flex::opt_u64")]
    pub time_unix_nano: Option<u64>,
    pub severity_number: i32,
    pub severity_text: String,
    pub body: Option<AnyValue>,
    pub attributes: Vec<KeyValue>,
    pub trace_id: String,
    pub span_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_value_renders_scalars() {
        let v = AnyValue { string_value: Some("api".into()), ..Default::default() };
        assert_eq!(v.render(), "api");
        let v = AnyValue { int_value: Some(42), ..Default::default() };
        assert_eq!(v.render(), "42");
        let v = AnyValue { bool_value: Some(true), ..Default::default() };
        assert_eq!(v.render(), "true");
        assert_eq!(AnyValue::default().render(), "");
    }

    #[test]
    fn int_value_accepts_string_or_number() {
        let quoted: AnyValue = serde_json::from_str(r#"{"intValue": "1234"}"#).unwrap();
        assert_eq!(quoted.int_value, Some(1234));
        let bare: AnyValue = serde_json::from_str(r#"{"intValue": 1234}"#).unwrap();
        assert_eq!(bare.int_value, Some(1234));
    }

    #[test]
    fn resource_extracts_service_name() {
        let resource: Resource = serde_json::from_str(
            r#"{"attributes": [{"key": "service.name", "value": {"stringValue": "checkout"}}]}"#,
        )
        .unwrap();
        assert_eq!(resource.service_name(), "checkout");
        assert_eq!(Resource::default().service_name(), UNKNOWN_SERVICE);
    }

    #[test]
    fn decodes_collector_style_metrics_payload() {
        let payload = r#"{
            "resourceMetrics": [{
                "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "api"}}]},
                "scopeMetrics": [{
                    "metrics": [{
                        "name": "http_requests_total",
                        "unit": "1",
                        "sum": {
                            "aggregationTemporality": 2,
                            "isMonotonic": true,
                            "dataPoints": [{
                                "timeUnixNano": "1717243845000000000",
                                "asInt": "7",
                                "attributes": [{"key": "method", "value": {"stringValue": "GET"}}]
                            }]
                        }
                    }]
                }]
            }]
        }"#;
        let req: ExportMetricsRequest = serde_json::from_str(payload).unwrap();
        let metric = &req.resource_metrics[0].scope_metrics[0].metrics[0];
        assert_eq!(metric.name, "http_requests_total");
        let sum = metric.sum.as_ref().unwrap();
        assert!(sum.is_monotonic);
        assert_eq!(sum.data_points[0].as_int, Some(7));
        assert_eq!(
            attributes_to_map(&sum.data_points[0].attributes),
            BTreeMap::from([("method".to_string(), "GET".to_string())])
        );
    }

    #[test]
    fn span_status_maps_to_canonical_strings() {
        assert_eq!(SpanStatus { code: 1, message: String::new() }.code_str(), "OK");
        assert_eq!(SpanStatus { code: 2, message: String::new() }.code_str(), "ERROR");
        assert_eq!(SpanStatus { code: 0, message: String::new() }.code_str(), "UNSET");
    }
}
