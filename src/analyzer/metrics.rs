use chrono::Utc;

use super::{AnalyzerConfig, catalog_observation, observe_key};
use crate::models::attribute::{AttributeScope, SignalType};
use crate::models::metric::{MetricData, MetricMetadata, Temporality, label_fingerprint};
use crate::pdata::{Metric, ResourceMetrics, attributes_to_map};
use crate::store::AttributeObservation;

pub(super) struct Outcome {
    pub entities: Vec<MetricMetadata>,
    pub observations: Vec<AttributeObservation>,
}

fn temporality(raw: i32) -> Temporality {
    match raw {
        1 => Temporality::Delta,
        2 => Temporality::Cumulative,
        _ => Temporality::Unspecified,
    }
}

/// Kind-specific fields: sum carries temporality and monotonicity,
/// histograms the union of explicit bounds across data points,
/// exponential histograms the union of observed scales.
fn metric_data(metric: &Metric) -> MetricData {
    if let Some(sum) = &metric.sum {
        return MetricData::Sum {
            temporality: temporality(sum.aggregation_temporality),
            is_monotonic: sum.is_monotonic,
        };
    }
    if let Some(histogram) = &metric.histogram {
        let mut bounds: Vec<f64> = Vec::new();
        for point in &histogram.data_points {
            for bound in &point.explicit_bounds {
                if !bounds.iter().any(|b| b == bound) {
                    bounds.push(*bound);
                }
            }
        }
        bounds.sort_by(|a, b| a.total_cmp(b));
        return MetricData::Histogram { explicit_bounds: bounds };
    }
    if let Some(exp) = &metric.exponential_histogram {
        let mut scales: Vec<i32> = Vec::new();
        for point in &exp.data_points {
            if !scales.contains(&point.scale) {
                scales.push(point.scale);
            }
        }
        scales.sort_unstable();
        return MetricData::ExponentialHistogram { scales };
    }
    if metric.summary.is_some() {
        return MetricData::Summary;
    }
    MetricData::Gauge
}

pub(super) fn analyze(batch: &[ResourceMetrics], config: AnalyzerConfig) -> Outcome {
    let now = Utc::now();
    let mut entities = Vec::new();
    let mut observations = Vec::new();

    for resource_metrics in batch {
        let resource = resource_metrics.resource.clone().unwrap_or_default();
        let service = resource.service_name();
        let resource_attrs = attributes_to_map(&resource.attributes);

        for scope_metrics in &resource_metrics.scope_metrics {
            for metric in &scope_metrics.metrics {
                if metric.name.is_empty() {
                    continue;
                }
                let mut meta = MetricMetadata::new(
                    metric.name.clone(),
                    metric_data(metric),
                    config.hll_precision,
                    now,
                );
                meta.unit = metric.unit.clone();
                meta.description = metric.description.clone();

                let point_attrs: Vec<_> = data_point_attributes(metric);
                for attrs in &point_attrs {
                    let labels = attributes_to_map(attrs);
                    meta.active_series.insert(label_fingerprint(&labels).as_bytes());
                    meta.sample_count += 1;
                    *meta.services.entry(service.clone()).or_insert(0) += 1;

                    for (key, value) in &labels {
                        observe_key(&mut meta.label_keys, key, value, config, now);
                        observations.push(catalog_observation(
                            key,
                            value,
                            SignalType::Metric,
                            AttributeScope::Attribute,
                        ));
                    }
                    for (key, value) in &resource_attrs {
                        observe_key(&mut meta.resource_keys, key, value, config, now);
                        observations.push(catalog_observation(
                            key,
                            value,
                            SignalType::Metric,
                            AttributeScope::Resource,
                        ));
                    }
                }
                meta.refresh_percentages();
                entities.push(meta);
            }
        }
    }

    Outcome { entities, observations }
}

fn data_point_attributes(metric: &Metric) -> Vec<&[crate::pdata::KeyValue]> {
    if let Some(gauge) = &metric.gauge {
        return gauge.data_points.iter().map(|p| p.attributes.as_slice()).collect();
    }
    if let Some(sum) = &metric.sum {
        return sum.data_points.iter().map(|p| p.attributes.as_slice()).collect();
    }
    if let Some(histogram) = &metric.histogram {
        return histogram.data_points.iter().map(|p| p.attributes.as_slice()).collect();
    }
    if let Some(exp) = &metric.exponential_histogram {
        return exp.data_points.iter().map(|p| p.attributes.as_slice()).collect();
    }
    if let Some(summary) = &metric.summary {
        return summary.data_points.iter().map(|p| p.attributes.as_slice()).collect();
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdata::ExportMetricsRequest;

    fn config() -> AnalyzerConfig {
        AnalyzerConfig { hll_precision: 14, max_samples_per_key: 10 }
    }

    fn gauge_payload() -> ExportMetricsRequest {
        serde_json::from_str(
            r#"{
            "resourceMetrics": [{
                "resource": {"attributes": [
                    {"key": "service.name", "value": {"stringValue": "api"}},
                    {"key": "host.name", "value": {"stringValue": "ip-10-0-0-1"}}
                ]},
                "scopeMetrics": [{
                    "metrics": [{
                        "name": "mem_usage",
                        "unit": "bytes",
                        "gauge": {"dataPoints": [
                            {"asDouble": 1.0, "attributes": [{"key": "pool", "value": {"stringValue": "heap"}}]},
                            {"asDouble": 2.0, "attributes": [{"key": "pool", "value": {"stringValue": "stack"}}]}
                        ]}
                    }]
                }]
            }]
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn gauge_builds_one_entity_with_label_and_resource_keys() {
        let req = gauge_payload();
        let outcome = analyze(&req.resource_metrics, config());
        assert_eq!(outcome.entities.len(), 1);

        let meta = &outcome.entities[0];
        assert_eq!(meta.name, "mem_usage");
        assert_eq!(meta.unit, "bytes");
        assert_eq!(meta.sample_count, 2);
        assert_eq!(meta.services["api"], 2);
        assert_eq!(meta.label_keys["pool"].count, 2);
        assert_eq!(meta.label_keys["pool"].estimated_cardinality, 2);
        assert!((meta.label_keys["pool"].percentage - 100.0).abs() < f64::EPSILON);
        assert!(meta.resource_keys.contains_key("host.name"));
        // Two distinct label combinations → two active series.
        assert_eq!(meta.active_series_count(), 2);
    }

    #[test]
    fn catalog_observations_carry_signal_and_scope() {
        let req = gauge_payload();
        let outcome = analyze(&req.resource_metrics, config());
        let pool = outcome
            .observations
            .iter()
            .find(|o| o.key == "pool")
            .unwrap();
        assert_eq!(pool.signal, SignalType::Metric);
        assert_eq!(pool.scope, AttributeScope::Attribute);
        let host = outcome
            .observations
            .iter()
            .find(|o| o.key == "host.name")
            .unwrap();
        assert_eq!(host.scope, AttributeScope::Resource);
    }

    #[test]
    fn histogram_unions_bounds_across_points() {
        let req: ExportMetricsRequest = serde_json::from_str(
            r#"{
            "resourceMetrics": [{
                "scopeMetrics": [{
                    "metrics": [{
                        "name": "latency",
                        "histogram": {"dataPoints": [
                            {"explicitBounds": [0.1, 0.5]},
                            {"explicitBounds": [0.5, 2.5]}
                        ]}
                    }]
                }]
            }]
        }"#,
        )
        .unwrap();
        let outcome = analyze(&req.resource_metrics, config());
        assert_eq!(
            outcome.entities[0].data,
            MetricData::Histogram { explicit_bounds: vec![0.1, 0.5, 2.5] }
        );
    }

    #[test]
    fn same_labels_produce_one_active_series() {
        let req: ExportMetricsRequest = serde_json::from_str(
            r#"{
            "resourceMetrics": [{
                "scopeMetrics": [{
                    "metrics": [{
                        "name": "ticks",
                        "sum": {
                            "isMonotonic": true,
                            "aggregationTemporality": 2,
                            "dataPoints": [
                                {"asInt": "1", "attributes": [{"key": "cpu", "value": {"stringValue": "0"}}]},
                                {"asInt": "2", "attributes": [{"key": "cpu", "value": {"stringValue": "0"}}]}
                            ]
                        }
                    }]
                }]
            }]
        }"#,
        )
        .unwrap();
        let outcome = analyze(&req.resource_metrics, config());
        let meta = &outcome.entities[0];
        assert_eq!(meta.sample_count, 2);
        assert_eq!(meta.active_series_count(), 1);
        assert_eq!(
            meta.data,
            MetricData::Sum { temporality: Temporality::Cumulative, is_monotonic: true }
        );
    }
}
