use chrono::Utc;

use super::{AnalyzerConfig, catalog_observation, observe_key};
use crate::miner::Masker;
use crate::models::attribute::{AttributeScope, SignalType};
use crate::models::span::{SpanKind, SpanMetadata};
use crate::pdata::{ResourceSpans, attributes_to_map};
use crate::store::AttributeObservation;

pub(super) struct Outcome {
    pub entities: Vec<SpanMetadata>,
    pub observations: Vec<AttributeObservation>,
    pub span_count: u64,
}

pub(super) fn analyze(
    batch: &[ResourceSpans],
    masker: &Masker,
    config: AnalyzerConfig,
) -> Outcome {
    let now = Utc::now();
    let mut entities = Vec::new();
    let mut observations = Vec::new();
    let mut span_count = 0u64;

    for resource_spans in batch {
        let resource = resource_spans.resource.clone().unwrap_or_default();
        let service = resource.service_name();
        let resource_attrs = attributes_to_map(&resource.attributes);

        for scope_spans in &resource_spans.scope_spans {
            for span in &scope_spans.spans {
                if span.name.is_empty() {
                    continue;
                }
                span_count += 1;
                let mut meta =
                    SpanMetadata::new(span.name.clone(), SpanKind::from_i32(span.kind), now);
                meta.span_count = 1;
                meta.services.insert(service.clone(), 1);
                meta.name_patterns.insert(masker.mask(&span.name));

                for (key, value) in attributes_to_map(&span.attributes) {
                    observe_key(&mut meta.attribute_keys, &key, &value, config, now);
                    observations.push(catalog_observation(
                        &key,
                        &value,
                        SignalType::Span,
                        AttributeScope::Attribute,
                    ));
                }
                for (key, value) in &resource_attrs {
                    observe_key(&mut meta.resource_keys, key, value, config, now);
                    observations.push(catalog_observation(
                        key,
                        value,
                        SignalType::Span,
                        AttributeScope::Resource,
                    ));
                }

                for event in &span.events {
                    if event.name.is_empty() {
                        continue;
                    }
                    meta.event_names.insert(event.name.clone());
                    let keys = meta.event_attribute_keys.entry(event.name.clone()).or_default();
                    for (key, value) in attributes_to_map(&event.attributes) {
                        observe_key(keys, &key, &value, config, now);
                        observations.push(catalog_observation(
                            &key,
                            &value,
                            SignalType::Span,
                            AttributeScope::Attribute,
                        ));
                    }
                }

                for link in &span.links {
                    for (key, value) in attributes_to_map(&link.attributes) {
                        observe_key(&mut meta.link_attribute_keys, &key, &value, config, now);
                        observations.push(catalog_observation(
                            &key,
                            &value,
                            SignalType::Span,
                            AttributeScope::Attribute,
                        ));
                    }
                }

                let status = span
                    .status
                    .as_ref()
                    .map(|s| s.code_str())
                    .unwrap_or("UNSET");
                meta.status_codes.insert(status.to_string());

                meta.dropped.attributes.record(span.dropped_attributes_count as u64);
                meta.dropped.events.record(span.dropped_events_count as u64);
                meta.dropped.links.record(span.dropped_links_count as u64);

                meta.refresh_percentages();
                entities.push(meta);
            }
        }
    }

    Outcome { entities, observations, span_count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdata::ExportTraceRequest;

    fn config() -> AnalyzerConfig {
        AnalyzerConfig { hll_precision: 14, max_samples_per_key: 10 }
    }

    fn payload() -> ExportTraceRequest {
        serde_json::from_str(
            r#"{
            "resourceSpans": [{
                "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "checkout"}}]},
                "scopeSpans": [{
                    "spans": [{
                        "name": "GET /orders/1234",
                        "kind": 2,
                        "attributes": [{"key": "http.method", "value": {"stringValue": "GET"}}],
                        "events": [{
                            "name": "exception",
                            "attributes": [{"key": "exception.type", "value": {"stringValue": "Timeout"}}]
                        }],
                        "links": [{"attributes": [{"key": "peer.trace", "value": {"stringValue": "abc"}}]}],
                        "status": {"code": 2},
                        "droppedAttributesCount": 3,
                        "droppedEventsCount": 1
                    }]
                }]
            }]
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn span_entity_collects_events_links_status_and_dropped() {
        let req = payload();
        let outcome = analyze(&req.resource_spans, &Masker::with_defaults(), config());
        assert_eq!(outcome.span_count, 1);

        let meta = &outcome.entities[0];
        assert_eq!(meta.name, "GET /orders/1234");
        assert_eq!(meta.kind, 2);
        assert_eq!(meta.kind_name, "SPAN_KIND_SERVER");
        assert!(meta.attribute_keys.contains_key("http.method"));
        assert!(meta.resource_keys.contains_key("service.name"));
        assert!(meta.event_names.contains("exception"));
        assert!(meta.event_attribute_keys["exception"].contains_key("exception.type"));
        assert!(meta.link_attribute_keys.contains_key("peer.trace"));
        assert!(meta.status_codes.contains("ERROR"));
        assert_eq!(meta.dropped.attributes.total, 3);
        assert_eq!(meta.dropped.attributes.max_per_span, 3);
        assert_eq!(meta.dropped.events.total, 1);
        assert_eq!(meta.services["checkout"], 1);
    }

    #[test]
    fn span_names_generalize_into_patterns() {
        let req = payload();
        let outcome = analyze(&req.resource_spans, &Masker::with_defaults(), config());
        assert!(
            outcome.entities[0]
                .name_patterns
                .contains("GET /orders/<NUM>")
        );
    }

    #[test]
    fn missing_status_counts_as_unset() {
        let req: ExportTraceRequest = serde_json::from_str(
            r#"{"resourceSpans": [{"scopeSpans": [{"spans": [{"name": "op"}]}]}]}"#,
        )
        .unwrap();
        let outcome = analyze(&req.resource_spans, &Masker::with_defaults(), config());
        assert!(outcome.entities[0].status_codes.contains("UNSET"));
        assert_eq!(outcome.entities[0].kind_name, "SPAN_KIND_UNSPECIFIED");
    }
}
