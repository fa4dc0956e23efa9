//! Analytical queries over the metadata store.
//!
//! Everything here is read-only: each operation works on entity snapshots
//! cloned out of the store under its read locks, never on live
//! references, and never touches the miner.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::models::KeyMap;
use crate::models::attribute::SignalType;
use crate::store::MetadataStore;

pub const HIGH_CARDINALITY_FLOOR: u64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct HighCardinalityKey {
    pub signal: SignalType,
    pub entity: String,
    pub scope: &'static str,
    pub key: String,
    pub estimated_cardinality: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplexityReport {
    pub signal: SignalType,
    pub entity: String,
    pub total_keys: usize,
    pub max_cardinality: u64,
    pub high_cardinality_count: usize,
    pub complexity_score: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyCardinality {
    pub key: String,
    pub estimated_cardinality: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternService {
    pub service: String,
    pub sample_count: u64,
    pub severities: Vec<String>,
    pub attribute_keys: Vec<KeyCardinality>,
    pub resource_keys: Vec<KeyCardinality>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternGroup {
    pub template: String,
    pub total_count: u64,
    pub example: String,
    pub severities: BTreeMap<String, u64>,
    pub services: Vec<PatternService>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceOverview {
    pub service: String,
    pub metric_names: Vec<String>,
    pub span_names: Vec<String>,
    pub log_severities: Vec<String>,
    pub metric_samples: u64,
    pub span_samples: u64,
    pub log_records: u64,
}

pub struct QueryEngine {
    store: Arc<dyn MetadataStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        QueryEngine { store }
    }

    /// Every (signal, entity, scope, key) whose estimated cardinality
    /// clears the threshold, highest first.
    pub async fn high_cardinality(
        &self,
        threshold: u64,
        limit: usize,
    ) -> Result<Vec<HighCardinalityKey>> {
        let mut hits: Vec<HighCardinalityKey> = Vec::new();
        let collect = |hits: &mut Vec<HighCardinalityKey>,
                       signal: SignalType,
                       entity: &str,
                       scope: &'static str,
                       keys: &KeyMap| {
            for (key, state) in keys {
                if state.estimated_cardinality >= threshold {
                    hits.push(HighCardinalityKey {
                        signal,
                        entity: entity.to_string(),
                        scope,
                        key: key.clone(),
                        estimated_cardinality: state.estimated_cardinality,
                        count: state.count,
                    });
                }
            }
        };

        for metric in self.store.all_metrics().await? {
            collect(&mut hits, SignalType::Metric, &metric.name, "label", &metric.label_keys);
            collect(&mut hits, SignalType::Metric, &metric.name, "resource", &metric.resource_keys);
        }
        for span in self.store.all_spans().await? {
            collect(&mut hits, SignalType::Span, &span.name, "attribute", &span.attribute_keys);
            collect(&mut hits, SignalType::Span, &span.name, "resource", &span.resource_keys);
            collect(&mut hits, SignalType::Span, &span.name, "link", &span.link_attribute_keys);
            for keys in span.event_attribute_keys.values() {
                collect(&mut hits, SignalType::Span, &span.name, "event", keys);
            }
        }
        for log in self.store.all_logs().await? {
            collect(&mut hits, SignalType::Log, &log.severity_text, "attribute", &log.attribute_keys);
            collect(&mut hits, SignalType::Log, &log.severity_text, "resource", &log.resource_keys);
        }

        hits.sort_by(|a, b| {
            b.estimated_cardinality
                .cmp(&a.estimated_cardinality)
                .then_with(|| a.entity.cmp(&b.entity))
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Structural complexity per entity: key breadth times worst-key
    /// cardinality.
    pub async fn complexity(
        &self,
        threshold: usize,
        limit: usize,
    ) -> Result<Vec<ComplexityReport>> {
        let mut reports = Vec::new();

        for metric in self.store.all_metrics().await? {
            reports.push(score(
                SignalType::Metric,
                &metric.name,
                [&metric.label_keys, &metric.resource_keys].into_iter(),
            ));
        }
        for span in self.store.all_spans().await? {
            let maps = [&span.attribute_keys, &span.resource_keys, &span.link_attribute_keys]
                .into_iter()
                .chain(span.event_attribute_keys.values());
            reports.push(score(SignalType::Span, &span.name, maps));
        }
        for log in self.store.all_logs().await? {
            reports.push(score(
                SignalType::Log,
                &log.severity_text,
                [&log.attribute_keys, &log.resource_keys].into_iter(),
            ));
        }

        reports.retain(|r| r.total_keys >= threshold);
        reports.sort_by(|a, b| {
            b.total_keys
                .cmp(&a.total_keys)
                .then_with(|| b.max_cardinality.cmp(&a.max_cardinality))
                .then_with(|| a.entity.cmp(&b.entity))
        });
        reports.truncate(limit);
        Ok(reports)
    }

    /// Group body templates across every log entity. Per-service records
    /// deduplicate across severities: counts sum, severities union.
    pub async fn log_patterns(
        &self,
        min_count: u64,
        min_services: usize,
    ) -> Result<Vec<PatternGroup>> {
        struct ServiceAccumulator {
            sample_count: u64,
            severities: std::collections::BTreeSet<String>,
            attribute_keys: BTreeMap<String, u64>,
            resource_keys: BTreeMap<String, u64>,
        }
        struct GroupAccumulator {
            total_count: u64,
            example: String,
            severities: BTreeMap<String, u64>,
            services: BTreeMap<String, ServiceAccumulator>,
        }

        let mut groups: BTreeMap<String, GroupAccumulator> = BTreeMap::new();
        for log in self.store.all_logs().await? {
            for template in log.body_templates.values() {
                let group = groups
                    .entry(template.template.clone())
                    .or_insert_with(|| GroupAccumulator {
                        total_count: 0,
                        example: template.example.clone(),
                        severities: BTreeMap::new(),
                        services: BTreeMap::new(),
                    });
                group.total_count += template.count;
                *group.severities.entry(log.severity_text.clone()).or_insert(0) +=
                    template.count;

                for (service, sample_count) in &log.services {
                    let acc = group
                        .services
                        .entry(service.clone())
                        .or_insert_with(|| ServiceAccumulator {
                            sample_count: 0,
                            severities: std::collections::BTreeSet::new(),
                            attribute_keys: BTreeMap::new(),
                            resource_keys: BTreeMap::new(),
                        });
                    acc.sample_count += sample_count;
                    acc.severities.insert(log.severity_text.clone());
                    for (key, state) in &log.attribute_keys {
                        let slot = acc.attribute_keys.entry(key.clone()).or_insert(0);
                        *slot = (*slot).max(state.estimated_cardinality);
                    }
                    for (key, state) in &log.resource_keys {
                        let slot = acc.resource_keys.entry(key.clone()).or_insert(0);
                        *slot = (*slot).max(state.estimated_cardinality);
                    }
                }
            }
        }

        let mut out: Vec<PatternGroup> = groups
            .into_iter()
            .filter(|(_, g)| g.total_count >= min_count && g.services.len() >= min_services)
            .map(|(template, g)| PatternGroup {
                template,
                total_count: g.total_count,
                example: g.example,
                severities: g.severities,
                services: g
                    .services
                    .into_iter()
                    .map(|(service, acc)| PatternService {
                        service,
                        sample_count: acc.sample_count,
                        severities: acc.severities.into_iter().collect(),
                        attribute_keys: key_cardinalities(acc.attribute_keys),
                        resource_keys: key_cardinalities(acc.resource_keys),
                    })
                    .collect(),
            })
            .collect();
        out.sort_by(|a, b| b.total_count.cmp(&a.total_count).then_with(|| a.template.cmp(&b.template)));
        Ok(out)
    }

    /// Active-series estimate for one metric.
    pub async fn active_series(&self, metric: &str) -> Result<u64> {
        Ok(self.store.get_metric(metric).await?.active_series_count())
    }

    pub async fn service_overview(&self, service: &str) -> Result<ServiceOverview> {
        let mut overview = ServiceOverview {
            service: service.to_string(),
            metric_names: Vec::new(),
            span_names: Vec::new(),
            log_severities: Vec::new(),
            metric_samples: 0,
            span_samples: 0,
            log_records: 0,
        };
        for metric in self.store.all_metrics().await? {
            if let Some(count) = metric.services.get(service) {
                overview.metric_names.push(metric.name.clone());
                overview.metric_samples += count;
            }
        }
        for span in self.store.all_spans().await? {
            if let Some(count) = span.services.get(service) {
                overview.span_names.push(span.name.clone());
                overview.span_samples += count;
            }
        }
        for log in self.store.all_logs().await? {
            if let Some(count) = log.services.get(service) {
                overview.log_severities.push(log.severity_text.clone());
                overview.log_records += count;
            }
        }
        if overview.metric_names.is_empty()
            && overview.span_names.is_empty()
            && overview.log_severities.is_empty()
        {
            return Err(crate::error::Error::NotFound(format!("service {service:?}")));
        }
        overview.metric_names.sort();
        overview.span_names.sort();
        overview.log_severities.sort();
        Ok(overview)
    }
}

fn score<'a>(
    signal: SignalType,
    entity: &str,
    maps: impl Iterator<Item = &'a KeyMap>,
) -> ComplexityReport {
    let mut total_keys = 0usize;
    let mut max_cardinality = 0u64;
    let mut high_cardinality_count = 0usize;
    for map in maps {
        total_keys += map.len();
        for state in map.values() {
            max_cardinality = max_cardinality.max(state.estimated_cardinality);
            if state.estimated_cardinality > HIGH_CARDINALITY_FLOOR {
                high_cardinality_count += 1;
            }
        }
    }
    ComplexityReport {
        signal,
        entity: entity.to_string(),
        total_keys,
        max_cardinality,
        high_cardinality_count,
        complexity_score: total_keys as u64 * max_cardinality,
    }
}

fn key_cardinalities(map: BTreeMap<String, u64>) -> Vec<KeyCardinality> {
    map.into_iter()
        .map(|(key, estimated_cardinality)| KeyCardinality { key, estimated_cardinality })
        .collect()
}
