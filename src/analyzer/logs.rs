use std::collections::BTreeMap;

use chrono::Utc;

use super::{AnalyzerConfig, catalog_observation, observe_key};
use crate::error::Result;
use crate::miner::{Masker, TemplateMiner};
use crate::models::attribute::{AttributeScope, SignalType};
use crate::models::log::LogMetadata;
use crate::pdata::{AnyValue, ResourceLogs, attributes_to_map};
use crate::store::AttributeObservation;

pub(super) struct Outcome {
    pub entities: Vec<LogMetadata>,
    pub observations: Vec<AttributeObservation>,
    pub record_count: u64,
}

/// Records group by severity text inside the batch, so one payload
/// produces at most one entity per severity and the store merges less.
pub(super) fn analyze(
    batch: &[ResourceLogs],
    miner: Option<&TemplateMiner>,
    masker: &Masker,
    config: AnalyzerConfig,
) -> Result<Outcome> {
    let now = Utc::now();
    let mut by_severity: BTreeMap<String, LogMetadata> = BTreeMap::new();
    let mut observations = Vec::new();
    let mut record_count = 0u64;

    for resource_logs in batch {
        let resource = resource_logs.resource.clone().unwrap_or_default();
        let service = resource.service_name();
        let resource_attrs = attributes_to_map(&resource.attributes);

        for scope_logs in &resource_logs.scope_logs {
            for record in &scope_logs.log_records {
                record_count += 1;
                let mut meta = LogMetadata::new(
                    record.severity_text.clone(),
                    record.severity_number,
                    now,
                );
                meta.record_count = 1;
                meta.services.insert(service.clone(), 1);
                meta.has_trace_context = !record.trace_id.is_empty();
                meta.has_span_context = !record.span_id.is_empty();

                for (key, value) in attributes_to_map(&record.attributes) {
                    observe_key(&mut meta.attribute_keys, &key, &value, config, now);
                    observations.push(catalog_observation(
                        &key,
                        &value,
                        SignalType::Log,
                        AttributeScope::Attribute,
                    ));
                }
                for (key, value) in &resource_attrs {
                    observe_key(&mut meta.resource_keys, key, value, config, now);
                    observations.push(catalog_observation(
                        key,
                        value,
                        SignalType::Log,
                        AttributeScope::Resource,
                    ));
                }

                let severity = meta.severity_text.clone();
                let group = match by_severity.entry(severity) {
                    std::collections::btree_map::Entry::Occupied(entry) => {
                        let group = entry.into_mut();
                        group.merge(&meta)?;
                        group
                    }
                    std::collections::btree_map::Entry::Vacant(entry) => entry.insert(meta),
                };

                // Templates accumulate on the group entity so a rename
                // from generalization re-keys the entry it grew out of.
                let body = record.body.as_ref().map(AnyValue::render).unwrap_or_default();
                if !body.is_empty()
                    && let Some(miner) = miner
                    && let Some(outcome) = miner.process(&masker.mask(&body))
                {
                    group.record_template(
                        &outcome.template,
                        outcome.previous_template.as_deref(),
                        &body,
                    );
                }
            }
        }
    }

    Ok(Outcome {
        entities: by_severity.into_values().collect(),
        observations,
        record_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::MinerConfig;
    use crate::pdata::ExportLogsRequest;

    fn config() -> AnalyzerConfig {
        AnalyzerConfig { hll_precision: 14, max_samples_per_key: 10 }
    }

    fn payload() -> ExportLogsRequest {
        serde_json::from_str(
            r#"{
            "resourceLogs": [{
                "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "auth"}}]},
                "scopeLogs": [{
                    "logRecords": [
                        {
                            "severityText": "INFO",
                            "severityNumber": 9,
                            "body": {"stringValue": "user john logged in from 1.2.3.4"},
                            "attributes": [{"key": "session", "value": {"stringValue": "s1"}}],
                            "traceId": "abc123"
                        },
                        {
                            "severityText": "INFO",
                            "severityNumber": 9,
                            "body": {"stringValue": "user jane logged in from 5.6.7.8"}
                        },
                        {
                            "severityNumber": 0,
                            "body": {"stringValue": "plain line"}
                        }
                    ]
                }]
            }]
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn groups_by_severity_and_mines_templates() {
        let miner = TemplateMiner::new(MinerConfig::default()).unwrap();
        let req = payload();
        let outcome = analyze(
            &req.resource_logs,
            Some(&miner),
            &Masker::with_defaults(),
            config(),
        )
        .unwrap();

        assert_eq!(outcome.record_count, 3);
        assert_eq!(outcome.entities.len(), 2);

        let info = outcome
            .entities
            .iter()
            .find(|e| e.severity_text == "INFO")
            .unwrap();
        assert_eq!(info.record_count, 2);
        assert_eq!(info.services["auth"], 2);
        assert!(info.has_trace_context);
        // Both lines collapsed into one generalized template.
        let template = &info.body_templates["user <*> logged in from <IP>"];
        assert_eq!(template.count, 2);
        assert_eq!(template.example, "user john logged in from 1.2.3.4");

        let unset = outcome
            .entities
            .iter()
            .find(|e| e.severity_text == "UNSET")
            .unwrap();
        assert_eq!(unset.record_count, 1);
        assert!(!unset.has_trace_context);
    }

    #[test]
    fn disabled_miner_still_counts_records() {
        let req = payload();
        let outcome =
            analyze(&req.resource_logs, None, &Masker::with_defaults(), config()).unwrap();
        let info = outcome
            .entities
            .iter()
            .find(|e| e.severity_text == "INFO")
            .unwrap();
        assert!(info.body_templates.is_empty());
        assert_eq!(info.record_count, 2);
        assert!(info.attribute_keys.contains_key("session"));
    }
}
