use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{KeyMap, ServicesMap, merge_key_maps, merge_services, refresh_percentages};
use crate::error::Result;

/// Severity text used when a record carries none.
pub const SEVERITY_UNSET: &str = "UNSET";

/// One mined body shape: the generalized token sequence, how many records
/// matched it, and a single example raw body (the first one seen).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyTemplate {
    pub template: String,
    pub count: u64,
    pub example: String,
}

/// Everything we keep about one severity class of log records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMetadata {
    pub severity_text: String,
    pub severity_number: i32,
    pub attribute_keys: KeyMap,
    pub resource_keys: KeyMap,
    /// Keyed by template identity; counts accumulate on re-observation.
    pub body_templates: BTreeMap<String, BodyTemplate>,
    pub record_count: u64,
    pub services: ServicesMap,
    pub has_trace_context: bool,
    pub has_span_context: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl LogMetadata {
    pub fn new(severity_text: String, severity_number: i32, now: DateTime<Utc>) -> Self {
        let severity_text = if severity_text.is_empty() {
            SEVERITY_UNSET.to_string()
        } else {
            severity_text
        };
        LogMetadata {
            severity_text,
            severity_number,
            attribute_keys: KeyMap::new(),
            resource_keys: KeyMap::new(),
            body_templates: BTreeMap::new(),
            record_count: 0,
            services: ServicesMap::new(),
            has_trace_context: false,
            has_span_context: false,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Attribute a mined template to this severity. When the match
    /// generalized the cluster, `previous` names the old template and its
    /// entry is re-keyed so the count and the original example survive.
    /// The example stays pinned to the first raw body ever attributed.
    pub fn record_template(&mut self, template: &str, previous: Option<&str>, raw_body: &str) {
        if let Some(previous) = previous
            && previous != template
            && let Some(mut moved) = self.body_templates.remove(previous)
        {
            moved.template = template.to_string();
            match self.body_templates.get_mut(template) {
                Some(existing) => {
                    existing.count += moved.count;
                }
                None => {
                    self.body_templates.insert(template.to_string(), moved);
                }
            }
        }
        match self.body_templates.get_mut(template) {
            Some(existing) => existing.count += 1,
            None => {
                self.body_templates.insert(
                    template.to_string(),
                    BodyTemplate {
                        template: template.to_string(),
                        count: 1,
                        example: raw_body.to_string(),
                    },
                );
            }
        }
    }

    pub fn merge(&mut self, other: &LogMetadata) -> Result<()> {
        self.record_count += other.record_count;
        if self.severity_number == 0 {
            self.severity_number = other.severity_number;
        }
        merge_key_maps(&mut self.attribute_keys, &other.attribute_keys)?;
        merge_key_maps(&mut self.resource_keys, &other.resource_keys)?;
        for (template, body) in &other.body_templates {
            match self.body_templates.get_mut(template) {
                Some(existing) => existing.count += body.count,
                None => {
                    self.body_templates.insert(template.clone(), body.clone());
                }
            }
        }
        merge_services(&mut self.services, &other.services);
        self.has_trace_context |= other.has_trace_context;
        self.has_span_context |= other.has_span_context;
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        self.refresh_percentages();
        Ok(())
    }

    pub fn refresh_percentages(&mut self) {
        refresh_percentages(&mut self.attribute_keys, self.record_count);
        refresh_percentages(&mut self.resource_keys, self.record_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn empty_severity_becomes_unset() {
        let meta = LogMetadata::new(String::new(), 0, now());
        assert_eq!(meta.severity_text, "UNSET");
        let meta = LogMetadata::new("ERROR".into(), 17, now());
        assert_eq!(meta.severity_text, "ERROR");
    }

    #[test]
    fn template_example_pins_first_raw_body() {
        let mut meta = LogMetadata::new("INFO".into(), 9, now());
        meta.record_template("user <*> logged in", None, "user john logged in");
        meta.record_template("user <*> logged in", None, "user jane logged in");
        let body = &meta.body_templates["user <*> logged in"];
        assert_eq!(body.count, 2);
        assert_eq!(body.example, "user john logged in");
    }

    #[test]
    fn generalization_rekeys_the_old_template() {
        let mut meta = LogMetadata::new("INFO".into(), 9, now());
        meta.record_template("user john logged in", None, "user john logged in");
        meta.record_template(
            "user <*> logged in",
            Some("user john logged in"),
            "user jane logged in",
        );
        assert_eq!(meta.body_templates.len(), 1);
        let body = &meta.body_templates["user <*> logged in"];
        assert_eq!(body.count, 2);
        assert_eq!(body.example, "user john logged in");
    }

    #[test]
    fn merge_accumulates_template_counts() {
        let mut a = LogMetadata::new("WARN".into(), 13, now());
        a.record_count = 3;
        a.record_template("disk <*> full", None, "disk sda full");
        let mut b = LogMetadata::new("WARN".into(), 13, now());
        b.record_count = 2;
        b.record_template("disk <*> full", None, "disk sdb full");
        b.record_template("oom killed <*>", None, "oom killed worker");
        b.has_trace_context = true;

        a.merge(&b).unwrap();
        assert_eq!(a.record_count, 5);
        assert_eq!(a.body_templates["disk <*> full"].count, 2);
        assert_eq!(a.body_templates["disk <*> full"].example, "disk sda full");
        assert_eq!(a.body_templates["oom killed <*>"].count, 1);
        assert!(a.has_trace_context);
        assert!(!a.has_span_context);
    }
}
