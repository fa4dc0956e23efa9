//! Pre-masking: ordered regex rewrites applied to log bodies before
//! mining, so volatile atoms (timestamps, UUIDs, addresses) collapse to
//! stable placeholders instead of spawning one cluster each.
//!
//! The pattern list is data, not code: it comes from configuration and is
//! applied strictly in declared order. The bundled defaults are anchored
//! on word boundaries; the regex engine is non-backtracking, so no
//! pattern can blow up on adversarial input.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One configured rewrite rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskSpec {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

struct CompiledMask {
    name: String,
    regex: Regex,
    placeholder: String,
}

pub struct Masker {
    patterns: Vec<CompiledMask>,
}

impl Masker {
    pub fn new(specs: &[MaskSpec]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(specs.len());
        for spec in specs {
            let regex = Regex::new(&spec.regex).map_err(|e| {
                Error::InvalidInput(format!("mask pattern {:?}: {e}", spec.name))
            })?;
            patterns.push(CompiledMask {
                name: spec.name.clone(),
                regex,
                placeholder: spec.placeholder.clone(),
            });
        }
        Ok(Masker { patterns })
    }

    pub fn with_defaults() -> Self {
        // Defaults are known-good; a compile failure here is a bug.
        Masker::new(&default_specs()).unwrap()
    }

    /// Apply every pattern in declared order.
    pub fn mask(&self, input: &str) -> String {
        let mut out = input.to_string();
        for pattern in &self.patterns {
            if pattern.regex.is_match(&out) {
                out = pattern
                    .regex
                    .replace_all(&out, pattern.placeholder.as_str())
                    .into_owned();
            }
        }
        out
    }

    pub fn pattern_names(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Bundled pattern list. Order matters: composite atoms (timestamps,
/// URLs) must fire before the generic number rule eats their digits.
pub fn default_specs() -> Vec<MaskSpec> {
    let spec = |name: &str, regex: &str, placeholder: &str| MaskSpec {
        name: name.to_string(),
        regex: regex.to_string(),
        placeholder: placeholder.to_string(),
    };
    vec![
        spec(
            "timestamp",
            r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            "<TIMESTAMP>",
        ),
        spec(
            "uuid",
            r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
            "<UUID>",
        ),
        spec(
            "email",
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            "<EMAIL>",
        ),
        spec("url", r#"\bhttps?://[^\s"']+"#, "<URL>"),
        spec("ip", r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d{1,5})?\b", "<IP>"),
        spec(
            "duration",
            r"\b\d+(?:\.\d+)?(?:ns|us|µs|ms|s|m|h)\b",
            "<DURATION>",
        ),
        spec("hex", r"\b(?:0x[0-9a-fA-F]+|[0-9a-fA-F]{16,})\b", "<HEX>"),
        spec("num", r"\b\d+(?:\.\d+)?\b", "<NUM>"),
    ]
}
