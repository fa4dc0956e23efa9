//! Online Drain-style log template miner.
//!
//! Converts an unbounded stream of (already pre-masked) log bodies into a
//! bounded set of templates. The miner is an ensemble of independent
//! shards; a line's shard is chosen deterministically from its token
//! count and first token, so every candidate cluster for a line lives in
//! exactly one shard and no operation ever holds two shard locks.

pub mod mask;
mod tree;

use std::hash::Hasher;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::error::{Error, Result};

pub use mask::{MaskSpec, Masker, default_specs};
pub use tree::{Cluster, WILDCARD};
use tree::{Lookup, Shard};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    /// Per-shard cluster cap, enforced by LRU eviction.
    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,
    #[serde(default = "default_sim_threshold")]
    pub sim_threshold: f64,
    /// Split tokens on these characters in addition to whitespace.
    #[serde(default = "default_delimiters")]
    pub extra_delimiters: String,
    /// Training mode creates clusters for unmatched lines; inference
    /// mode reports them as unmatched.
    #[serde(default = "default_training")]
    pub training: bool,
}

fn default_shards() -> usize {
    4
}
fn default_max_depth() -> usize {
    4
}
fn default_max_children() -> usize {
    100
}
fn default_max_clusters() -> usize {
    1024
}
fn default_sim_threshold() -> f64 {
    0.5
}
fn default_delimiters() -> String {
    r#":=/[](),""#.to_string()
}
fn default_training() -> bool {
    true
}

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            shards: default_shards(),
            max_depth: default_max_depth(),
            max_children: default_max_children(),
            max_clusters: default_max_clusters(),
            sim_threshold: default_sim_threshold(),
            extra_delimiters: default_delimiters(),
            training: default_training(),
        }
    }
}

/// Result of feeding one body through the miner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MineOutcome {
    /// Generalized template, tokens joined by single spaces.
    pub template: String,
    /// Whether the line matched a pre-existing cluster.
    pub matched: bool,
    /// The cluster's template before this line generalized it, so
    /// downstream accumulators can re-key their per-template state.
    pub previous_template: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MinerSnapshot {
    pub version: u32,
    pub shards: Vec<ShardSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub clusters: Vec<Cluster>,
}

pub struct TemplateMiner {
    config: MinerConfig,
    shards: Vec<RwLock<Shard>>,
    /// Monotonic recency tick; a total order for LRU that stays
    /// deterministic across snapshot/restore.
    clock: AtomicU64,
    evictions: AtomicU64,
}

impl TemplateMiner {
    pub fn new(config: MinerConfig) -> Result<Self> {
        if config.shards == 0 {
            return Err(Error::InvalidInput("miner.shards must be at least 1".into()));
        }
        if config.max_depth < 3 {
            return Err(Error::InvalidInput("miner.max_depth must be at least 3".into()));
        }
        if !(0.0..=1.0).contains(&config.sim_threshold) {
            return Err(Error::InvalidInput(
                "miner.sim_threshold must be within [0, 1]".into(),
            ));
        }
        let shards = (0..config.shards).map(|_| RwLock::new(Shard::default())).collect();
        Ok(TemplateMiner {
            config,
            shards,
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    /// Split on whitespace plus the configured delimiter set. Adjacent
    /// delimiters never produce empty tokens.
    pub fn tokenize(&self, body: &str) -> Vec<String> {
        body.split(|c: char| c.is_whitespace() || self.config.extra_delimiters.contains(c))
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn shard_index(&self, token_count: usize, first_token: &str) -> usize {
        let mut hasher = XxHash64::with_seed(token_count as u64);
        hasher.write(first_token.as_bytes());
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Feed one pre-masked body through the miner. Returns the template
    /// the line matched (or created), or None when the body has no tokens
    /// or inference mode finds no match.
    pub fn process(&self, body: &str) -> Option<MineOutcome> {
        let tokens = self.tokenize(body);
        if tokens.is_empty() {
            return None;
        }
        let shard = &self.shards[self.shard_index(tokens.len(), &tokens[0])];

        // Locate under the read lock, then upgrade by drop-and-reacquire;
        // the write path re-validates because the shard may have moved.
        let candidate = {
            let guard = shard.read().unwrap_or_else(|e| e.into_inner());
            guard.lookup(&tokens, self.config.sim_threshold)
        };

        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut guard = shard.write().unwrap_or_else(|e| e.into_inner());

        let applied = if let Lookup::Matched { leaf_key, index } = candidate {
            guard.apply_match(&tokens, &leaf_key, index, self.config.sim_threshold, tick)
        } else {
            // A writer may have created a matching cluster between the
            // two locks; re-check before deciding to insert.
            guard.apply_match(&tokens, WILDCARD, usize::MAX, self.config.sim_threshold, tick)
        };
        if let Some((template, previous)) = applied {
            return Some(MineOutcome {
                template: template.join(" "),
                matched: true,
                previous_template: previous.map(|t| t.join(" ")),
            });
        }

        if !self.config.training {
            return None;
        }

        let template = tokens.join(" ");
        let evicted = guard.insert(
            tokens,
            self.config.max_children,
            self.config.max_clusters,
            tick,
        );
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!("miner shard evicted {evicted} cluster(s) at LRU cap");
        }
        Some(MineOutcome {
            template,
            matched: false,
            previous_template: None,
        })
    }

    pub fn total_clusters(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).cluster_count())
            .sum()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MinerSnapshot {
        MinerSnapshot {
            version: SNAPSHOT_VERSION,
            shards: self
                .shards
                .iter()
                .map(|s| ShardSnapshot {
                    clusters: s.read().unwrap_or_else(|e| e.into_inner()).clusters(),
                })
                .collect(),
        }
    }

    /// Rebuild a miner from a snapshot. The shard layout must match the
    /// configured shard count; the recency clock resumes past the newest
    /// restored tick.
    pub fn restore(config: MinerConfig, snapshot: MinerSnapshot) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Format(format!(
                "unknown miner snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.shards.len() != config.shards {
            return Err(Error::Format(format!(
                "snapshot has {} shards, config wants {}",
                snapshot.shards.len(),
                config.shards
            )));
        }
        let max_tick = snapshot
            .shards
            .iter()
            .flat_map(|s| &s.clusters)
            .map(|c| c.last_used)
            .max()
            .unwrap_or(0);
        let max_children = config.max_children;
        let shards = snapshot
            .shards
            .into_iter()
            .map(|s| RwLock::new(Shard::restore(s.clusters, max_children)))
            .collect();
        Ok(TemplateMiner {
            config,
            shards,
            clock: AtomicU64::new(max_tick),
            evictions: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn miner(config: MinerConfig) -> TemplateMiner {
        TemplateMiner::new(config).unwrap()
    }

    fn training_miner() -> TemplateMiner {
        miner(MinerConfig::default())
    }

    #[test]
    fn tokenize_drops_adjacent_delimiters() {
        let m = training_miner();
        assert_eq!(
            m.tokenize("key=value [worker] (idle),, done"),
            ["key", "value", "worker", "idle", "done"]
        );
        assert!(m.tokenize("  :=[]  ").is_empty());
    }

    #[test]
    fn first_line_creates_cluster_second_generalizes() {
        let m = training_miner();
        let masker = Masker::with_defaults();

        let first = m.process(&masker.mask("user john logged in from 1.2.3.4")).unwrap();
        assert!(!first.matched);
        assert_eq!(first.template, "user john logged in from <IP>");
        assert_eq!(m.total_clusters(), 1);

        let second = m.process(&masker.mask("user jane logged in from 5.6.7.8")).unwrap();
        assert!(second.matched);
        assert_eq!(second.template, "user <*> logged in from <IP>");
        assert_eq!(
            second.previous_template.as_deref(),
            Some("user john logged in from <IP>")
        );
        assert_eq!(m.total_clusters(), 1);

        // A third line matching the settled template reports no rename.
        let third = m.process(&masker.mask("user mary logged in from 9.9.9.9")).unwrap();
        assert!(third.matched);
        assert_eq!(third.previous_template, None);
    }

    #[test]
    fn different_lengths_never_share_a_cluster() {
        let m = training_miner();
        m.process("cache warmed in 5 steps").unwrap();
        let other = m.process("cache warmed").unwrap();
        assert!(!other.matched);
        assert_eq!(m.total_clusters(), 2);
    }

    #[test]
    fn low_similarity_line_creates_new_cluster() {
        let m = miner(MinerConfig {
            sim_threshold: 0.7,
            ..MinerConfig::default()
        });
        m.process("alpha beta gamma delta").unwrap();
        let out = m.process("alpha nine eight seven").unwrap();
        assert!(!out.matched, "0.25 similarity must not clear a 0.7 bar");
        assert_eq!(m.total_clusters(), 2);
    }

    #[test]
    fn inference_mode_never_creates_clusters() {
        let m = miner(MinerConfig {
            training: false,
            ..MinerConfig::default()
        });
        assert!(m.process("completely novel line").is_none());
        assert_eq!(m.total_clusters(), 0);
    }

    #[test]
    fn inference_is_deterministic_for_fixed_clusters() {
        let trained = training_miner();
        trained.process("worker 1 started on host a").unwrap();
        trained.process("worker 2 started on host b").unwrap();
        let snapshot = trained.snapshot();

        let config = MinerConfig {
            training: false,
            ..MinerConfig::default()
        };
        let snap_json = serde_json::to_string(&snapshot).unwrap();
        let a = TemplateMiner::restore(config.clone(), serde_json::from_str(&snap_json).unwrap())
            .unwrap();
        let b = TemplateMiner::restore(config, serde_json::from_str(&snap_json).unwrap()).unwrap();

        for input in ["worker 7 started on host z", "worker 1 started on host a"] {
            assert_eq!(a.process(input), b.process(input), "input {input:?}");
        }
    }

    #[test]
    fn lru_eviction_bounds_clusters_and_counts() {
        let m = miner(MinerConfig {
            shards: 1,
            max_clusters: 8,
            ..MinerConfig::default()
        });
        for i in 0..32 {
            // Each line is dissimilar enough to start its own cluster.
            m.process(&format!("evt{i} unique{i} payload{i}")).unwrap();
        }
        assert!(m.total_clusters() <= 8);
        assert_eq!(m.evictions(), 24);
    }

    #[test]
    fn snapshot_roundtrip_preserves_templates() {
        let m = training_miner();
        m.process("disk sda is full").unwrap();
        m.process("disk sdb is full").unwrap();
        let snapshot = m.snapshot();
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);

        let restored = TemplateMiner::restore(MinerConfig::default(), snapshot).unwrap();
        assert_eq!(restored.total_clusters(), 1);
        let out = restored.process("disk sdc is full").unwrap();
        assert!(out.matched);
        assert_eq!(out.template, "disk <*> is full");
    }

    #[test]
    fn restore_rejects_unknown_version_and_shard_mismatch() {
        let snapshot = MinerSnapshot {
            version: 99,
            shards: vec![],
        };
        assert!(TemplateMiner::restore(MinerConfig::default(), snapshot).is_err());

        let snapshot = MinerSnapshot {
            version: SNAPSHOT_VERSION,
            shards: vec![ShardSnapshot { clusters: vec![] }],
        };
        let config = MinerConfig {
            shards: 4,
            ..MinerConfig::default()
        };
        assert!(TemplateMiner::restore(config, snapshot).is_err());
    }

    #[test]
    fn premasked_placeholders_stay_literal_in_new_clusters() {
        let m = training_miner();
        let out = m.process("request from <IP> took <DURATION>").unwrap();
        assert_eq!(out.template, "request from <IP> took <DURATION>");
    }
}
