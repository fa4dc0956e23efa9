//! One miner shard: a fixed-depth token tree over clusters.
//!
//! Level 1 splits on token count (lines of different length can never
//! share a cluster), level 2 on the first token, and every deeper level
//! is a single wildcard child, so the cluster list effectively hangs off
//! the (length, first-token) pair. When a length group already has
//! `max_children` distinct first tokens, new first tokens route to the
//! shared `<*>` child instead of growing the fan-out.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const WILDCARD: &str = "<*>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub tokens: Vec<String>,
    pub count: u64,
    pub last_used: u64,
}

impl Cluster {
    /// Similarity of a line against this template: the fraction of
    /// positions where the tokens are equal and neither side is the
    /// wildcard. Both token lists must have equal length.
    pub fn similarity(&self, tokens: &[String]) -> f64 {
        if tokens.is_empty() {
            return 0.0;
        }
        let matching = self
            .tokens
            .iter()
            .zip(tokens)
            .filter(|(t, l)| t == l && t.as_str() != WILDCARD)
            .count();
        matching as f64 / tokens.len() as f64
    }

    /// Replace every position that disagrees with the line by `<*>`.
    /// Pre-masked placeholders survive as literal tokens when both sides
    /// carry them.
    pub fn generalize(&mut self, tokens: &[String]) {
        for (slot, token) in self.tokens.iter_mut().zip(tokens) {
            if slot != token && slot != WILDCARD {
                *slot = WILDCARD.to_string();
            }
        }
    }
}

/// Decision computed under the read lock, applied under the write lock.
pub enum Lookup {
    /// Best cluster at the leaf cleared the similarity bar.
    Matched { leaf_key: String, index: usize },
    /// No candidate cleared the bar.
    NoMatch,
}

#[derive(Default)]
pub struct Shard {
    /// token count → first token (or wildcard) → clusters.
    groups: HashMap<usize, HashMap<String, Vec<Cluster>>>,
    cluster_count: usize,
}

impl Shard {
    fn leaf_key<'a>(group: &HashMap<String, Vec<Cluster>>, first: &'a str, max_children: usize) -> &'a str {
        if group.contains_key(first) {
            first
        } else if group.len() >= max_children {
            WILDCARD
        } else {
            first
        }
    }

    /// Find the best-matching cluster for a tokenized, pre-masked line.
    /// Candidates come from the exact first-token leaf and from the
    /// wildcard leaf; ties break toward the most recently used cluster.
    pub fn lookup(&self, tokens: &[String], sim_threshold: f64) -> Lookup {
        let Some(group) = self.groups.get(&tokens.len()) else {
            return Lookup::NoMatch;
        };
        let first = tokens[0].as_str();

        let mut best: Option<(f64, u64, &str, usize)> = None;
        for key in [first, WILDCARD] {
            let Some(clusters) = group.get(key) else { continue };
            for (index, cluster) in clusters.iter().enumerate() {
                let sim = cluster.similarity(tokens);
                let candidate = (sim, cluster.last_used, key, index);
                let better = match best {
                    None => true,
                    Some((best_sim, best_used, _, _)) => {
                        sim > best_sim || (sim == best_sim && cluster.last_used > best_used)
                    }
                };
                if better {
                    best = Some(candidate);
                }
            }
            if key == first && first == WILDCARD {
                break;
            }
        }

        match best {
            Some((sim, _, key, index)) if sim >= sim_threshold => Lookup::Matched {
                leaf_key: key.to_string(),
                index,
            },
            _ => Lookup::NoMatch,
        }
    }

    /// Re-find and update the matched cluster under the write lock. The
    /// shard may have changed between lock drops, so a stale index falls
    /// back to a fresh lookup. Returns the generalized template plus the
    /// pre-generalization template when the match changed it, or None if
    /// the cluster vanished (eviction race) and the caller should insert
    /// instead.
    pub fn apply_match(
        &mut self,
        tokens: &[String],
        leaf_key: &str,
        index: usize,
        sim_threshold: f64,
        tick: u64,
    ) -> Option<(Vec<String>, Option<Vec<String>>)> {
        let valid = self
            .groups
            .get(&tokens.len())
            .and_then(|g| g.get(leaf_key))
            .and_then(|c| c.get(index))
            .is_some_and(|c| c.similarity(tokens) >= sim_threshold);

        let (leaf_key, index) = if valid {
            (leaf_key.to_string(), index)
        } else {
            match self.lookup(tokens, sim_threshold) {
                Lookup::Matched { leaf_key, index } => (leaf_key, index),
                Lookup::NoMatch => return None,
            }
        };

        let cluster = self
            .groups
            .get_mut(&tokens.len())
            .and_then(|g| g.get_mut(&leaf_key))
            .and_then(|c| c.get_mut(index))?;
        let before = cluster.tokens.clone();
        cluster.generalize(tokens);
        cluster.count += 1;
        cluster.last_used = tick;
        let previous = (before != cluster.tokens).then_some(before);
        Some((cluster.tokens.clone(), previous))
    }

    /// Insert a brand-new cluster whose template equals the line. Returns
    /// the number of clusters evicted to stay under `max_clusters`.
    pub fn insert(
        &mut self,
        tokens: Vec<String>,
        max_children: usize,
        max_clusters: usize,
        tick: u64,
    ) -> usize {
        let mut evicted = 0;
        while self.cluster_count >= max_clusters {
            if !self.evict_lru() {
                break;
            }
            evicted += 1;
        }

        let group = self.groups.entry(tokens.len()).or_default();
        let key = Self::leaf_key(group, tokens[0].as_str(), max_children).to_string();
        group.entry(key).or_default().push(Cluster {
            tokens,
            count: 1,
            last_used: tick,
        });
        self.cluster_count += 1;
        evicted
    }

    fn evict_lru(&mut self) -> bool {
        let mut victim: Option<(usize, String, usize, u64)> = None;
        for (&len, group) in &self.groups {
            for (key, clusters) in group {
                for (index, cluster) in clusters.iter().enumerate() {
                    if victim.as_ref().is_none_or(|(_, _, _, used)| cluster.last_used < *used) {
                        victim = Some((len, key.clone(), index, cluster.last_used));
                    }
                }
            }
        }
        let Some((len, key, index, _)) = victim else {
            return false;
        };
        let group = self.groups.get_mut(&len).unwrap();
        let clusters = group.get_mut(&key).unwrap();
        clusters.remove(index);
        if clusters.is_empty() {
            group.remove(&key);
        }
        if group.is_empty() {
            self.groups.remove(&len);
        }
        self.cluster_count -= 1;
        true
    }

    pub fn clusters(&self) -> Vec<Cluster> {
        let mut out: Vec<Cluster> = self
            .groups
            .values()
            .flat_map(|g| g.values())
            .flatten()
            .cloned()
            .collect();
        // Deterministic snapshot order.
        out.sort_by(|a, b| a.tokens.cmp(&b.tokens));
        out
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    /// Deterministic rebuild from a snapshot's cluster list.
    pub fn restore(clusters: Vec<Cluster>, max_children: usize) -> Shard {
        let mut shard = Shard::default();
        for cluster in clusters {
            if cluster.tokens.is_empty() {
                continue;
            }
            let group = shard.groups.entry(cluster.tokens.len()).or_default();
            let key = Self::leaf_key(group, cluster.tokens[0].as_str(), max_children).to_string();
            group.entry(key).or_default().push(cluster);
            shard.cluster_count += 1;
        }
        shard
    }
}
