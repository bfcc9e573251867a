// src/coordinator/partition.rs

//! Partition-key → node mapping.
//!
//! Every strategy picks from the caller's candidate list (routable nodes,
//! sorted by id). The consistent ring also remembers every registered node so
//! that losing one only moves the keys it owned.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};
use thiserror::Error;
use twox_hash::XxHash64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} strategy '{value}'")]
pub struct UnknownStrategy {
    pub kind:  &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    Hash,
    ConsistentHash,
    RoundRobin,
    Weighted,
}

impl FromStr for PartitionStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "hash" => Ok(Self::Hash),
            "consistent-hash" | "consistent" => Ok(Self::ConsistentHash),
            "round-robin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            _ => Err(UnknownStrategy { kind: "partition", value: s.into() }),
        }
    }
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hash => "hash",
            Self::ConsistentHash => "consistent-hash",
            Self::RoundRobin => "round-robin",
            Self::Weighted => "weighted",
        })
    }
}

pub(crate) fn hash_key(key: &str) -> u64 {
    XxHash64::oneshot(0, key.as_bytes())
}

pub trait Partitioner: Send + Sync {
    fn add_node(&mut self, id: &str, weight: u32);

    fn remove_node(&mut self, id: &str);

    /// Pick one of `candidates` for `key`; `None` only when none fit.
    fn select<'a>(&self, key: &str, candidates: &[&'a str]) -> Option<&'a str>;
}

pub fn partitioner(strategy: PartitionStrategy, replication: usize) -> Box<dyn Partitioner> {
    match strategy {
        PartitionStrategy::Hash => Box::new(HashPartitioner),
        PartitionStrategy::ConsistentHash => Box::new(ConsistentHashRing::new(replication)),
        PartitionStrategy::RoundRobin => Box::new(RoundRobinPartitioner::default()),
        PartitionStrategy::Weighted => Box::new(WeightedPartitioner::default()),
    }
}

/*──────────────────────────────── modulo ────────────────────────────────*/

pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn add_node(&mut self, _: &str, _: u32) {}
    fn remove_node(&mut self, _: &str) {}

    fn select<'a>(&self, key: &str, candidates: &[&'a str]) -> Option<&'a str> {
        if candidates.is_empty() {
            return None;
        }
        let i = (hash_key(key) % candidates.len() as u64) as usize;
        Some(candidates[i])
    }
}

#[derive(Default)]
pub struct RoundRobinPartitioner {
    next: AtomicUsize,
}

impl Partitioner for RoundRobinPartitioner {
    fn add_node(&mut self, _: &str, _: u32) {}
    fn remove_node(&mut self, _: &str) {}

    fn select<'a>(&self, _key: &str, candidates: &[&'a str]) -> Option<&'a str> {
        if candidates.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[i])
    }
}

/// Deterministic per key, proportional to node weight.
#[derive(Default)]
pub struct WeightedPartitioner {
    weights: HashMap<String, u32>,
}

impl Partitioner for WeightedPartitioner {
    fn add_node(&mut self, id: &str, weight: u32) {
        self.weights.insert(id.into(), weight.max(1));
    }

    fn remove_node(&mut self, id: &str) {
        self.weights.remove(id);
    }

    fn select<'a>(&self, key: &str, candidates: &[&'a str]) -> Option<&'a str> {
        let weight = |id: &str| u64::from(self.weights.get(id).copied().unwrap_or(1));
        let total: u64 = candidates.iter().map(|c| weight(c)).sum();
        if total == 0 {
            return None;
        }
        let mut point = hash_key(key) % total;
        for c in candidates {
            let w = weight(c);
            if point < w {
                return Some(*c);
            }
            point -= w;
        }
        candidates.last().copied()
    }
}

/*──────────────────────────────── ring ────────────────────────────────*/

/// Consistent-hash ring with `replicas × weight` virtual points per node.
pub struct ConsistentHashRing {
    replicas: usize,
    ring:     Vec<(u64, String)>,
}

impl ConsistentHashRing {
    pub fn new(replicas: usize) -> Self {
        Self { replicas: replicas.max(1), ring: Vec::new() }
    }

    pub fn points(&self) -> usize {
        self.ring.len()
    }

    /// Owner of `key` among every node on the ring.
    pub fn owner(&self, key: &str) -> Option<&str> {
        let start = self.start(key)?;
        Some(&self.ring[start].1)
    }

    fn start(&self, key: &str) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }
        let h = hash_key(key);
        Some(self.ring.partition_point(|(p, _)| *p < h) % self.ring.len())
    }
}

impl Partitioner for ConsistentHashRing {
    fn add_node(&mut self, id: &str, weight: u32) {
        self.remove_node(id);
        let points = self.replicas * weight.max(1) as usize;
        for i in 0..points {
            self.ring.push((hash_key(&format!("{id}#{i}")), id.to_string()));
        }
        self.ring.sort_unstable();
    }

    fn remove_node(&mut self, id: &str) {
        self.ring.retain(|(_, n)| n != id);
    }

    fn select<'a>(&self, key: &str, candidates: &[&'a str]) -> Option<&'a str> {
        let start = self.start(key)?;
        let len = self.ring.len();
        // clockwise to the first point whose node is available
        (0..len).find_map(|step| {
            let id = &self.ring[(start + step) % len].1;
            candidates.iter().find(|c| **c == id.as_str()).copied()
        })
    }
}
