//! Weighted consistent hashing for client-side sharding
//!
//! Ketama-style: every node contributes `weight * replicas_per_weight` points,
//! derived four at a time from the MD5 digest of `"{node}-{i}"`, where `i`
//! counts digests (not points) from zero. A key maps to
//! the first point at or after its own hash, wrapping around to the smallest
//! point. Adding or removing a node only remaps the keys that land on its
//! points.

use redis_conduit_core::{
    config::MAX_NODE_WEIGHT,
    error::{RedisError, RedisResult},
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Points per unit of weight
pub const DEFAULT_REPLICAS_PER_WEIGHT: usize = 128;

/// Upper bound on the points a single node may place on the ring
pub const MAX_POINTS_PER_NODE: usize = 1 << 20;

/// Consistent hash ring over node identifiers
#[derive(Debug, Clone)]
pub struct HashRing {
    replicas_per_weight: usize,
    nodes: BTreeMap<Arc<str>, u32>,
    /// Sorted by (hash, node)
    points: Vec<(u32, Arc<str>)>,
}

impl HashRing {
    /// Empty ring with [`DEFAULT_REPLICAS_PER_WEIGHT`]
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_REPLICAS_PER_WEIGHT)
    }

    /// Empty ring placing `replicas_per_weight` points per unit of weight
    pub fn with_replicas(replicas_per_weight: usize) -> Self {
        Self {
            replicas_per_weight: replicas_per_weight.max(1),
            nodes: BTreeMap::new(),
            points: Vec::new(),
        }
    }

    /// Hash a key the way the ring positions its points
    #[inline]
    pub fn hash(key: &[u8]) -> u32 {
        let digest = md5::compute(key);
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Add a node, replacing its points if it is already on the ring
    ///
    /// Weights outside `1..=MAX_NODE_WEIGHT`, or a point count above
    /// [`MAX_POINTS_PER_NODE`], are rejected before the ring is touched.
    pub fn add(&mut self, node: &str, weight: u32) -> RedisResult<()> {
        if weight == 0 || weight > MAX_NODE_WEIGHT {
            return Err(RedisError::Config(format!(
                "weight of node {node} must be between 1 and {MAX_NODE_WEIGHT}, got {weight}"
            )));
        }
        let total = (weight as usize)
            .checked_mul(self.replicas_per_weight)
            .filter(|total| *total <= MAX_POINTS_PER_NODE)
            .ok_or_else(|| {
                RedisError::Config(format!(
                    "node {node} would place more than {MAX_POINTS_PER_NODE} points on the ring"
                ))
            })?;
        self.remove(node);

        let node: Arc<str> = Arc::from(node);
        self.points.reserve(total);

        let mut added = 0;
        for i in 0..total.div_ceil(4) {
            let digest = md5::compute(format!("{node}-{i}"));
            for chunk in digest.0.chunks_exact(4) {
                if added == total {
                    break;
                }
                let hash = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                self.points.push((hash, node.clone()));
                added += 1;
            }
        }

        self.points.sort_unstable();
        self.points.dedup();
        self.nodes.insert(node, weight);
        Ok(())
    }

    /// Remove a node and all of its points, returning whether it was present
    pub fn remove(&mut self, node: &str) -> bool {
        if self.nodes.remove(node).is_none() {
            return false;
        }
        self.points.retain(|(_, owner)| &**owner != node);
        true
    }

    /// Node owning `key`
    pub fn get(&self, key: &[u8]) -> RedisResult<&str> {
        self.get_by_hash(Self::hash(key))
    }

    /// Node owning the first point at or after `hash`, wrapping around
    pub fn get_by_hash(&self, hash: u32) -> RedisResult<&str> {
        if self.points.is_empty() {
            return Err(RedisError::Routing(
                "cannot look up a key on an empty hash ring".to_string(),
            ));
        }
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Ok(&self.points[idx].1)
    }

    /// Whether `node` is on the ring
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Weight a node was added with
    pub fn weight(&self, node: &str) -> Option<u32> {
        self.nodes.get(node).copied()
    }

    /// Node identifiers, in sorted order
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|node| &**node)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the ring has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total number of points on the ring
    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}
