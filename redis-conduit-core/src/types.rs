//! Common types used throughout the library

use serde::{Deserialize, Serialize};

/// Total number of hash slots in Redis Cluster
pub const CLUSTER_SLOTS: u16 = 16384;

/// Highest valid slot index
pub const MAX_SLOT: u16 = CLUSTER_SLOTS - 1;

/// Represents a slot range in a Redis cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
}

impl SlotRange {
    /// Create a new slot range
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Check if a slot is within this range
    #[must_use]
    pub const fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Whether `start <= end <= 16383`
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.start <= self.end && self.end <= MAX_SLOT
    }

    /// Number of slots covered
    #[must_use]
    pub const fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    /// Whether the range covers no slots
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Node information in a Redis cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Cluster node ID, when the topology reply carried one
    pub id: Option<String>,
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Slot ranges owned by this node
    pub slots: Vec<SlotRange>,
    /// Whether this is a master node
    pub is_master: bool,
}

impl NodeInfo {
    /// Create a new master node info
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: None,
            host: host.into(),
            port,
            slots: Vec::new(),
            is_master: true,
        }
    }

    /// `host:port` identifier used as a map key by the routers
    #[must_use]
    pub fn address(&self) -> String {
        node_address(&self.host, self.port)
    }

    /// Check if this node owns a given slot
    #[must_use]
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slots.iter().any(|range| range.contains(slot))
    }
}

/// Format a `host:port` identifier, bracketing IPv6 literals
#[must_use]
pub fn node_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
