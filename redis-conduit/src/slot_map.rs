//! Slot to node assignments for Redis Cluster

use redis_conduit_core::{
    error::{RedisError, RedisResult},
    types::{SlotRange, CLUSTER_SLOTS, MAX_SLOT},
};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Fixed table of 16384 optional node identifiers
#[derive(Clone)]
pub struct SlotMap {
    slots: Box<[Option<Arc<str>>]>,
    assigned: usize,
}

impl SlotMap {
    /// Map with every slot unassigned
    pub fn new() -> Self {
        Self {
            slots: vec![None; CLUSTER_SLOTS as usize].into_boxed_slice(),
            assigned: 0,
        }
    }

    /// Assign the inclusive range `first..=last` to `node`
    ///
    /// Overwrites whatever owned those slots before.
    pub fn set_slots(&mut self, first: u16, last: u16, node: &str) -> RedisResult<()> {
        let range = SlotRange::new(first, last);
        if !range.is_valid() {
            return Err(RedisError::Cluster(format!(
                "invalid slot range {first}-{last} (must satisfy 0 <= first <= last <= {MAX_SLOT})"
            )));
        }
        let node: Arc<str> = Arc::from(node);
        for slot in &mut self.slots[first as usize..=last as usize] {
            if slot.is_none() {
                self.assigned += 1;
            }
            *slot = Some(node.clone());
        }
        Ok(())
    }

    /// Assign a single slot; out-of-range slots are an error
    pub fn set(&mut self, slot: u16, node: &str) -> RedisResult<()> {
        if slot > MAX_SLOT {
            return Err(RedisError::Cluster(format!(
                "slot {slot} out of range 0-{MAX_SLOT}"
            )));
        }
        let entry = &mut self.slots[slot as usize];
        if entry.is_none() {
            self.assigned += 1;
        }
        *entry = Some(Arc::from(node));
        Ok(())
    }

    /// Owner of a slot, `None` when unassigned or out of range
    pub fn get(&self, slot: u16) -> Option<&str> {
        self.slots.get(slot as usize)?.as_deref()
    }

    /// Owners of every slot in `range`, unassigned slots included
    pub fn get_slots(&self, range: SlotRange) -> RedisResult<Vec<(u16, Option<&str>)>> {
        if !range.is_valid() {
            return Err(RedisError::Cluster(format!(
                "invalid slot range {}-{}",
                range.start, range.end
            )));
        }
        Ok((range.start..=range.end)
            .map(|slot| (slot, self.get(slot)))
            .collect())
    }

    /// Number of assigned slots
    pub fn count(&self) -> usize {
        self.assigned
    }

    /// Whether no slot is assigned
    pub fn is_empty(&self) -> bool {
        self.assigned == 0
    }

    /// Whether all 16384 slots are assigned
    pub fn is_complete(&self) -> bool {
        self.assigned == CLUSTER_SLOTS as usize
    }

    /// Clear every assignment
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.assigned = 0;
    }

    /// Distinct nodes owning at least one slot
    pub fn nodes(&self) -> BTreeSet<&str> {
        self.slots.iter().flatten().map(|node| &**node).collect()
    }

    /// Contiguous ranges owned by each node, in slot order
    pub fn ranges(&self) -> Vec<(SlotRange, &str)> {
        let mut ranges: Vec<(SlotRange, &str)> = Vec::new();
        for (slot, owner) in self.slots.iter().enumerate() {
            let Some(owner) = owner.as_deref() else {
                continue;
            };
            let slot = slot as u16;
            match ranges.last_mut() {
                Some((range, node)) if *node == owner && range.end + 1 == slot => {
                    range.end = slot;
                }
                _ => ranges.push((SlotRange::new(slot, slot), owner)),
            }
        }
        ranges
    }
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SlotMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotMap")
            .field("assigned", &self.assigned)
            .field("ranges", &self.ranges())
            .finish()
    }
}
