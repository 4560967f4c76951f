//! Registry of every replica this backup is tracking.
//!
//! Keys are `(master_id, segment_id)` pairs over a concurrent ordered
//! map, so lookups and per-master range scans proceed without blocking
//! each other. A small structural mutex serializes insertion and removal
//! only, ensuring the fallible segment factory runs at most once per key.

use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::segment::Segment;

pub type SegmentKey = (u64, u64);

pub struct SegmentRegistry {
    map: SkipMap<SegmentKey, Arc<Segment>>,
    structural: Mutex<()>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            structural: Mutex::new(()),
        }
    }

    pub fn find(&self, master_id: u64, segment_id: u64) -> Option<Arc<Segment>> {
        self.map
            .get(&(master_id, segment_id))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the segment under the key, creating it with `factory` when
    /// absent. A factory failure leaves the registry unchanged.
    pub fn insert_if_absent(
        &self,
        master_id: u64,
        segment_id: u64,
        factory: impl FnOnce() -> Result<Segment>,
    ) -> Result<Arc<Segment>> {
        let _guard = self.structural.lock()?;
        let key = (master_id, segment_id);
        if let Some(entry) = self.map.get(&key) {
            return Ok(Arc::clone(entry.value()));
        }
        let segment = Arc::new(factory()?);
        self.map.insert(key, Arc::clone(&segment));
        Ok(segment)
    }

    /// Removes the entry; the segment itself lives on while callers hold
    /// clones.
    pub fn remove(&self, master_id: u64, segment_id: u64) -> Result<()> {
        let _guard = self.structural.lock()?;
        self.map.remove(&(master_id, segment_id));
        Ok(())
    }

    /// A stable snapshot of the master's segments, ordered by segment id.
    pub fn iterate_by_master(&self, master_id: u64) -> Vec<Arc<Segment>> {
        self.map
            .range((master_id, 0)..=(master_id, u64::MAX))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn contains(&self, master_id: u64, segment_id: u64) -> bool {
        self.map.contains_key(&(master_id, segment_id))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Every tracked segment, for shutdown teardown.
    pub fn all(&self) -> Vec<Arc<Segment>> {
        self.map
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
