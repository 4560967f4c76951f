//! Recovery-read pipeline.
//!
//! When a master crashes, the coordinator partitions its tablets among
//! recovery masters and asks every backup holding replicas to serve them
//! back, filtered per partition:
//!
//! ```text
//!  startReadingData(master, partitioning)
//!      │  snapshot the master's segments, fan out storage reads
//!      ▼
//!  [segment ids] ──► recovery masters issue, per segment:
//!                      getRecoveryData(master, segment, partition)
//!                          │  block on the load, filter entries
//!                          ▼
//!                      filtered entry bytes
//! ```
//!
//! The first phase never blocks on I/O; it only snapshots the registry
//! and dispatches loads so they overlap. The second phase synchronizes on
//! each segment's buffer as it is asked for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::log::{self, Partitioning};
use crate::registry::SegmentRegistry;
use crate::segment::SegmentState;

/// One partition's worth of a segment's entries.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryData {
    /// Filtered entries, framing preserved.
    pub entries: Vec<u8>,
    /// Whether further entries remain beyond this response. Responses
    /// are currently unchunked, so this is always false; the field keeps
    /// the wire contract explicit for callers that iterate until clear.
    pub more_entries: bool,
}

pub struct RecoveryReader {
    registry: Arc<SegmentRegistry>,
    partitionings: Mutex<HashMap<u64, Partitioning>>,
}

impl RecoveryReader {
    pub fn new(registry: Arc<SegmentRegistry>) -> Self {
        Self {
            registry,
            partitionings: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot the master's open and closed segments, dispatch loads for
    /// everything persisted, and return the segment ids without waiting
    /// for any read to finish.
    pub fn start_reading_data(
        &self,
        master_id: u64,
        partitioning: Partitioning,
    ) -> Result<Vec<u64>> {
        let mut segment_ids = Vec::new();

        for segment in self.registry.iterate_by_master(master_id) {
            match segment.state() {
                SegmentState::Open => segment_ids.push(segment.segment_id()),
                SegmentState::Closed => {
                    // A failed hint is not fatal; getRecoveryData falls
                    // back to an inline load.
                    if let Err(e) = segment.start_loading() {
                        tracing::warn!(
                            master_id,
                            segment_id = segment.segment_id(),
                            error = %e,
                            "could not dispatch segment load"
                        );
                    }
                    segment_ids.push(segment.segment_id());
                }
                SegmentState::Uninit | SegmentState::Freed => {}
            }
        }

        tracing::info!(
            master_id,
            segments = segment_ids.len(),
            partitions = partitioning.len(),
            "started reading segments for recovery"
        );
        self.partitionings.lock()?.insert(master_id, partitioning);

        Ok(segment_ids)
    }

    /// Serve one segment's entries for one partition, blocking on the
    /// segment's load if it is still in flight.
    ///
    /// Output is byte-deterministic for a given `(segment, partition)`,
    /// so recovery masters may retry idempotently.
    pub fn get_recovery_data(
        &self,
        master_id: u64,
        segment_id: u64,
        partition_index: usize,
    ) -> Result<RecoveryData> {
        // Clone the partition out so the table lock is not held across
        // the blocking buffer read below.
        let partition = {
            let partitionings = self.partitionings.lock()?;
            let partitioning = partitionings.get(&master_id).ok_or_else(|| {
                Error::BadRequest(format!(
                    "no recovery in progress for master {}",
                    master_id
                ))
            })?;
            partitioning.partition(partition_index)?.clone()
        };

        let segment = self
            .registry
            .find(master_id, segment_id)
            .ok_or(Error::SegmentUnavailable)?;

        let entries = segment
            .with_buffer(|buf| log::filter_entries(buf, &partition))
            .map_err(|e| match e {
                // One unreadable replica only costs that replica; the
                // recovery carries on from other backups.
                Error::StorageIo(msg) => {
                    tracing::warn!(
                        master_id,
                        segment_id,
                        error = %msg,
                        "storage failed while loading segment for recovery"
                    );
                    Error::SegmentUnavailable
                }
                Error::SegmentFreed => Error::SegmentUnavailable,
                other => other,
            })?;

        Ok(RecoveryData {
            entries,
            more_entries: false,
        })
    }

    /// Forget the partitioning registered for a master, once its recovery
    /// completes.
    pub fn finish_recovery(&self, master_id: u64) -> Result<()> {
        self.partitionings.lock()?.remove(&master_id);
        Ok(())
    }
}
