//! Tablet ownership and recovery partitioning.
//!
//! A tablet is a contiguous range of key hashes within one table. During
//! recovery the coordinator groups the crashed master's tablets into
//! partitions, one per recovery master, and ships the grouping to every
//! backup so each can split its replicas accordingly.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A contiguous, inclusive range of key hashes within one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub table_id: u64,
    pub first_key_hash: u64,
    pub last_key_hash: u64,
}

impl Tablet {
    pub fn new(table_id: u64, first_key_hash: u64, last_key_hash: u64) -> Self {
        Self {
            table_id,
            first_key_hash,
            last_key_hash,
        }
    }

    pub fn contains(&self, table_id: u64, key_hash: u64) -> bool {
        self.table_id == table_id
            && self.first_key_hash <= key_hash
            && key_hash <= self.last_key_hash
    }
}

/// The set of tablets assigned to a single recovery master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    tablets: Vec<Tablet>,
}

impl Partition {
    pub fn new(tablets: Vec<Tablet>) -> Self {
        Self { tablets }
    }

    pub fn contains(&self, table_id: u64, key_hash: u64) -> bool {
        self.tablets
            .iter()
            .any(|tablet| tablet.contains(table_id, key_hash))
    }

    pub fn tablets(&self) -> &[Tablet] {
        &self.tablets
    }
}

/// An ordered list of partitions; the index is the partition id carried
/// in getRecoveryData requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partitioning {
    partitions: Vec<Partition>,
}

impl Partitioning {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self { partitions }
    }

    pub fn partition(&self, index: usize) -> Result<&Partition> {
        self.partitions.get(index).ok_or_else(|| {
            Error::BadRequest(format!(
                "partition index {} out of range ({} partitions)",
                index,
                self.partitions.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Serialized form carried in the StartReadingData request payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tablet_bounds_are_inclusive() {
        let tablet = Tablet::new(1, 100, 200);
        assert!(tablet.contains(1, 100));
        assert!(tablet.contains(1, 200));
        assert!(!tablet.contains(1, 99));
        assert!(!tablet.contains(1, 201));
        assert!(!tablet.contains(2, 150));
    }

    #[test]
    fn test_partition_matches_any_tablet() {
        let partition =
            Partition::new(vec![Tablet::new(1, 0, 500), Tablet::new(2, 1000, 2000)]);
        assert!(partition.contains(1, 250));
        assert!(partition.contains(2, 1500));
        assert!(!partition.contains(1, 501));
        assert!(!partition.contains(3, 0));
    }

    #[test]
    fn test_partitioning_round_trip() {
        let partitioning = Partitioning::new(vec![
            Partition::new(vec![Tablet::new(1, 0, 500)]),
            Partition::new(vec![Tablet::new(1, 501, 1000)]),
        ]);

        let bytes = partitioning.encode().unwrap();
        let decoded = Partitioning::decode(&bytes).unwrap();
        assert_eq!(decoded, partitioning);
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn test_partition_index_out_of_range() {
        let partitioning =
            Partitioning::new(vec![Partition::new(vec![Tablet::new(1, 0, u64::MAX)])]);
        assert!(partitioning.partition(0).is_ok());
        assert!(matches!(
            partitioning.partition(1),
            Err(Error::BadRequest(_))
        ));
    }
}
