use std::path::PathBuf;

/// Which backend closed segments are persisted to.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    /// Volatile in-memory extents. Replicas do not survive a restart.
    Memory,
    /// A single pre-sized extent file on block storage.
    Disk { path: PathBuf },
}

/// Configuration for the backup server
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Locator of the cluster coordinator (default: "coordinator:11100")
    pub coordinator_locator: String,

    /// Locator masters use to reach this backup (default: "backup:11101")
    pub local_locator: String,

    /// Uniform size of every segment replica (default: 8MB)
    pub segment_size: usize,

    /// Number of aligned staging buffers in the pool (default: 16)
    pub pool_capacity: usize,

    /// Number of on-storage extents (default: 64)
    pub extent_count: usize,

    /// Where closed segments are persisted (default: Memory)
    pub backend: StorageBackend,

    /// Open the extent file with O_DIRECT (default: false)
    pub direct_io: bool,

    /// Concurrent dispatch workers (default: 4)
    pub workers: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            coordinator_locator: "coordinator:11100".to_string(),
            local_locator: "backup:11101".to_string(),
            segment_size: 8 * 1024 * 1024, // 8MB
            pool_capacity: 16,
            extent_count: 64,
            backend: StorageBackend::Memory,
            direct_io: false,
            workers: 4,
        }
    }
}

impl BackupConfig {
    /// Create a new config with the given locators
    pub fn new(coordinator: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            coordinator_locator: coordinator.into(),
            local_locator: local.into(),
            ..Default::default()
        }
    }

    /// Set the segment size
    pub fn segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the staging pool capacity
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Set the number of storage extents
    pub fn extent_count(mut self, count: usize) -> Self {
        self.extent_count = count;
        self
    }

    /// Select the storage backend
    pub fn backend(mut self, backend: StorageBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Enable direct I/O for the extent file
    pub fn direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }

    /// Set the dispatch worker count
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}
