//! Per-replica segment state and lifecycle.
//!
//! Each replica a master ships to this backup is tracked by one
//! [`Segment`], which owns the replica's staging buffer checkout and its
//! storage extent and enforces the legal operation order:
//!
//! ```text
//!          open           close            free
//! UNINIT ───────► OPEN ──────────► CLOSED ──────► FREED
//!                   │                               ▲
//!                   └───────────────────────────────┘
//!                                free
//! ```
//!
//! - `UNINIT`: no resources held; only `open` and `free` are valid.
//! - `OPEN`: staged in memory with a reserved extent; mutable via `write`.
//! - `CLOSED`: durably on storage and immutable. The staging buffer is
//!   released on close and re-acquired on demand for recovery reads.
//! - `FREED`: terminal; the registry entry is removed promptly after.
//!
//! A per-segment mutex serializes every transition, so operations on one
//! replica are linearizable while distinct replicas proceed in parallel.

use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{Error, Result};
use crate::pool::{AlignedPool, PoolBuffer};
use crate::storage::{Extent, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Uninit,
    Open,
    Closed,
    Freed,
}

/// Join token for a background read filling a staging buffer.
///
/// The loader owns the buffer while the read is in flight and hands it
/// back through `wait`, so the buffer is referenced by exactly one owner
/// at any point.
struct LoadCompletion {
    handle: thread::JoinHandle<Result<PoolBuffer>>,
}

impl LoadCompletion {
    fn wait(self) -> Result<PoolBuffer> {
        self.handle
            .join()
            .map_err(|_| Error::StorageIo("segment load thread panicked".to_string()))?
    }
}

struct Inner {
    state: SegmentState,
    buffer: Option<PoolBuffer>,
    extent: Option<Extent>,
    load: Option<LoadCompletion>,
}

/// State and resources for one `(master, segment)` replica.
pub struct Segment {
    master_id: u64,
    segment_id: u64,
    pool: AlignedPool,
    storage: Arc<dyn Storage>,
    inner: Mutex<Inner>,
}

impl Segment {
    /// Creates the tracking entry in `UNINIT`; `open` reserves resources.
    pub fn new(
        master_id: u64,
        segment_id: u64,
        pool: AlignedPool,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            master_id,
            segment_id,
            pool,
            storage,
            inner: Mutex::new(Inner {
                state: SegmentState::Uninit,
                buffer: None,
                extent: None,
                load: None,
            }),
        }
    }

    pub fn master_id(&self) -> u64 {
        self.master_id
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn state(&self) -> SegmentState {
        self.inner.lock().map_or(SegmentState::Freed, |inner| inner.state)
    }

    /// Whether the replica is currently staged in a pool buffer.
    pub fn in_memory(&self) -> bool {
        self.inner.lock().map_or(false, |inner| inner.buffer.is_some())
    }

    /// Whether the replica has been durably written to its extent.
    pub fn in_storage(&self) -> bool {
        self.inner
            .lock()
            .map_or(false, |inner| inner.state == SegmentState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.state() == SegmentState::Open
    }

    /// Reserve a storage extent and a staging buffer, entering `OPEN`.
    /// Opening an already-open replica is a no-op.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        match inner.state {
            SegmentState::Uninit => {
                let extent = self.storage.allocate()?;
                let buffer = match self.pool.acquire() {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        self.storage.free(extent);
                        return Err(e);
                    }
                };
                inner.extent = Some(extent);
                inner.buffer = Some(buffer);
                inner.state = SegmentState::Open;
                Ok(())
            }
            SegmentState::Open => Ok(()),
            SegmentState::Closed => Err(Error::SegmentAlreadyClosed),
            SegmentState::Freed => Err(Error::SegmentFreed),
        }
    }

    /// Copy `data` into the staged replica at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock()?;
        match inner.state {
            SegmentState::Open => {
                let buffer = inner.buffer.as_mut().ok_or(Error::SegmentNotOpen)?;
                let end = offset.checked_add(data.len()).ok_or_else(|| {
                    Error::BadRequest("write range overflows".to_string())
                })?;
                if end > buffer.len() {
                    return Err(Error::BadRequest(format!(
                        "write of {} bytes at offset {} exceeds the {} byte segment",
                        data.len(),
                        offset,
                        buffer.len()
                    )));
                }
                buffer[offset..end].copy_from_slice(data);
                Ok(())
            }
            SegmentState::Uninit => Err(Error::SegmentNotOpen),
            SegmentState::Closed => Err(Error::SegmentAlreadyClosed),
            SegmentState::Freed => Err(Error::SegmentFreed),
        }
    }

    /// Write the staged replica through to its extent and enter `CLOSED`.
    ///
    /// Blocks until the backend reports durability, then releases the
    /// staging buffer. On a storage error the replica stays `OPEN` with
    /// its buffer intact so the master can retry. Closing an
    /// already-closed replica is a no-op and reissues nothing.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        match inner.state {
            SegmentState::Open => {
                let buffer = inner.buffer.as_ref().ok_or(Error::SegmentNotOpen)?;
                let extent = inner.extent.as_ref().ok_or(Error::SegmentNotOpen)?;
                self.storage.write(extent, buffer)?;

                inner.buffer = None;
                inner.state = SegmentState::Closed;
                tracing::debug!(
                    master_id = self.master_id,
                    segment_id = self.segment_id,
                    "segment closed"
                );
                Ok(())
            }
            SegmentState::Closed => Ok(()),
            SegmentState::Uninit => Err(Error::SegmentNotOpen),
            SegmentState::Freed => Err(Error::SegmentFreed),
        }
    }

    /// Hint that the replica will be read soon: acquire a buffer and
    /// dispatch a background read from storage. No-op when the replica is
    /// already staged or a load is in flight; `with_buffer` is the
    /// synchronization point.
    pub fn start_loading(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        match inner.state {
            SegmentState::Closed => {
                if inner.buffer.is_some() || inner.load.is_some() {
                    return Ok(());
                }
                let mut buffer = self.pool.acquire()?;
                let extent = inner
                    .extent
                    .clone()
                    .ok_or(Error::SegmentUnavailable)?;
                let storage = Arc::clone(&self.storage);

                let handle = thread::spawn(move || {
                    storage.read(&extent, &mut buffer)?;
                    Ok(buffer)
                });
                inner.load = Some(LoadCompletion { handle });
                Ok(())
            }
            SegmentState::Open => Err(Error::BadRequest(
                "cannot load a segment that is still open".to_string(),
            )),
            SegmentState::Uninit => Err(Error::BadRequest(
                "cannot load a segment that was never persisted".to_string(),
            )),
            SegmentState::Freed => Err(Error::SegmentFreed),
        }
    }

    /// Run `f` over the staged replica bytes, blocking first on any
    /// in-flight load, or performing the read inline when the buffer was
    /// evicted and no load was hinted.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        let mut inner = self.inner.lock()?;
        match inner.state {
            SegmentState::Open => {}
            SegmentState::Closed => {
                if inner.buffer.is_none() {
                    if let Some(load) = inner.load.take() {
                        // The loader never touches this segment's lock,
                        // so joining here is safe; it serializes against
                        // other ops on this one replica only.
                        inner.buffer = Some(load.wait()?);
                    } else {
                        let mut buffer = self.pool.acquire()?;
                        let extent = inner
                            .extent
                            .clone()
                            .ok_or(Error::SegmentUnavailable)?;
                        self.storage.read(&extent, &mut buffer)?;
                        inner.buffer = Some(buffer);
                    }
                }
            }
            SegmentState::Uninit => return Err(Error::SegmentNotOpen),
            SegmentState::Freed => return Err(Error::SegmentFreed),
        }
        let buffer = inner.buffer.as_ref().ok_or(Error::SegmentNotOpen)?;
        f(buffer)
    }

    /// Release every resource and enter the terminal `FREED` state.
    ///
    /// An in-flight load is completed and its buffer discarded before the
    /// extent is released, so nothing leaks. Freeing twice is a no-op.
    pub fn free(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.state == SegmentState::Freed {
            return Ok(());
        }

        if let Some(load) = inner.load.take() {
            // Discard the loaded buffer; it returns to the pool on drop.
            let _ = load.wait();
        }
        inner.buffer = None;
        if let Some(extent) = inner.extent.take() {
            self.storage.free(extent);
        }
        inner.state = SegmentState::Freed;
        tracing::debug!(
            master_id = self.master_id,
            segment_id = self.segment_id,
            "segment freed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("master_id", &self.master_id)
            .field("segment_id", &self.segment_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const SEG: usize = 4096;

    fn fixture(pool_capacity: usize, extents: usize) -> (AlignedPool, Arc<dyn Storage>) {
        let pool = AlignedPool::new(SEG, pool_capacity).unwrap();
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new(SEG, extents));
        (pool, storage)
    }

    /// Counts writes and optionally fails them, wrapping a real backend.
    struct InstrumentedStorage {
        backend: MemStorage,
        writes: AtomicUsize,
        fail_writes: AtomicBool,
    }

    impl InstrumentedStorage {
        fn new() -> Self {
            Self {
                backend: MemStorage::new(SEG, 4),
                writes: AtomicUsize::new(0),
                fail_writes: AtomicBool::new(false),
            }
        }
    }

    impl Storage for InstrumentedStorage {
        fn allocate(&self) -> Result<Extent> {
            self.backend.allocate()
        }

        fn write(&self, extent: &Extent, buf: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::StorageIo("injected write failure".to_string()));
            }
            self.backend.write(extent, buf)
        }

        fn read(&self, extent: &Extent, buf: &mut [u8]) -> Result<()> {
            self.backend.read(extent, buf)
        }

        fn free(&self, extent: Extent) {
            self.backend.free(extent)
        }

        fn segment_size(&self) -> usize {
            self.backend.segment_size()
        }
    }

    #[test]
    fn test_lifecycle_open_write_close_free() -> Result<()> {
        let (pool, storage) = fixture(2, 2);
        let segment = Segment::new(7, 3, pool.clone(), storage);

        assert_eq!(segment.state(), SegmentState::Uninit);
        assert!(!segment.in_memory());

        segment.open()?;
        assert!(segment.is_open());
        assert!(segment.in_memory());
        assert_eq!(pool.in_use(), 1);

        segment.write(0, b"HELLO")?;
        segment.close()?;
        assert_eq!(segment.state(), SegmentState::Closed);
        assert!(segment.in_storage());
        // The staging buffer is released once the replica is durable.
        assert!(!segment.in_memory());
        assert_eq!(pool.in_use(), 0);

        segment.free()?;
        assert_eq!(segment.state(), SegmentState::Freed);
        assert_eq!(pool.in_use(), 0);
        Ok(())
    }

    #[test]
    fn test_open_is_idempotent() -> Result<()> {
        let (pool, storage) = fixture(2, 2);
        let segment = Segment::new(1, 1, pool.clone(), storage);

        segment.open()?;
        segment.open()?;
        assert_eq!(pool.in_use(), 1);
        Ok(())
    }

    #[test]
    fn test_write_bounds() -> Result<()> {
        let (pool, storage) = fixture(1, 1);
        let segment = Segment::new(1, 1, pool, storage);
        segment.open()?;

        // offset + length == segment size is the last valid write.
        segment.write(SEG - 5, b"TAIL!")?;
        assert!(matches!(
            segment.write(SEG - 4, b"TAIL!"),
            Err(Error::BadRequest(_))
        ));
        Ok(())
    }

    #[test]
    fn test_state_machine_violations() -> Result<()> {
        let (pool, storage) = fixture(2, 2);
        let segment = Segment::new(1, 1, pool.clone(), storage.clone());

        assert_eq!(segment.write(0, b"x").err(), Some(Error::SegmentNotOpen));
        assert_eq!(segment.close().err(), Some(Error::SegmentNotOpen));

        segment.open()?;
        segment.close()?;
        assert_eq!(segment.open().err(), Some(Error::SegmentAlreadyClosed));
        assert_eq!(
            segment.write(0, b"x").err(),
            Some(Error::SegmentAlreadyClosed)
        );

        segment.free()?;
        assert_eq!(segment.open().err(), Some(Error::SegmentFreed));
        assert_eq!(segment.write(0, b"x").err(), Some(Error::SegmentFreed));
        assert_eq!(segment.close().err(), Some(Error::SegmentFreed));
        segment.free()?; // no-op
        Ok(())
    }

    #[test]
    fn test_close_failure_leaves_segment_open() -> Result<()> {
        let pool = AlignedPool::new(SEG, 1).unwrap();
        let storage = Arc::new(InstrumentedStorage::new());
        let segment = Segment::new(1, 1, pool.clone(), storage.clone());

        segment.open()?;
        segment.write(0, b"payload")?;

        storage.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(segment.close(), Err(Error::StorageIo(_))));
        assert!(segment.is_open());
        assert!(segment.in_memory());

        // The master retries after the backend recovers.
        storage.fail_writes.store(false, Ordering::SeqCst);
        segment.close()?;
        assert_eq!(segment.state(), SegmentState::Closed);
        Ok(())
    }

    #[test]
    fn test_idempotent_close_reissues_nothing() -> Result<()> {
        let pool = AlignedPool::new(SEG, 1).unwrap();
        let storage = Arc::new(InstrumentedStorage::new());
        let segment = Segment::new(1, 1, pool, storage.clone());

        segment.open()?;
        segment.write(0, b"once")?;
        segment.close()?;
        segment.close()?;
        assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_reload_after_eviction() -> Result<()> {
        let (pool, storage) = fixture(2, 2);
        let segment = Arc::new(Segment::new(1, 1, pool.clone(), storage));

        segment.open()?;
        segment.write(0, b"DURABLE")?;
        segment.close()?;
        assert!(!segment.in_memory());

        segment.start_loading()?;
        let head = segment.with_buffer(|buf| Ok(buf[..7].to_vec()))?;
        assert_eq!(&head, b"DURABLE");
        assert!(segment.in_memory());
        assert_eq!(pool.in_use(), 1);

        // Hinting again while staged is a no-op.
        segment.start_loading()?;
        assert_eq!(pool.in_use(), 1);
        Ok(())
    }

    #[test]
    fn test_with_buffer_loads_inline_without_hint() -> Result<()> {
        let (pool, storage) = fixture(2, 2);
        let segment = Segment::new(1, 1, pool, storage);

        segment.open()?;
        segment.write(0, b"INLINE")?;
        segment.close()?;

        let head = segment.with_buffer(|buf| Ok(buf[..6].to_vec()))?;
        assert_eq!(&head, b"INLINE");
        Ok(())
    }

    #[test]
    fn test_start_loading_requires_closed() -> Result<()> {
        let (pool, storage) = fixture(2, 2);
        let segment = Arc::new(Segment::new(1, 1, pool, storage));

        assert!(matches!(
            segment.start_loading(),
            Err(Error::BadRequest(_))
        ));
        segment.open()?;
        assert!(matches!(
            segment.start_loading(),
            Err(Error::BadRequest(_))
        ));
        Ok(())
    }

    #[test]
    fn test_free_during_load_leaks_nothing() -> Result<()> {
        let (pool, storage) = fixture(2, 2);
        let segment = Arc::new(Segment::new(1, 1, pool.clone(), storage.clone()));

        segment.open()?;
        segment.write(0, b"SHORTLIVED")?;
        segment.close()?;
        segment.start_loading()?;
        segment.free()?;

        assert_eq!(segment.state(), SegmentState::Freed);
        assert_eq!(pool.in_use(), 0);
        // The extent went back to storage's free list too.
        let a = storage.allocate()?;
        let b = storage.allocate()?;
        storage.free(a);
        storage.free(b);
        Ok(())
    }

    #[test]
    fn test_concurrent_ops_on_distinct_segments() -> Result<()> {
        use std::thread;

        let (pool, storage) = fixture(4, 4);
        let segments: Vec<_> = (0..4)
            .map(|id| Arc::new(Segment::new(1, id, pool.clone(), storage.clone())))
            .collect();

        let handles: Vec<_> = segments
            .iter()
            .map(|segment| {
                let segment = Arc::clone(segment);
                thread::spawn(move || -> Result<()> {
                    segment.open()?;
                    segment.write(0, b"concurrent")?;
                    segment.close()?;
                    segment.with_buffer(|buf| {
                        assert_eq!(&buf[..10], b"concurrent");
                        Ok(())
                    })?;
                    segment.free()
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap()?;
        }
        assert_eq!(pool.in_use(), 0);
        Ok(())
    }
}
