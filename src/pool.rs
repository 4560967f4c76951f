//! Fixed-capacity pool of aligned segment staging buffers.
//!
//! Every replica staged in memory occupies one buffer of exactly the
//! cluster segment size. The buffers back direct I/O against the storage
//! backend, so each one must satisfy the block device's alignment
//! requirements:
//!
//! 1. The buffer's starting address must be aligned to the block size.
//! 2. The buffer length must be a multiple of the block size.
//!
//! All backing memory is allocated once at construction; `acquire` and
//! the implicit release on [`PoolBuffer`] drop only move buffers between
//! the pool's free list and callers. The free list is LIFO so recently
//! released buffers (still warm in cache) are handed out first.
//!
//! Buffer contents are not zeroed on release. Callers must not rely on
//! contents across acquisitions.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// The alignment required for direct I/O, typically the block or page size.
/// On modern systems, this is almost always 4096 bytes (4 KiB).
pub const ALIGNMENT: usize = 4096;

/// A fixed-count allocator of page-aligned, segment-sized buffers.
///
/// Cheap to clone; clones share the same backing pool.
#[derive(Clone)]
pub struct AlignedPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<AlignedBuffer>>,
}

impl AlignedPool {
    /// Allocates `capacity` buffers of `buffer_size` bytes each, aligned
    /// to [`ALIGNMENT`]. `buffer_size` must be a multiple of the alignment
    /// so whole buffers can be handed to direct I/O.
    pub fn new(buffer_size: usize, capacity: usize) -> Result<Self> {
        if buffer_size == 0 || buffer_size % ALIGNMENT != 0 {
            return Err(Error::BadRequest(format!(
                "segment size {} is not a multiple of the {} byte alignment",
                buffer_size, ALIGNMENT
            )));
        }

        let free = (0..capacity)
            .map(|_| AlignedBuffer::new(buffer_size))
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                capacity,
                free: Mutex::new(free),
            }),
        })
    }

    /// Checks out a buffer, or fails with `PoolExhausted` when every
    /// buffer is in use. The buffer returns to the pool when dropped.
    pub fn acquire(&self) -> Result<PoolBuffer> {
        let buf = self
            .inner
            .free
            .lock()?
            .pop()
            .ok_or(Error::PoolExhausted)?;

        Ok(PoolBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Total number of buffers the pool was built with.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffers currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.inner.free.lock().map_or(0, |free| free.len())
    }
}

impl std::fmt::Debug for AlignedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("capacity", &self.inner.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// An exclusive checkout of one pool buffer.
///
/// Dereferences to the full `buffer_size` byte slice. Dropping the
/// checkout pushes the buffer back onto the pool's free list.
pub struct PoolBuffer {
    buf: Option<AlignedBuffer>,
    pool: Arc<PoolInner>,
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().unwrap()
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Ok(mut free) = self.pool.free.lock() {
                free.push(buf);
            }
        }
    }
}

unsafe impl Send for AlignedBuffer {}

struct AlignedBuffer {
    data: *mut u8,
    capacity: usize,
    layout: Layout,
}

impl AlignedBuffer {
    fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, ALIGNMENT).unwrap();
        let data = unsafe { alloc_zeroed(layout) };
        assert!(!data.is_null(), "segment pool allocation failed");

        Self {
            data,
            capacity,
            layout,
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.data, self.layout) }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.capacity) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.capacity) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_alignment() {
        let pool = AlignedPool::new(8192, 2).unwrap();
        let buf = pool.acquire().unwrap();
        assert_eq!(buf.as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(buf.len(), 8192);
    }

    #[test]
    fn test_rejects_unaligned_size() {
        assert_eq!(
            AlignedPool::new(1000, 2).err(),
            Some(Error::BadRequest(
                "segment size 1000 is not a multiple of the 4096 byte alignment".to_string()
            ))
        );
    }

    #[test]
    fn test_exhaustion_and_release() {
        let pool = AlignedPool::new(4096, 2).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.acquire().err(), Some(Error::PoolExhausted));

        drop(a);
        assert_eq!(pool.in_use(), 1);
        let c = pool.acquire().unwrap();
        assert_eq!(pool.in_use(), 2);

        drop(b);
        drop(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_lifo_reuse() {
        let pool = AlignedPool::new(4096, 2).unwrap();

        let first = pool.acquire().unwrap();
        let addr = first.as_ptr() as usize;
        drop(first);

        // The most recently released buffer comes back first.
        let second = pool.acquire().unwrap();
        assert_eq!(second.as_ptr() as usize, addr);
    }

    #[test]
    fn test_contents_survive_checkout() {
        let pool = AlignedPool::new(4096, 1).unwrap();

        let mut buf = pool.acquire().unwrap();
        buf[0..5].copy_from_slice(b"HELLO");
        assert_eq!(&buf[0..5], b"HELLO");
    }

    #[test]
    fn test_concurrent_acquire_release() {
        use std::thread;

        let pool = AlignedPool::new(4096, 4).unwrap();
        let mut handles = vec![];

        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let mut buf = pool.acquire().unwrap();
                    buf[0] = 0xAB;
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }
}
