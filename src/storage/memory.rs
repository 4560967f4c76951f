//! Volatile in-memory extent array, for tests and deployments that trade
//! restart durability for speed.

use std::sync::Mutex;

use super::{Extent, Storage};
use crate::error::{Error, Result};

pub struct MemStorage {
    segment_size: usize,
    slots: Vec<Mutex<Vec<u8>>>,
    free: Mutex<Vec<usize>>,
}

impl MemStorage {
    pub fn new(segment_size: usize, extent_count: usize) -> Self {
        let slots = (0..extent_count)
            .map(|_| Mutex::new(vec![0u8; segment_size]))
            .collect();

        // LIFO free list, same as the pool: extent 0 is handed out first.
        let free = (0..extent_count).rev().collect();

        Self {
            segment_size,
            slots,
            free: Mutex::new(free),
        }
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.segment_size {
            return Err(Error::StorageIo(format!(
                "buffer is {} bytes, extent is {}",
                len, self.segment_size
            )));
        }
        Ok(())
    }
}

impl Storage for MemStorage {
    fn allocate(&self) -> Result<Extent> {
        let index = self
            .free
            .lock()?
            .pop()
            .ok_or(Error::StorageOutOfSpace)?;
        Ok(Extent::new(index))
    }

    fn write(&self, extent: &Extent, buf: &[u8]) -> Result<()> {
        self.check_len(buf.len())?;
        self.slots[extent.index()].lock()?.copy_from_slice(buf);
        Ok(())
    }

    fn read(&self, extent: &Extent, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf.len())?;
        buf.copy_from_slice(&self.slots[extent.index()].lock()?);
        Ok(())
    }

    fn free(&self, extent: Extent) {
        if let Ok(mut free) = self.free.lock() {
            free.push(extent.index());
        }
    }

    fn segment_size(&self) -> usize {
        self.segment_size
    }
}
