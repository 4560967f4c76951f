//! File-backed extent array with optional direct I/O.
//!
//! One pre-sized file holds `extent_count` extents of `segment_size`
//! bytes back to back. Extent offsets are multiples of the segment size,
//! which is itself a multiple of the direct-I/O alignment, so whole pool
//! buffers can be written with `O_DIRECT` when enabled. Each write is
//! followed by `sync_data`; the `Ok` return is the durability barrier.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::pool::ALIGNMENT;

use super::{Extent, Storage};

pub struct DiskStorage {
    file: File,
    path: PathBuf,
    segment_size: usize,
    free: Mutex<Vec<usize>>,
}

impl DiskStorage {
    /// Create or truncate the extent file at `path` and size it to hold
    /// `extent_count` extents.
    pub fn open(
        path: impl AsRef<Path>,
        segment_size: usize,
        extent_count: usize,
        direct_io: bool,
    ) -> Result<Self> {
        if segment_size % ALIGNMENT != 0 {
            return Err(Error::BadRequest(format!(
                "segment size {} is not a multiple of the {} byte alignment",
                segment_size, ALIGNMENT
            )));
        }

        let path = path.as_ref().to_path_buf();

        let mut open_opts = File::options();
        open_opts.create(true).read(true).write(true);

        #[cfg(target_os = "linux")]
        if direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            open_opts.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = direct_io;

        let file = open_opts.open(&path)?;
        file.set_len((segment_size * extent_count) as u64)?;

        tracing::info!(
            path = %path.display(),
            segment_size,
            extent_count,
            direct_io,
            "opened extent file"
        );

        Ok(Self {
            file,
            path,
            segment_size,
            free: Mutex::new((0..extent_count).rev().collect()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, extent: &Extent) -> u64 {
        (extent.index() * self.segment_size) as u64
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

impl Storage for DiskStorage {
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
        self.file.write_all_at(buf, self.offset(extent))?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read(&self, extent: &Extent, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf.len())?;
        self.file.read_exact_at(buf, self.offset(extent))?;
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
