//! Log entry format for segment replicas.
//!
//! A master's log segment is a dense sequence of typed entries staged into
//! a fixed-size buffer. The backup treats entry payloads as opaque except
//! during recovery, where it must split a segment's entries across the
//! recovery masters that own the data.
//!
//! # Entry Format
//!
//! ```text
//! +---------+-----------+----------+
//! | type:u8 |length: u32| payload  |
//! +---------+-----------+----------+
//! | 1 byte  |  4 bytes  | var len  |
//! +---------+-----------+----------+
//! ```
//!
//! - Multi-byte integers use big-endian encoding for portability
//! - A type byte of zero terminates the sequence (the remainder of the
//!   fixed-size buffer is unused space)
//! - No padding between entries
//!
//! `Object` and `Tombstone` payloads begin with a 16-byte ownership
//! prefix, `table_id: u64` then `key_hash: u64`, which is all the backup
//! ever inspects. `SegFooter` carries a CRC32 over every byte that
//! precedes it in the segment; the iterator verifies it when present.

pub mod tablets;

pub use tablets::{Partition, Partitioning, Tablet};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Bytes of framing before each entry payload.
pub const ENTRY_HEADER_SIZE: usize = 5;

/// Bytes of `(table_id, key_hash)` prefix in tablet-scoped payloads.
pub const OWNERSHIP_PREFIX_SIZE: usize = 16;

/// The kinds of entries a segment may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// Metadata written by the master when the segment is opened.
    SegHeader,
    /// A live object; payload starts with the ownership prefix.
    Object,
    /// A deletion marker; payload starts with the ownership prefix.
    Tombstone,
    /// Digest of the master's live segment list.
    LogDigest,
    /// Trailer with a checksum over the preceding bytes.
    SegFooter,
}

impl EntryType {
    pub fn as_u8(self) -> u8 {
        match self {
            EntryType::SegHeader => 1,
            EntryType::Object => 2,
            EntryType::Tombstone => 3,
            EntryType::LogDigest => 4,
            EntryType::SegFooter => 5,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(EntryType::SegHeader),
            2 => Ok(EntryType::Object),
            3 => Ok(EntryType::Tombstone),
            4 => Ok(EntryType::LogDigest),
            5 => Ok(EntryType::SegFooter),
            other => Err(Error::BadData(format!("unknown entry type {}", other))),
        }
    }

    /// Whether entries of this type belong to every recovery partition
    /// regardless of tablet ownership.
    pub fn is_metadata(self) -> bool {
        matches!(
            self,
            EntryType::SegHeader | EntryType::LogDigest | EntryType::SegFooter
        )
    }
}

/// One decoded entry, borrowing its payload from the segment buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry<'a> {
    pub entry_type: EntryType,
    pub payload: &'a [u8],
}

impl<'a> Entry<'a> {
    /// The `(table_id, key_hash)` ownership prefix of a tablet-scoped
    /// entry. Metadata entries have no prefix.
    pub fn ownership(&self) -> Result<(u64, u64)> {
        if self.entry_type.is_metadata() {
            return Err(Error::BadData(format!(
                "{:?} entries carry no ownership prefix",
                self.entry_type
            )));
        }
        if self.payload.len() < OWNERSHIP_PREFIX_SIZE {
            return Err(Error::BadData(format!(
                "{:?} payload of {} bytes is shorter than the ownership prefix",
                self.entry_type,
                self.payload.len()
            )));
        }
        let table_id = BigEndian::read_u64(&self.payload[0..8]);
        let key_hash = BigEndian::read_u64(&self.payload[8..16]);
        Ok((table_id, key_hash))
    }

    /// Total framed size of this entry.
    pub fn frame_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.payload.len()
    }

    /// Append this entry, framing included, to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.entry_type.as_u8());
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, self.payload.len() as u32);
        out.extend_from_slice(&len);
        out.extend_from_slice(self.payload);
    }
}

/// Iterates the typed entries of a segment buffer.
///
/// Stops cleanly at a zero type byte, a `SegFooter`, or the end of the
/// buffer. A [`verifying`](EntryIterator::verifying) iterator also checks
/// the footer checksum against the bytes that precede it; plain iteration
/// skips the check, since a recovery response carries the source
/// segment's footer over a filtered entry sequence.
pub struct EntryIterator<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
    verify: bool,
}

impl<'a> EntryIterator<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            done: false,
            verify: false,
        }
    }

    /// An iterator that additionally verifies the footer checksum. Use on
    /// full segment images, never on filtered responses.
    pub fn verifying(buf: &'a [u8]) -> Self {
        Self {
            verify: true,
            ..Self::new(buf)
        }
    }

    fn read_entry(&mut self) -> Result<Option<Entry<'a>>> {
        if self.done || self.offset >= self.buf.len() {
            return Ok(None);
        }

        let type_byte = self.buf[self.offset];
        if type_byte == 0 {
            return Ok(None);
        }
        let entry_type = EntryType::from_u8(type_byte)?;

        if self.offset + ENTRY_HEADER_SIZE > self.buf.len() {
            return Err(Error::BadData("truncated entry header".to_string()));
        }
        let length =
            BigEndian::read_u32(&self.buf[self.offset + 1..self.offset + 5]) as usize;

        let payload_start = self.offset + ENTRY_HEADER_SIZE;
        let payload_end = payload_start
            .checked_add(length)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::BadData(format!(
                    "entry at offset {} overruns the segment by claiming {} payload bytes",
                    self.offset, length
                ))
            })?;

        let entry = Entry {
            entry_type,
            payload: &self.buf[payload_start..payload_end],
        };

        if entry_type == EntryType::SegFooter {
            if self.verify {
                self.verify_footer(&entry)?;
            }
            self.done = true;
        }

        self.offset = payload_end;
        Ok(Some(entry))
    }

    fn verify_footer(&self, footer: &Entry) -> Result<()> {
        if footer.payload.len() != 4 {
            return Err(Error::BadData(format!(
                "segment footer payload is {} bytes, expected 4",
                footer.payload.len()
            )));
        }
        let stored = BigEndian::read_u32(footer.payload);
        let computed = CRC32.checksum(&self.buf[..self.offset]);
        if stored != computed {
            return Err(Error::BadData(format!(
                "segment checksum mismatch: stored {:08x}, computed {:08x}",
                stored, computed
            )));
        }
        Ok(())
    }
}

impl<'a> Iterator for EntryIterator<'a> {
    type Item = Result<Entry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Builds a segment image entry by entry, the way a master stages its log.
///
/// Used by tests and by masters linking this crate; the backup itself only
/// ever reads images.
pub struct EntryAppender<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> EntryAppender<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Append one framed entry. Fails with `BadRequest` when the segment
    /// has no room left for it.
    pub fn append(&mut self, entry_type: EntryType, payload: &[u8]) -> Result<()> {
        let end = self.offset + ENTRY_HEADER_SIZE + payload.len();
        if end > self.buf.len() {
            return Err(Error::BadRequest(format!(
                "entry of {} bytes does not fit at offset {}",
                payload.len(),
                self.offset
            )));
        }

        let mut cursor = std::io::Cursor::new(&mut self.buf[self.offset..end]);
        cursor.write_u8(entry_type.as_u8())?;
        cursor.write_u32::<BigEndian>(payload.len() as u32)?;
        std::io::Write::write_all(&mut cursor, payload)?;

        self.offset = end;
        Ok(())
    }

    /// Append an object entry with the given ownership prefix.
    pub fn append_object(&mut self, table_id: u64, key_hash: u64, value: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(OWNERSHIP_PREFIX_SIZE + value.len());
        payload.write_u64::<BigEndian>(table_id)?;
        payload.write_u64::<BigEndian>(key_hash)?;
        payload.extend_from_slice(value);
        self.append(EntryType::Object, &payload)
    }

    /// Seal the image with a `SegFooter` checksumming everything written
    /// so far.
    pub fn finish(mut self) -> Result<usize> {
        let checksum = CRC32.checksum(&self.buf[..self.offset]);
        let mut payload = [0u8; 4];
        BigEndian::write_u32(&mut payload, checksum);
        self.append(EntryType::SegFooter, &payload)?;
        Ok(self.offset)
    }

    /// Bytes appended so far.
    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }
}

/// Decode a segment image and collect the entries a partition keeps:
/// tablet-scoped entries whose ownership prefix falls inside the
/// partition, plus every metadata entry. Framing is preserved, so the
/// output is itself a valid entry sequence.
pub fn filter_entries(buf: &[u8], partition: &Partition) -> Result<Vec<u8>> {
    let mut kept = Vec::new();
    for entry in EntryIterator::verifying(buf) {
        let entry = entry?;
        if keep_entry(&entry, partition)? {
            entry.write_to(&mut kept);
        }
    }
    Ok(kept)
}

fn keep_entry(entry: &Entry, partition: &Partition) -> Result<bool> {
    if entry.entry_type.is_metadata() {
        return Ok(true);
    }
    let (table_id, key_hash) = entry.ownership()?;
    Ok(partition.contains(table_id, key_hash))
}
