//! Typed requests, responses, and their wire form.
//!
//! Transport framing and delivery are someone else's problem; this
//! module defines what travels inside a frame. Every message is a fixed
//! header followed by an optional payload, all integers big-endian:
//!
//! ```text
//! request:  type:u8 | header fields        | payload
//! response: status:u8 | header fields      | payload
//! ```
//!
//! | RPC              | request payload          | response payload    |
//! |------------------|--------------------------|---------------------|
//! | OpenSegment      | -                        | -                   |
//! | WriteSegment     | `length` data bytes      | -                   |
//! | CloseSegment     | -                        | -                   |
//! | FreeSegment      | -                        | -                   |
//! | StartReadingData | serialized partitioning  | segment id array    |
//! | GetRecoveryData  | -                        | filtered entries    |

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::error::{Error, Result};

/// Status byte leading every response. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    BadRequest = 1,
    SegmentNotOpen = 2,
    SegmentAlreadyClosed = 3,
    SegmentFreed = 4,
    SegmentUnavailable = 5,
    PoolExhausted = 6,
    StorageOutOfSpace = 7,
    StorageIo = 8,
    BadData = 9,
    Retry = 10,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Status::Ok,
            1 => Status::BadRequest,
            2 => Status::SegmentNotOpen,
            3 => Status::SegmentAlreadyClosed,
            4 => Status::SegmentFreed,
            5 => Status::SegmentUnavailable,
            6 => Status::PoolExhausted,
            7 => Status::StorageOutOfSpace,
            8 => Status::StorageIo,
            9 => Status::BadData,
            10 => Status::Retry,
            other => {
                return Err(Error::BadData(format!("unknown status byte {}", other)))
            }
        })
    }
}

impl From<&Error> for Status {
    fn from(error: &Error) -> Self {
        match error {
            Error::BadRequest(_) => Status::BadRequest,
            Error::BadData(_) => Status::BadData,
            Error::SegmentNotOpen => Status::SegmentNotOpen,
            Error::SegmentAlreadyClosed => Status::SegmentAlreadyClosed,
            Error::SegmentFreed => Status::SegmentFreed,
            Error::SegmentUnavailable => Status::SegmentUnavailable,
            Error::PoolExhausted => Status::PoolExhausted,
            Error::StorageOutOfSpace => Status::StorageOutOfSpace,
            Error::StorageIo(_) => Status::StorageIo,
            Error::LoadInProgress => Status::Retry,
        }
    }
}

/// WriteSegment convenience flags, combinable to cut round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFlags {
    bits: u8,
}

impl WriteFlags {
    const OPEN: u8 = 0x01;
    const CLOSE: u8 = 0x02;

    pub fn none() -> Self {
        Self::default()
    }

    /// Create the segment first when it is not already open.
    pub fn open(mut self) -> Self {
        self.bits |= Self::OPEN;
        self
    }

    /// Close the segment once this write lands.
    pub fn close(mut self) -> Self {
        self.bits |= Self::CLOSE;
        self
    }

    pub fn has_open(self) -> bool {
        self.bits & Self::OPEN != 0
    }

    pub fn has_close(self) -> bool {
        self.bits & Self::CLOSE != 0
    }

    pub fn bits(self) -> u8 {
        self.bits
    }

    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !(Self::OPEN | Self::CLOSE) != 0 {
            return Err(Error::BadRequest(format!(
                "unknown write flags {:#04x}",
                bits
            )));
        }
        Ok(Self { bits })
    }
}

const REQ_OPEN: u8 = 1;
const REQ_WRITE: u8 = 2;
const REQ_CLOSE: u8 = 3;
const REQ_FREE: u8 = 4;
const REQ_START_READING: u8 = 5;
const REQ_GET_RECOVERY: u8 = 6;

/// A request from a master or a recovery master.
#[derive(Debug, Clone, PartialEq)]
pub enum BackupRequest {
    OpenSegment {
        master_id: u64,
        segment_id: u64,
    },
    WriteSegment {
        master_id: u64,
        segment_id: u64,
        offset: u32,
        flags: WriteFlags,
        data: Vec<u8>,
    },
    CloseSegment {
        master_id: u64,
        segment_id: u64,
    },
    FreeSegment {
        master_id: u64,
        segment_id: u64,
    },
    StartReadingData {
        master_id: u64,
        /// Serialized tablet partitioning; see `log::Partitioning`.
        partitioning: Vec<u8>,
    },
    GetRecoveryData {
        master_id: u64,
        segment_id: u64,
        partition_index: u32,
    },
}

impl BackupRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            BackupRequest::OpenSegment {
                master_id,
                segment_id,
            } => {
                out.write_u8(REQ_OPEN)?;
                out.write_u64::<BigEndian>(*master_id)?;
                out.write_u64::<BigEndian>(*segment_id)?;
            }
            BackupRequest::WriteSegment {
                master_id,
                segment_id,
                offset,
                flags,
                data,
            } => {
                out.write_u8(REQ_WRITE)?;
                out.write_u64::<BigEndian>(*master_id)?;
                out.write_u64::<BigEndian>(*segment_id)?;
                out.write_u32::<BigEndian>(*offset)?;
                out.write_u32::<BigEndian>(data.len() as u32)?;
                out.write_u8(flags.bits())?;
                out.write_all(data)?;
            }
            BackupRequest::CloseSegment {
                master_id,
                segment_id,
            } => {
                out.write_u8(REQ_CLOSE)?;
                out.write_u64::<BigEndian>(*master_id)?;
                out.write_u64::<BigEndian>(*segment_id)?;
            }
            BackupRequest::FreeSegment {
                master_id,
                segment_id,
            } => {
                out.write_u8(REQ_FREE)?;
                out.write_u64::<BigEndian>(*master_id)?;
                out.write_u64::<BigEndian>(*segment_id)?;
            }
            BackupRequest::StartReadingData {
                master_id,
                partitioning,
            } => {
                out.write_u8(REQ_START_READING)?;
                out.write_u64::<BigEndian>(*master_id)?;
                out.write_u32::<BigEndian>(partitioning.len() as u32)?;
                out.write_all(partitioning)?;
            }
            BackupRequest::GetRecoveryData {
                master_id,
                segment_id,
                partition_index,
            } => {
                out.write_u8(REQ_GET_RECOVERY)?;
                out.write_u64::<BigEndian>(*master_id)?;
                out.write_u64::<BigEndian>(*segment_id)?;
                out.write_u32::<BigEndian>(*partition_index)?;
            }
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let request_type = cursor
            .read_u8()
            .map_err(|_| Error::BadRequest("empty request".to_string()))?;

        let request = match request_type {
            REQ_OPEN => BackupRequest::OpenSegment {
                master_id: read_u64(&mut cursor)?,
                segment_id: read_u64(&mut cursor)?,
            },
            REQ_WRITE => {
                let master_id = read_u64(&mut cursor)?;
                let segment_id = read_u64(&mut cursor)?;
                let offset = read_u32(&mut cursor)?;
                let length = read_u32(&mut cursor)? as usize;
                let flags = WriteFlags::from_bits(read_u8(&mut cursor)?)?;
                let mut data = vec![0u8; length];
                cursor.read_exact(&mut data).map_err(|_| {
                    Error::BadRequest(format!(
                        "write payload shorter than the {} bytes its header claims",
                        length
                    ))
                })?;
                BackupRequest::WriteSegment {
                    master_id,
                    segment_id,
                    offset,
                    flags,
                    data,
                }
            }
            REQ_CLOSE => BackupRequest::CloseSegment {
                master_id: read_u64(&mut cursor)?,
                segment_id: read_u64(&mut cursor)?,
            },
            REQ_FREE => BackupRequest::FreeSegment {
                master_id: read_u64(&mut cursor)?,
                segment_id: read_u64(&mut cursor)?,
            },
            REQ_START_READING => {
                let master_id = read_u64(&mut cursor)?;
                let length = read_u32(&mut cursor)? as usize;
                let mut partitioning = vec![0u8; length];
                cursor.read_exact(&mut partitioning).map_err(|_| {
                    Error::BadRequest("truncated tablet partitioning".to_string())
                })?;
                BackupRequest::StartReadingData {
                    master_id,
                    partitioning,
                }
            }
            REQ_GET_RECOVERY => BackupRequest::GetRecoveryData {
                master_id: read_u64(&mut cursor)?,
                segment_id: read_u64(&mut cursor)?,
                partition_index: read_u32(&mut cursor)?,
            },
            other => {
                return Err(Error::BadRequest(format!(
                    "unknown request type {}",
                    other
                )))
            }
        };
        Ok(request)
    }
}

/// A response to one [`BackupRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackupResponse {
    /// OpenSegment, WriteSegment, CloseSegment, FreeSegment.
    Empty { status: Status },
    /// StartReadingData.
    SegmentIds {
        status: Status,
        segment_ids: Vec<u64>,
    },
    /// GetRecoveryData.
    RecoveryData {
        status: Status,
        more_entries: bool,
        entries: Vec<u8>,
    },
}

impl BackupResponse {
    pub fn status(&self) -> Status {
        match self {
            BackupResponse::Empty { status } => *status,
            BackupResponse::SegmentIds { status, .. } => *status,
            BackupResponse::RecoveryData { status, .. } => *status,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            BackupResponse::Empty { status } => {
                out.write_u8(*status as u8)?;
            }
            BackupResponse::SegmentIds {
                status,
                segment_ids,
            } => {
                out.write_u8(*status as u8)?;
                out.write_u32::<BigEndian>(segment_ids.len() as u32)?;
                for segment_id in segment_ids {
                    out.write_u64::<BigEndian>(*segment_id)?;
                }
            }
            BackupResponse::RecoveryData {
                status,
                more_entries,
                entries,
            } => {
                out.write_u8(*status as u8)?;
                out.write_u32::<BigEndian>(entries.len() as u32)?;
                out.write_u8(u8::from(*more_entries))?;
                out.write_all(entries)?;
            }
        }
        Ok(out)
    }
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    cursor
        .read_u8()
        .map_err(|_| Error::BadRequest("truncated request header".to_string()))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|_| Error::BadRequest("truncated request header".to_string()))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    cursor
        .read_u64::<BigEndian>()
        .map_err(|_| Error::BadRequest("truncated request header".to_string()))
}
