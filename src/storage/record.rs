//! Framed records in the append-only region of the repository file.
//!
//! Every record is `magic(4) | body_len(u32) | crc32(u32) | body`. The CRC
//! covers magic, length and body, so a frame relabelled as another kind or a
//! torn write both fail verification.

use std::convert::TryInto;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::checksum::record_crc32;
use crate::types::{CairnError, EntityKind, Result};

/// Bytes preceding every record body.
pub const FRAME_HEADER_LEN: usize = 12;

/// Largest body a single frame may carry.
pub const MAX_FRAME_BODY: usize = 64 * 1024 * 1024;

/// Kind of a frame, identified by its magic.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecordKind {
    /// Raw chunk bytes.
    Chunk,
    /// Node record.
    Node,
    /// Link record.
    Link,
    /// Deletion marker for a node or link.
    Tombstone,
    /// Persisted index snapshot.
    Index,
    /// Transaction log entry.
    Transaction,
}

impl RecordKind {
    /// Four magic bytes opening the frame.
    pub const fn magic(self) -> [u8; 4] {
        match self {
            RecordKind::Chunk => *b"CHNK",
            RecordKind::Node => *b"NODE",
            RecordKind::Link => *b"LINK",
            RecordKind::Tombstone => *b"TOMB",
            RecordKind::Index => *b"INDX",
            RecordKind::Transaction => *b"TXNR",
        }
    }

    /// Kind for `magic`; `Format` error if unknown.
    pub fn from_magic(magic: [u8; 4]) -> Result<Self> {
        match &magic {
            b"CHNK" => Ok(RecordKind::Chunk),
            b"NODE" => Ok(RecordKind::Node),
            b"LINK" => Ok(RecordKind::Link),
            b"TOMB" => Ok(RecordKind::Tombstone),
            b"INDX" => Ok(RecordKind::Index),
            b"TXNR" => Ok(RecordKind::Transaction),
            other => Err(CairnError::Format(format!(
                "unknown record magic {:02X?}",
                other
            ))),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let magic = self.magic();
        f.write_str(std::str::from_utf8(&magic).unwrap_or("????"))
    }
}

/// Decoded frame header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    /// Frame kind.
    pub kind: RecordKind,
    /// Body length in bytes.
    pub body_len: u32,
    /// CRC32 over magic and body.
    pub crc32: u32,
}

impl FrameHeader {
    /// Parses a frame header, bounding the body length.
    pub fn decode(bytes: &[u8; FRAME_HEADER_LEN]) -> Result<Self> {
        let magic: [u8; 4] = bytes[0..4].try_into().expect("slice has 4 bytes");
        let kind = RecordKind::from_magic(magic)?;
        let body_len = u32::from_le_bytes(bytes[4..8].try_into().expect("slice has 4 bytes"));
        let crc32 = u32::from_le_bytes(bytes[8..12].try_into().expect("slice has 4 bytes"));
        if body_len as usize > MAX_FRAME_BODY {
            return Err(CairnError::Format(format!(
                "{kind} frame claims {body_len} bytes"
            )));
        }
        Ok(Self {
            kind,
            body_len,
            crc32,
        })
    }

    /// Header plus body length.
    pub fn frame_len(&self) -> u64 {
        FRAME_HEADER_LEN as u64 + self.body_len as u64
    }
}

/// Frames `body` with magic, length and CRC.
pub fn encode_frame(kind: RecordKind, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_FRAME_BODY {
        return Err(CairnError::Capacity {
            what: "record body",
            size: body.len(),
            limit: MAX_FRAME_BODY,
        });
    }
    let magic = kind.magic();
    let mut buffer = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buffer.extend_from_slice(&magic);
    buffer.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&record_crc32(&magic, body).to_le_bytes());
    buffer.extend_from_slice(body);
    Ok(buffer)
}

/// Location of a frame inside the file.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RecordLoc {
    /// Offset of the frame header.
    pub offset: u64,
    /// Total frame length.
    pub len: u32,
}

/// Outcome of scanning a region of frames.
pub enum ScanStep {
    /// A complete, CRC-checked frame.
    Frame {
        /// Where the frame sits.
        loc: RecordLoc,
        /// Frame kind.
        kind: RecordKind,
        /// Frame body.
        body: Vec<u8>,
    },
    /// A frame that is incomplete or fails its CRC; nothing after it is trusted.
    Torn {
        /// Offset of the bad frame.
        offset: u64,
        /// Why it was rejected.
        reason: String,
    },
    /// Reached the end of the region.
    End,
}

/// Append-only frame writer and positioned reader shared by all stores.
pub struct RecordFile {
    io: Arc<dyn FileIo>,
    tail: Mutex<u64>,
}

impl RecordFile {
    /// Wraps `io`, appending from `tail`.
    pub fn new(io: Arc<dyn FileIo>, tail: u64) -> Self {
        Self {
            io,
            tail: Mutex::new(tail),
        }
    }

    /// Underlying file.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.io
    }

    /// Offset where the next frame will be written.
    pub fn tail(&self) -> u64 {
        *self.tail.lock()
    }

    /// Appends one frame at end of file.
    pub fn append(&self, kind: RecordKind, body: &[u8]) -> Result<RecordLoc> {
        let frame = encode_frame(kind, body)?;
        let len: u32 = frame.len().try_into().map_err(|_| CairnError::Capacity {
            what: "record frame",
            size: frame.len(),
            limit: u32::MAX as usize,
        })?;
        let mut tail = self.tail.lock();
        let offset = *tail;
        self.io.write_at(offset, &frame)?;
        *tail = offset + len as u64;
        debug!(kind = %kind, offset, len, "record.append");
        Ok(RecordLoc { offset, len })
    }

    /// Reads and verifies the frame at `loc`, returning its body.
    pub fn read(
        &self,
        loc: RecordLoc,
        expected: RecordKind,
        entity: EntityKind,
        id: &dyn fmt::Display,
    ) -> Result<Vec<u8>> {
        if (loc.len as usize) < FRAME_HEADER_LEN {
            return Err(CairnError::integrity(entity, id, "index length shorter than frame header"));
        }
        let mut frame = vec![0u8; loc.len as usize];
        self.io.read_at(loc.offset, &mut frame)?;
        let header_bytes: [u8; FRAME_HEADER_LEN] = frame[..FRAME_HEADER_LEN]
            .try_into()
            .expect("slice has header length");
        let header = FrameHeader::decode(&header_bytes)
            .map_err(|err| CairnError::integrity(entity, id, err.to_string()))?;
        if header.kind != expected {
            return Err(CairnError::integrity(
                entity,
                id,
                format!("expected {expected} frame, found {}", header.kind),
            ));
        }
        if header.frame_len() != loc.len as u64 {
            return Err(CairnError::integrity(
                entity,
                id,
                format!(
                    "frame length {} disagrees with index length {}",
                    header.frame_len(),
                    loc.len
                ),
            ));
        }
        let body = frame.split_off(FRAME_HEADER_LEN);
        if record_crc32(&header.kind.magic(), &body) != header.crc32 {
            return Err(CairnError::integrity(entity, id, "record checksum mismatch"));
        }
        Ok(body)
    }

    /// Reads the frame starting at `offset`, without an index to guide it.
    pub fn scan_at(&self, offset: u64, end: u64) -> Result<ScanStep> {
        if offset >= end {
            return Ok(ScanStep::End);
        }
        if end - offset < FRAME_HEADER_LEN as u64 {
            return Ok(ScanStep::Torn {
                offset,
                reason: "partial frame header".into(),
            });
        }
        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        self.io.read_at(offset, &mut header_bytes)?;
        let header = match FrameHeader::decode(&header_bytes) {
            Ok(header) => header,
            Err(err) => {
                return Ok(ScanStep::Torn {
                    offset,
                    reason: err.to_string(),
                })
            }
        };
        if offset + header.frame_len() > end {
            return Ok(ScanStep::Torn {
                offset,
                reason: format!("{} frame runs past end of file", header.kind),
            });
        }
        let mut body = vec![0u8; header.body_len as usize];
        self.io.read_at(offset + FRAME_HEADER_LEN as u64, &mut body)?;
        if record_crc32(&header.kind.magic(), &body) != header.crc32 {
            return Ok(ScanStep::Torn {
                offset,
                reason: format!("{} frame checksum mismatch", header.kind),
            });
        }
        Ok(ScanStep::Frame {
            loc: RecordLoc {
                offset,
                len: header.frame_len() as u32,
            },
            kind: header.kind,
            body,
        })
    }

    /// Walks frames from `from` to end of file, handing each to `visit`.
    ///
    /// A torn tail is truncated away and the tail pointer reset to the last
    /// intact frame. Returns the number of frames visited.
    pub fn replay_tail(
        &self,
        from: u64,
        mut visit: impl FnMut(RecordLoc, RecordKind, Vec<u8>) -> Result<()>,
    ) -> Result<u64> {
        let end = self.io.len()?;
        let mut offset = from;
        let mut visited = 0u64;
        loop {
            match self.scan_at(offset, end)? {
                ScanStep::Frame { loc, kind, body } => {
                    offset = loc.offset + loc.len as u64;
                    visit(loc, kind, body)?;
                    visited += 1;
                }
                ScanStep::Torn { offset: at, reason } => {
                    warn!(offset = at, reason = %reason, "record.torn_tail_truncated");
                    self.io.truncate(at)?;
                    offset = at;
                    break;
                }
                ScanStep::End => break,
            }
        }
        *self.tail.lock() = offset;
        Ok(visited)
    }
}
