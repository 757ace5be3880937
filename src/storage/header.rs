use std::convert::TryInto;

use crate::types::checksum::payload_crc32;
use crate::types::{CairnError, Result};

const MAGIC: &[u8; 8] = b"CAIRNKG\0";
/// Size of the fixed header region at offset 0.
pub const HEADER_LEN: usize = 128;
/// Current on-disk format version.
pub const FORMAT_VERSION: u8 = 1;

/// Fixed-size repository header.
///
/// Layout (little-endian):
/// `magic[8] | version u8 | reserved[7] | created i64 | modified i64 |
/// node_count u32 | edge_count u32 | node_index u64 | edge_index u64 |
/// chunk_index u64 | chunk_count u32 | reserved u32 | data_end u64 |
/// reserved[44] | crc32 u32`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Header {
    /// Format version.
    pub version: u8,
    /// Creation time, unix nanoseconds.
    pub created: i64,
    /// Time of the last header rewrite, unix nanoseconds.
    pub modified: i64,
    /// Live nodes.
    pub node_count: u32,
    /// Live links.
    pub edge_count: u32,
    /// Offset of the last persisted node index frame, or 0.
    pub node_index_offset: u64,
    /// Offset of the last persisted link index frame, or 0.
    pub edge_index_offset: u64,
    /// Offset of the last persisted chunk index frame, or 0.
    pub chunk_index_offset: u64,
    /// Live chunks.
    pub chunk_count: u32,
    /// Offset past the last record covered by the persisted indexes.
    pub data_end: u64,
}

impl Header {
    /// Header for an empty repository.
    pub fn new(now: i64) -> Self {
        Self {
            version: FORMAT_VERSION,
            created: now,
            modified: now,
            node_count: 0,
            edge_count: 0,
            node_index_offset: 0,
            edge_index_offset: 0,
            chunk_index_offset: 0,
            chunk_count: 0,
            data_end: HEADER_LEN as u64,
        }
    }

    /// Decodes and checks magic, version and CRC.
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(CairnError::Format(format!(
                "header is {} bytes, expected {HEADER_LEN}",
                data.len()
            )));
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(CairnError::Format("invalid repository magic".into()));
        }
        let version = data[8];
        if version != FORMAT_VERSION {
            return Err(CairnError::Format(format!(
                "unsupported format version {version}"
            )));
        }
        let stored_crc = u32::from_le_bytes(data[124..128].try_into().expect("slice is 4 bytes"));
        if payload_crc32(&data[..124]) != stored_crc {
            return Err(CairnError::Format("header checksum mismatch".into()));
        }
        let u32_at = |at: usize| u32::from_le_bytes(data[at..at + 4].try_into().expect("slice is 4 bytes"));
        let u64_at = |at: usize| u64::from_le_bytes(data[at..at + 8].try_into().expect("slice is 8 bytes"));
        let header = Self {
            version,
            created: u64_at(16) as i64,
            modified: u64_at(24) as i64,
            node_count: u32_at(32),
            edge_count: u32_at(36),
            node_index_offset: u64_at(40),
            edge_index_offset: u64_at(48),
            chunk_index_offset: u64_at(56),
            chunk_count: u32_at(64),
            data_end: u64_at(72),
        };
        if header.data_end < HEADER_LEN as u64 {
            return Err(CairnError::Format(format!(
                "data_end {} points inside the header",
                header.data_end
            )));
        }
        Ok(header)
    }

    /// Encodes into `data`, which must hold at least `HEADER_LEN` bytes.
    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < HEADER_LEN {
            return Err(CairnError::Invalid(
                "header buffer shorter than expected".into(),
            ));
        }
        let data = &mut data[..HEADER_LEN];
        data.fill(0);
        data[..MAGIC.len()].copy_from_slice(MAGIC);
        data[8] = self.version;
        data[16..24].copy_from_slice(&self.created.to_le_bytes());
        data[24..32].copy_from_slice(&self.modified.to_le_bytes());
        data[32..36].copy_from_slice(&self.node_count.to_le_bytes());
        data[36..40].copy_from_slice(&self.edge_count.to_le_bytes());
        data[40..48].copy_from_slice(&self.node_index_offset.to_le_bytes());
        data[48..56].copy_from_slice(&self.edge_index_offset.to_le_bytes());
        data[56..64].copy_from_slice(&self.chunk_index_offset.to_le_bytes());
        data[64..68].copy_from_slice(&self.chunk_count.to_le_bytes());
        data[72..80].copy_from_slice(&self.data_end.to_le_bytes());
        let crc = payload_crc32(&data[..124]);
        data[124..128].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Encodes into a fresh buffer.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        self.write(&mut buf).expect("buffer is header sized");
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut header = Header::new(1_700_000_000);
        header.node_count = 3;
        header.edge_count = 2;
        header.node_index_offset = 4096;
        header.edge_index_offset = 8192;
        header.chunk_index_offset = 2048;
        header.chunk_count = 9;
        header.data_end = 9000;
        let bytes = header.encode();
        assert_eq!(Header::read(&bytes).unwrap(), header);
    }

    #[test]
    fn bad_magic_is_a_format_error() {
        let mut bytes = Header::new(0).encode();
        bytes[0] = b'X';
        let err = Header::read(&bytes).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn corrupted_field_fails_crc() {
        let mut bytes = Header::new(0).encode();
        bytes[33] ^= 0xFF;
        assert!(matches!(Header::read(&bytes), Err(CairnError::Format(_))));
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(Header::read(&[0u8; 16]).is_err());
    }
}
