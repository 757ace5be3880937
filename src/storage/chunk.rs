//! Deduplicated, content-addressed chunk persistence.
//!
//! Chunks are reference counted by the nodes that list them. A chunk whose
//! count drops to zero is tombstoned rather than erased; storing the same
//! bytes again revives it in place.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::bytes::{buf::Cursor, le};
use crate::storage::chunker::MAX_CHUNK_LEN;
use crate::storage::index::{Index, IndexEntry, IndexFlags};
#[cfg(test)]
use crate::storage::index::IndexKind;
use crate::storage::record::{RecordFile, RecordKind, RecordLoc};
use crate::types::checksum::payload_crc32;
use crate::types::{CairnError, ChunkId, EntityKind, IndexKey, Result};

struct ChunkState {
    index: Index,
    refs: HashMap<ChunkId, u32>,
}

/// Content-addressed chunk store over the shared record file.
pub struct ChunkStore {
    file: Arc<RecordFile>,
    state: Mutex<ChunkState>,
}

pub(crate) fn encode_chunk_body(id: &ChunkId, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(36 + payload.len());
    body.extend_from_slice(id.as_bytes());
    le::put_u32(&mut body, payload_crc32(payload));
    body.extend_from_slice(payload);
    body
}

/// Splits a chunk body and re-verifies both the hash and the checksum.
pub(crate) fn decode_chunk_body(body: &[u8], expected: Option<&ChunkId>) -> Result<(ChunkId, Vec<u8>)> {
    let mut cur = Cursor::new(body, "chunk record");
    let stored = ChunkId(cur.array()?);
    let crc = cur.u32()?;
    let payload = cur.take(cur.remaining())?;
    if let Some(expected) = expected {
        if &stored != expected {
            return Err(CairnError::integrity(
                EntityKind::Chunk,
                expected,
                format!("record holds chunk {stored}"),
            ));
        }
    }
    if payload_crc32(payload) != crc {
        return Err(CairnError::integrity(
            EntityKind::Chunk,
            stored,
            "payload checksum mismatch",
        ));
    }
    if ChunkId::of(payload) != stored {
        return Err(CairnError::integrity(
            EntityKind::Chunk,
            stored,
            "payload hash mismatch",
        ));
    }
    Ok((stored, payload.to_vec()))
}

impl ChunkStore {
    pub(crate) fn new(file: Arc<RecordFile>, index: Index) -> Self {
        Self {
            file,
            state: Mutex::new(ChunkState {
                index,
                refs: HashMap::new(),
            }),
        }
    }

    /// Stores `bytes`, returning its identity. Identical bytes are written once.
    pub fn store(&self, bytes: &[u8]) -> Result<ChunkId> {
        if bytes.len() > MAX_CHUNK_LEN {
            return Err(CairnError::Capacity {
                what: "chunk",
                size: bytes.len(),
                limit: MAX_CHUNK_LEN,
            });
        }
        let id = ChunkId::of(bytes);
        let key = IndexKey::from(id);
        let mut state = self.state.lock();
        if let Some(entry) = state.index.get(&key) {
            if !entry.is_live() {
                state.index.clear_flags(&key, IndexFlags::DELETED);
                debug!(chunk = %id, "chunk.revive");
            }
            return Ok(id);
        }
        let loc = self
            .file
            .append(RecordKind::Chunk, &encode_chunk_body(&id, bytes))?;
        state.index.insert(IndexEntry::new(key, loc));
        Ok(id)
    }

    /// Reads a chunk, re-verifying its hash and checksum.
    pub fn get(&self, id: &ChunkId) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let entry = state
            .index
            .get_live(&IndexKey::from(*id))
            .ok_or_else(|| CairnError::not_found(EntityKind::Chunk, id))?;
        let body = self
            .file
            .read(entry.loc(), RecordKind::Chunk, EntityKind::Chunk, id)?;
        let (_, payload) = decode_chunk_body(&body, Some(id))?;
        Ok(payload)
    }

    /// True if the chunk is stored intact; integrity failures yield `false`.
    pub fn verify(&self, id: &ChunkId) -> Result<bool> {
        match self.get(id) {
            Ok(_) => Ok(true),
            Err(CairnError::Integrity { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.state
            .lock()
            .index
            .get_live(&IndexKey::from(*id))
            .is_some()
    }

    /// Number of live chunks.
    pub fn len(&self) -> usize {
        self.state.lock().index.live_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities of every live chunk.
    pub fn ids(&self) -> Vec<ChunkId> {
        self.state
            .lock()
            .index
            .iter_live()
            .map(|e| ChunkId(e.key.0))
            .collect()
    }

    pub fn ref_count(&self, id: &ChunkId) -> u32 {
        self.state.lock().refs.get(id).copied().unwrap_or(0)
    }

    /// Takes one reference on each listed chunk, reviving tombstoned ones.
    pub(crate) fn retain(&self, ids: &[ChunkId]) -> Result<()> {
        let mut state = self.state.lock();
        for id in ids {
            let key = IndexKey::from(*id);
            if state.index.get(&key).is_none() {
                return Err(CairnError::not_found(EntityKind::Chunk, id));
            }
        }
        for id in ids {
            state
                .index
                .clear_flags(&IndexKey::from(*id), IndexFlags::DELETED);
            *state.refs.entry(*id).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Drops one reference per listed chunk; chunks reaching zero are
    /// tombstoned and returned.
    pub(crate) fn release(&self, ids: &[ChunkId]) -> Vec<ChunkId> {
        let mut state = self.state.lock();
        let mut dropped = Vec::new();
        for id in ids {
            let remaining = match state.refs.get_mut(id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining == 0 {
                state.refs.remove(id);
                if state
                    .index
                    .set_flags(&IndexKey::from(*id), IndexFlags::DELETED)
                {
                    dropped.push(*id);
                }
            }
        }
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "chunk.tombstone");
        }
        dropped
    }

    /// Installs reference counts rebuilt from live node records.
    pub(crate) fn reset_refs(&self, refs: HashMap<ChunkId, u32>) {
        let mut state = self.state.lock();
        for id in refs.keys() {
            state
                .index
                .clear_flags(&IndexKey::from(*id), IndexFlags::DELETED);
        }
        state.refs = refs;
    }

    /// Folds a chunk frame found past the persisted index into the index.
    pub(crate) fn apply_frame(&self, loc: RecordLoc, body: &[u8]) -> Result<()> {
        let mut cur = Cursor::new(body, "chunk record");
        let key = IndexKey(cur.array()?);
        let mut state = self.state.lock();
        state.index.insert(IndexEntry::new(key, loc));
        Ok(())
    }

    pub(crate) fn encode_index(&self) -> Vec<u8> {
        self.state.lock().index.encode()
    }

    pub(crate) fn entries(&self) -> Vec<IndexEntry> {
        self.state.lock().index.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::{FileIo, StdFileIo};
    use crate::storage::record::FRAME_HEADER_LEN;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> ChunkStore {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("chunks.bin")).unwrap());
        ChunkStore::new(Arc::new(RecordFile::new(io, 0)), Index::new(IndexKind::Chunk))
    }

    #[test]
    fn identical_bytes_are_stored_once() {
        let dir = tempdir().unwrap();
        let chunks = store(&dir);
        let a = chunks.store(b"hello").unwrap();
        let tail = chunks.file.tail();
        let b = chunks.store(b"hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(chunks.file.tail(), tail, "dedup must not append");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks.get(&a).unwrap(), b"hello");
    }

    #[test]
    fn corruption_is_surfaced_not_repaired() {
        let dir = tempdir().unwrap();
        let chunks = store(&dir);
        let id = chunks.store(b"precious bytes").unwrap();
        let entry = chunks.entries()[0];
        let payload_off = entry.offset + FRAME_HEADER_LEN as u64 + 36;
        chunks.file.io().write_at(payload_off, b"P").unwrap();
        assert!(matches!(
            chunks.get(&id),
            Err(CairnError::Integrity { .. })
        ));
        assert!(!chunks.verify(&id).unwrap());
    }

    #[test]
    fn release_to_zero_tombstones_and_store_revives() {
        let dir = tempdir().unwrap();
        let chunks = store(&dir);
        let id = chunks.store(b"shared").unwrap();
        chunks.retain(&[id]).unwrap();
        chunks.retain(&[id]).unwrap();
        assert_eq!(chunks.ref_count(&id), 2);

        assert!(chunks.release(&[id]).is_empty());
        assert_eq!(chunks.get(&id).unwrap(), b"shared");

        assert_eq!(chunks.release(&[id]), vec![id]);
        assert!(chunks.get(&id).unwrap_err().is_not_found());

        let tail = chunks.file.tail();
        assert_eq!(chunks.store(b"shared").unwrap(), id);
        assert_eq!(chunks.file.tail(), tail);
        assert_eq!(chunks.get(&id).unwrap(), b"shared");
    }

    #[test]
    fn oversized_chunk_rejected_before_write() {
        let dir = tempdir().unwrap();
        let chunks = store(&dir);
        let err = chunks.store(&vec![0u8; MAX_CHUNK_LEN + 1]).unwrap_err();
        assert!(matches!(err, CairnError::Capacity { .. }));
        assert_eq!(chunks.file.tail(), 0);
    }

    #[test]
    fn retain_unknown_chunk_is_not_found() {
        let dir = tempdir().unwrap();
        let chunks = store(&dir);
        let err = chunks.retain(&[ChunkId::of(b"nope")]).unwrap_err();
        assert!(err.is_not_found());
    }
}
