//! Node records: typed, metadata-bearing lists of chunks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::primitives::bytes::{buf::Cursor, le, tag};
use crate::storage::chunk::ChunkStore;
use crate::storage::chunker::ChunkerConfig;
use crate::storage::index::{Index, IndexEntry, IndexFlags, IndexKind};
use crate::storage::record::{RecordFile, RecordKind, RecordLoc};
use crate::types::{
    sha256, CairnError, ChunkId, EntityKind, IndexKey, Metadata, NodeId, Result,
};

/// A node as returned to callers, content included.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Node {
    /// Node identity.
    pub id: NodeId,
    /// Bounded type tag.
    pub node_type: String,
    /// Ordered chunk ids whose concatenation is the content.
    pub chunks: Vec<ChunkId>,
    /// User metadata.
    pub metadata: Metadata,
    /// Creation time, unix nanoseconds.
    pub created_at: i64,
    /// Last modification time, unix nanoseconds.
    pub modified_at: i64,
    /// Reconstructed content.
    #[serde(skip)]
    pub content: Vec<u8>,
}

/// The persisted part of a node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    /// Node identity.
    pub id: NodeId,
    /// Bounded type tag.
    pub node_type: String,
    /// Ordered chunk ids.
    pub chunks: Vec<ChunkId>,
    /// User metadata.
    pub metadata: Metadata,
    /// Creation time, unix nanoseconds.
    pub created_at: i64,
    /// Last modification time, unix nanoseconds.
    pub modified_at: i64,
}

impl NodeRecord {
    fn encode_with_id(&self, id: &str) -> Result<Vec<u8>> {
        let meta = serde_json::to_vec(&self.metadata)?;
        let mut body = Vec::with_capacity(96 + id.len() + self.chunks.len() * 32 + meta.len());
        le::put_short_bytes(&mut body, id.as_bytes());
        body.extend_from_slice(&tag::encode(&self.node_type)?);
        le::put_i64(&mut body, self.created_at);
        le::put_i64(&mut body, self.modified_at);
        le::put_u32(&mut body, self.chunks.len() as u32);
        for chunk in &self.chunks {
            body.extend_from_slice(chunk.as_bytes());
        }
        le::put_long_bytes(&mut body, &meta);
        Ok(body)
    }

    /// Serializes the record body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_with_id(self.id.as_str())
    }

    /// Parses a record body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body, "node record");
        let id = NodeId::new(cur.short_str()?)?;
        let node_type = tag::decode(&cur.array()?)?;
        let created_at = cur.i64()?;
        let modified_at = cur.i64()?;
        let count = cur.u32()? as usize;
        if count.saturating_mul(32) > cur.remaining() {
            return Err(CairnError::Format(format!(
                "node {id} lists {count} chunks beyond record end"
            )));
        }
        let mut chunks = Vec::with_capacity(count);
        for _ in 0..count {
            chunks.push(ChunkId(cur.array()?));
        }
        let metadata = Metadata::decode(cur.long_bytes()?)?;
        cur.finish()?;
        Ok(Self {
            id,
            node_type,
            chunks,
            metadata,
            created_at,
            modified_at,
        })
    }

    /// Identity minted from the record's own serialization (id field empty).
    fn derive_id(&self) -> Result<NodeId> {
        Ok(NodeId::from_digest(sha256(&self.encode_with_id("")?)))
    }

    pub(crate) fn into_node(self, content: Vec<u8>) -> Node {
        Node {
            id: self.id,
            node_type: self.node_type,
            chunks: self.chunks,
            metadata: self.metadata,
            created_at: self.created_at,
            modified_at: self.modified_at,
            content,
        }
    }
}

/// Encodes a tombstone frame body for `kind`/`key`.
pub(crate) fn encode_tombstone(kind: IndexKind, key: &IndexKey) -> Vec<u8> {
    let mut body = Vec::with_capacity(33);
    le::put_u8(&mut body, kind as u8);
    body.extend_from_slice(key.as_bytes());
    body
}

pub(crate) fn decode_tombstone(body: &[u8]) -> Result<(u8, IndexKey)> {
    let mut cur = Cursor::new(body, "tombstone");
    let kind = cur.u8()?;
    let key = IndexKey(cur.array()?);
    cur.finish()?;
    Ok((kind, key))
}

struct NodeState {
    index: Index,
    ids: BTreeMap<IndexKey, NodeId>,
}

/// Node persistence over the shared record file.
pub struct NodeStore {
    file: Arc<RecordFile>,
    chunks: Arc<ChunkStore>,
    chunker: ChunkerConfig,
    max_metadata_len: usize,
    state: Mutex<NodeState>,
}

impl NodeStore {
    pub(crate) fn new(
        file: Arc<RecordFile>,
        chunks: Arc<ChunkStore>,
        chunker: ChunkerConfig,
        max_metadata_len: usize,
        index: Index,
    ) -> Self {
        Self {
            file,
            chunks,
            chunker,
            max_metadata_len,
            state: Mutex::new(NodeState {
                index,
                ids: BTreeMap::new(),
            }),
        }
    }

    /// Validates metadata, stores content chunks, and builds the record.
    ///
    /// Metadata is checked before any chunk is written. With `id == None`
    /// the identity is derived from the record.
    pub(crate) fn prepare(
        &self,
        id: Option<NodeId>,
        content: &[u8],
        node_type: &str,
        metadata: &Metadata,
        now: i64,
    ) -> Result<NodeRecord> {
        metadata.encode_checked(self.max_metadata_len)?;
        let node_type = tag::normalize(node_type).to_string();
        tag::encode(&node_type)?;
        let chunks = self.store_content(content)?;
        let mut record = NodeRecord {
            id: NodeId::from_digest([0u8; 32]),
            node_type,
            chunks,
            metadata: metadata.clone(),
            created_at: now,
            modified_at: now,
        };
        record.id = match id {
            Some(id) => id,
            None => record.derive_id()?,
        };
        Ok(record)
    }

    fn store_content(&self, content: &[u8]) -> Result<Vec<ChunkId>> {
        self.chunker
            .split(content)
            .map(|piece| self.chunks.store(piece))
            .collect()
    }

    /// Builds the replacement record for a content/metadata update.
    pub(crate) fn prepare_update(
        &self,
        current: &NodeRecord,
        content: Option<&[u8]>,
        metadata: Option<&Metadata>,
        now: i64,
    ) -> Result<NodeRecord> {
        if let Some(meta) = metadata {
            meta.encode_checked(self.max_metadata_len)?;
        }
        let chunks = match content {
            Some(bytes) => self.store_content(bytes)?,
            None => current.chunks.clone(),
        };
        Ok(NodeRecord {
            id: current.id.clone(),
            node_type: current.node_type.clone(),
            chunks,
            metadata: metadata.cloned().unwrap_or_else(|| current.metadata.clone()),
            created_at: current.created_at,
            modified_at: now.max(current.modified_at),
        })
    }

    /// Writes a new node; fails with `Conflict` if the id is already live.
    pub(crate) fn insert(&self, record: &NodeRecord, flags: IndexFlags) -> Result<()> {
        let key = record.id.storage_key();
        let body = record.encode()?;
        let mut state = self.state.lock();
        if state.index.get_live(&key).is_some() {
            return Err(CairnError::Conflict {
                id: record.id.to_string(),
            });
        }
        self.chunks.retain(&record.chunks)?;
        let loc = match self.file.append(RecordKind::Node, &body) {
            Ok(loc) => loc,
            Err(err) => {
                self.chunks.release(&record.chunks);
                return Err(err);
            }
        };
        let mut entry = IndexEntry::new(key, loc);
        entry.flags = flags;
        state.index.insert(entry);
        state.ids.insert(key, record.id.clone());
        debug!(node = %record.id, chunks = record.chunks.len(), "node.insert");
        Ok(())
    }

    /// Stores `content` as a new node and returns its derived id.
    pub fn put(&self, content: &[u8], node_type: &str, metadata: &Metadata, now: i64) -> Result<NodeId> {
        let record = self.prepare(None, content, node_type, metadata, now)?;
        self.insert(&record, IndexFlags::NONE)?;
        Ok(record.id)
    }

    /// Stores `content` under a caller-chosen id.
    pub fn put_with_id(
        &self,
        id: NodeId,
        content: &[u8],
        node_type: &str,
        metadata: &Metadata,
        now: i64,
    ) -> Result<()> {
        let record = self.prepare(Some(id), content, node_type, metadata, now)?;
        self.insert(&record, IndexFlags::NONE)
    }

    /// Direct key first, then the hex-decoded key. A hit counts only when
    /// the record stored under it carries the requested id.
    fn resolve(state: &NodeState, id: &NodeId) -> Option<IndexEntry> {
        let owned = |key: &IndexKey| {
            let entry = state.index.get_live(key)?;
            match state.ids.get(key) {
                Some(stored) if !stored.same_node(id) => None,
                _ => Some(*entry),
            }
        };
        owned(&id.direct_key()).or_else(|| id.digest_key().and_then(|key| owned(&key)))
    }

    /// Reads the persisted record for `id` without its content.
    pub fn get_record(&self, id: &NodeId) -> Result<NodeRecord> {
        let state = self.state.lock();
        let entry = Self::resolve(&state, id)
            .ok_or_else(|| CairnError::not_found(EntityKind::Node, id))?;
        let body = self
            .file
            .read(entry.loc(), RecordKind::Node, EntityKind::Node, id)?;
        let record = NodeRecord::decode(&body)
            .map_err(|err| CairnError::integrity(EntityKind::Node, id, err.to_string()))?;
        if record.id.storage_key() != entry.key {
            return Err(CairnError::integrity(
                EntityKind::Node,
                id,
                format!("index points at record for {}", record.id),
            ));
        }
        Ok(record)
    }

    /// Reads a node and reconstructs its content from its chunks.
    pub fn get(&self, id: &NodeId) -> Result<Node> {
        let record = self.get_record(id)?;
        let content = self.read_content(&record)?;
        Ok(record.into_node(content))
    }

    pub(crate) fn read_content(&self, record: &NodeRecord) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        for chunk in &record.chunks {
            content.extend_from_slice(&self.chunks.get(chunk)?);
        }
        Ok(content)
    }

    /// True if a live node has this id.
    pub fn contains(&self, id: &NodeId) -> bool {
        Self::resolve(&self.state.lock(), id).is_some()
    }

    /// Tombstones a node and releases its chunks, returning the removed record.
    pub fn delete(&self, id: &NodeId) -> Result<NodeRecord> {
        let record = self.get_record(id)?;
        let key = record.id.storage_key();
        let mut state = self.state.lock();
        if state.index.get_live(&key).is_none() {
            return Err(CairnError::not_found(EntityKind::Node, id));
        }
        self.file
            .append(RecordKind::Tombstone, &encode_tombstone(IndexKind::Node, &key))?;
        state.index.set_flags(&key, IndexFlags::DELETED);
        state.ids.remove(&key);
        let dropped = self.chunks.release(&record.chunks);
        debug!(node = %record.id, dropped_chunks = dropped.len(), "node.delete");
        Ok(record)
    }

    /// Rewrites a live node's record in place of the old one.
    pub(crate) fn replace(&self, record: &NodeRecord) -> Result<NodeRecord> {
        let previous = self.get_record(&record.id)?;
        let key = record.id.storage_key();
        let body = record.encode()?;
        let mut state = self.state.lock();
        self.chunks.retain(&record.chunks)?;
        let loc = match self.file.append(RecordKind::Node, &body) {
            Ok(loc) => loc,
            Err(err) => {
                self.chunks.release(&record.chunks);
                return Err(err);
            }
        };
        let flags = state
            .index
            .get(&key)
            .map(|e| e.flags)
            .unwrap_or_default();
        let mut entry = IndexEntry::new(key, loc);
        entry.flags = flags | IndexFlags::MODIFIED;
        state.index.insert(entry);
        self.chunks.release(&previous.chunks);
        Ok(previous)
    }

    /// Makes `record` the live version of its node, whatever the current state.
    ///
    /// Used by transaction replay; a no-op when the live record already matches.
    pub(crate) fn restore(&self, record: &NodeRecord) -> Result<bool> {
        match self.get_record(&record.id) {
            Ok(current) if &current == record => Ok(false),
            Ok(_) => {
                self.replace(record)?;
                Ok(true)
            }
            Err(err) if err.is_not_found() => {
                self.insert(record, IndexFlags::NONE)?;
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn set_flags(&self, id: &NodeId, flags: IndexFlags) {
        self.state.lock().index.set_flags(&id.storage_key(), flags);
    }

    pub(crate) fn clear_flags(&self, id: &NodeId, flags: IndexFlags) {
        self.state.lock().index.clear_flags(&id.storage_key(), flags);
    }

    pub(crate) fn flags(&self, id: &NodeId) -> Option<IndexFlags> {
        let state = self.state.lock();
        Self::resolve(&state, id).map(|e| e.flags)
    }

    /// Ids of every live node, in id order.
    pub fn list(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.state.lock().ids.values().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.state.lock().index.live_len()
    }

    /// True when no node is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Folds a node or tombstone frame found past the persisted index.
    pub(crate) fn apply_frame(&self, loc: RecordLoc, kind: RecordKind, body: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        match kind {
            RecordKind::Node => {
                let record = NodeRecord::decode(body)?;
                let key = record.id.storage_key();
                let flags = state
                    .index
                    .get(&key)
                    .map(|e| {
                        let mut f = e.flags;
                        f.remove(IndexFlags::DELETED);
                        if e.is_live() {
                            f |= IndexFlags::MODIFIED;
                        }
                        f
                    })
                    .unwrap_or_default();
                let mut entry = IndexEntry::new(key, loc);
                entry.flags = flags;
                state.index.insert(entry);
            }
            RecordKind::Tombstone => {
                let (_, key) = decode_tombstone(body)?;
                state.index.set_flags(&key, IndexFlags::DELETED);
            }
            other => {
                return Err(CairnError::Format(format!(
                    "{other} frame handed to node store"
                )))
            }
        }
        Ok(())
    }

    /// Reads every live record to rebuild the id map and chunk reference counts.
    pub(crate) fn rebuild(&self) -> Result<HashMap<ChunkId, u32>> {
        let entries: Vec<IndexEntry> = self.state.lock().index.iter_live().copied().collect();
        let mut refs: HashMap<ChunkId, u32> = HashMap::new();
        let mut ids = BTreeMap::new();
        for entry in entries {
            let label = entry.key;
            let body = self
                .file
                .read(entry.loc(), RecordKind::Node, EntityKind::Node, &label)?;
            let record = NodeRecord::decode(&body)?;
            for chunk in &record.chunks {
                *refs.entry(*chunk).or_insert(0) += 1;
            }
            ids.insert(entry.key, record.id);
        }
        self.state.lock().ids = ids;
        Ok(refs)
    }

    pub(crate) fn encode_index(&self) -> Vec<u8> {
        self.state.lock().index.encode()
    }

    pub(crate) fn entries(&self) -> Vec<IndexEntry> {
        self.state.lock().index.iter().copied().collect()
    }

    pub(crate) fn read_entry(&self, entry: &IndexEntry) -> Result<NodeRecord> {
        let body = self
            .file
            .read(entry.loc(), RecordKind::Node, EntityKind::Node, &entry.key)?;
        NodeRecord::decode(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::{FileIo, StdFileIo};
    use crate::types::meta::MAX_METADATA_LEN;
    use tempfile::tempdir;

    fn stores(dir: &tempfile::TempDir) -> (Arc<ChunkStore>, NodeStore) {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("nodes.bin")).unwrap());
        let file = Arc::new(RecordFile::new(io, 0));
        let chunks = Arc::new(ChunkStore::new(file.clone(), Index::new(IndexKind::Chunk)));
        let nodes = NodeStore::new(
            file,
            chunks.clone(),
            ChunkerConfig::default(),
            MAX_METADATA_LEN,
            Index::new(IndexKind::Node),
        );
        (chunks, nodes)
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let (_, nodes) = stores(&dir);
        let meta = Metadata::new().with("title", "x");
        let id = nodes.put(b"hello", "note", &meta, 10).unwrap();
        assert_eq!(id.as_str().len(), 64);
        let node = nodes.get(&id).unwrap();
        assert_eq!(node.content, b"hello");
        assert_eq!(node.node_type, "note");
        assert_eq!(node.metadata, meta);
        assert_eq!(node.created_at, 10);
        assert_eq!(nodes.list(), vec![id]);
    }

    #[test]
    fn record_encoding_roundtrip() {
        let record = NodeRecord {
            id: NodeId::new("custom-id").unwrap(),
            node_type: "doc".into(),
            chunks: vec![ChunkId::of(b"a"), ChunkId::of(b"b")],
            metadata: Metadata::new().with("n", 3i64),
            created_at: -5,
            modified_at: 7,
        };
        assert_eq!(NodeRecord::decode(&record.encode().unwrap()).unwrap(), record);
    }

    #[test]
    fn oversized_metadata_writes_nothing() {
        let dir = tempdir().unwrap();
        let (chunks, nodes) = stores(&dir);
        let meta = Metadata::new().with("blob", "y".repeat(MAX_METADATA_LEN + 1));
        let err = nodes.put(b"content", "note", &meta, 1).unwrap_err();
        assert!(matches!(err, CairnError::Capacity { .. }));
        assert!(chunks.is_empty());
        assert_eq!(nodes.file.tail(), 0);
    }

    #[test]
    fn deleting_one_sharer_keeps_shared_chunks() {
        let dir = tempdir().unwrap();
        let (chunks, nodes) = stores(&dir);
        let a = nodes.put(b"same words", "note", &Metadata::new(), 1).unwrap();
        let b = nodes.put(b"same words", "note", &Metadata::new(), 2).unwrap();
        assert_ne!(a, b);
        assert_eq!(chunks.len(), 1);

        nodes.delete(&a).unwrap();
        assert!(nodes.get(&a).unwrap_err().is_not_found());
        assert_eq!(nodes.get(&b).unwrap().content, b"same words");

        nodes.delete(&b).unwrap();
        assert_eq!(chunks.len(), 0);
    }

    #[test]
    fn put_with_existing_id_conflicts() {
        let dir = tempdir().unwrap();
        let (_, nodes) = stores(&dir);
        let id = NodeId::new("fixed").unwrap();
        nodes
            .put_with_id(id.clone(), b"one", "note", &Metadata::new(), 1)
            .unwrap();
        let err = nodes
            .put_with_id(id.clone(), b"two", "note", &Metadata::new(), 2)
            .unwrap_err();
        assert!(matches!(err, CairnError::Conflict { .. }));
        assert_eq!(nodes.get(&id).unwrap().content, b"one");
    }

    #[test]
    fn replace_keeps_identity_and_marks_modified() {
        let dir = tempdir().unwrap();
        let (_, nodes) = stores(&dir);
        let id = nodes.put(b"draft", "note", &Metadata::new(), 1).unwrap();
        let current = nodes.get_record(&id).unwrap();
        let next = nodes
            .prepare_update(&current, Some(b"final"), None, 5)
            .unwrap();
        let previous = nodes.replace(&next).unwrap();
        assert_eq!(previous, current);
        let node = nodes.get(&id).unwrap();
        assert_eq!(node.content, b"final");
        assert_eq!(node.modified_at, 5);
        assert!(nodes.flags(&id).unwrap().contains(IndexFlags::MODIFIED));
    }

    #[test]
    fn uppercase_digest_resolves_through_fallback() {
        let dir = tempdir().unwrap();
        let (_, nodes) = stores(&dir);
        let id = nodes.put(b"x", "note", &Metadata::new(), 1).unwrap();
        let upper = NodeId::new(id.as_str().to_ascii_uppercase()).unwrap();
        assert_eq!(nodes.get(&upper).unwrap().id, id);
    }
}
