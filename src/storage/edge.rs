//! Directed, typed links between nodes.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::primitives::bytes::{buf::Cursor, le, tag};
use crate::storage::index::{Index, IndexEntry, IndexFlags, IndexKind};
use crate::storage::node::{decode_tombstone, encode_tombstone};
use crate::storage::record::{RecordFile, RecordKind, RecordLoc};
use crate::types::{CairnError, EntityKind, IndexKey, LinkId, Metadata, NodeId, Result};

/// Metadata key used to break ties between links created at the same instant.
pub const ORDER_KEY: &str = "order";

/// A directed, typed link between two nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Hash of source, target and type.
    pub id: LinkId,
    /// Origin node.
    pub source: NodeId,
    /// Destination node.
    pub target: NodeId,
    /// Bounded type tag.
    pub link_type: String,
    /// User metadata.
    pub metadata: Metadata,
    /// Creation time, unix nanoseconds.
    pub created_at: i64,
    /// Last modification time, unix nanoseconds.
    pub modified_at: i64,
}

impl Link {
    /// Serializes the link record body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let meta = serde_json::to_vec(&self.metadata)?;
        let mut body = Vec::with_capacity(
            88 + self.source.as_str().len() + self.target.as_str().len() + meta.len(),
        );
        le::put_short_bytes(&mut body, self.source.as_str().as_bytes());
        le::put_short_bytes(&mut body, self.target.as_str().as_bytes());
        body.extend_from_slice(&tag::encode(&self.link_type)?);
        le::put_i64(&mut body, self.created_at);
        le::put_i64(&mut body, self.modified_at);
        le::put_long_bytes(&mut body, &meta);
        Ok(body)
    }

    /// Parses a link record body and recomputes its id.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body, "link record");
        let source = NodeId::new(cur.short_str()?)?;
        let target = NodeId::new(cur.short_str()?)?;
        let link_type = tag::decode(&cur.array()?)?;
        let created_at = cur.i64()?;
        let modified_at = cur.i64()?;
        let metadata = Metadata::decode(cur.long_bytes()?)?;
        cur.finish()?;
        Ok(Self {
            id: LinkId::between(&source, &target, &link_type),
            source,
            target,
            link_type,
            metadata,
            created_at,
            modified_at,
        })
    }

    /// True if `node` is either endpoint.
    pub fn touches(&self, node: &NodeId) -> bool {
        &self.source == node || &self.target == node
    }

    /// File-name-safe composite key `<source>-<type>-<target>`.
    pub fn composite_key(&self) -> String {
        format!("{}-{}-{}", self.source, self.link_type, self.target)
    }

    fn order(&self) -> Option<f64> {
        self.metadata.get(ORDER_KEY).and_then(|v| v.as_f64())
    }
}

/// Creation time first, then the `order` metadata field; links carrying an
/// order sort ahead of links without one.
fn link_order(a: &Link, b: &Link) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| match (a.order(), b.order()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

/// Link persistence over the shared record file.
pub struct LinkStore {
    file: Arc<RecordFile>,
    max_metadata_len: usize,
    index: Mutex<Index>,
}

impl LinkStore {
    pub(crate) fn new(file: Arc<RecordFile>, max_metadata_len: usize, index: Index) -> Self {
        Self {
            file,
            max_metadata_len,
            index: Mutex::new(index),
        }
    }

    /// Validates arguments and builds an unwritten link.
    pub(crate) fn prepare(
        &self,
        source: &NodeId,
        target: &NodeId,
        link_type: &str,
        metadata: &Metadata,
        now: i64,
    ) -> Result<Link> {
        metadata.encode_checked(self.max_metadata_len)?;
        let link_type = tag::normalize(link_type).to_string();
        tag::encode(&link_type)?;
        Ok(Link {
            id: LinkId::between(source, target, &link_type),
            source: source.clone(),
            target: target.clone(),
            link_type,
            metadata: metadata.clone(),
            created_at: now,
            modified_at: now,
        })
    }

    pub(crate) fn insert(&self, link: &Link, flags: IndexFlags) -> Result<()> {
        let key = IndexKey::from(link.id);
        let body = link.encode()?;
        let mut index = self.index.lock();
        if index.get_live(&key).is_some() {
            return Err(CairnError::Conflict {
                id: link.composite_key(),
            });
        }
        let loc = self.file.append(RecordKind::Link, &body)?;
        let mut entry = IndexEntry::new(key, loc);
        entry.flags = flags;
        index.insert(entry);
        debug!(link = %link.composite_key(), "link.insert");
        Ok(())
    }

    /// Writes a new link. Endpoint existence is the caller's concern.
    pub fn add(
        &self,
        source: &NodeId,
        target: &NodeId,
        link_type: &str,
        metadata: &Metadata,
        now: i64,
    ) -> Result<Link> {
        let link = self.prepare(source, target, link_type, metadata, now)?;
        self.insert(&link, IndexFlags::NONE)?;
        Ok(link)
    }

    fn read_entry_locked(&self, entry: &IndexEntry) -> Result<Link> {
        let body = self
            .file
            .read(entry.loc(), RecordKind::Link, EntityKind::Link, &entry.key)?;
        let link = Link::decode(&body)
            .map_err(|err| CairnError::integrity(EntityKind::Link, entry.key, err.to_string()))?;
        if IndexKey::from(link.id) != entry.key {
            return Err(CairnError::integrity(
                EntityKind::Link,
                entry.key,
                format!("index points at record for {}", link.composite_key()),
            ));
        }
        Ok(link)
    }

    pub(crate) fn read_entry(&self, entry: &IndexEntry) -> Result<Link> {
        self.read_entry_locked(entry)
    }

    /// Reads a live link by id.
    pub fn get_by_id(&self, id: &LinkId) -> Result<Link> {
        let index = self.index.lock();
        let entry = *index
            .get_live(&IndexKey::from(*id))
            .ok_or_else(|| CairnError::not_found(EntityKind::Link, id))?;
        self.read_entry_locked(&entry)
    }

    /// Finds the `link_type` link from `source` to `target`.
    pub fn find(&self, source: &NodeId, target: &NodeId, link_type: &str) -> Result<Link> {
        let id = LinkId::between(source, target, tag::normalize(link_type));
        self.get_by_id(&id).map_err(|err| match err {
            CairnError::NotFound { .. } => CairnError::not_found(
                EntityKind::Link,
                format!("{source}-{}-{target}", tag::normalize(link_type)),
            ),
            other => other,
        })
    }

    /// Every live link in which `node` is source or target.
    pub fn get(&self, node: &NodeId) -> Result<Vec<Link>> {
        let mut links = self.all()?;
        links.retain(|link| link.touches(node));
        Ok(links)
    }

    /// Every live link, in creation order.
    pub fn all(&self) -> Result<Vec<Link>> {
        let index = self.index.lock();
        let mut links = index
            .iter_live()
            .map(|entry| self.read_entry_locked(entry))
            .collect::<Result<Vec<_>>>()?;
        links.sort_by(link_order);
        Ok(links)
    }

    /// Tombstones the `link_type` link from `source` to `target`.
    pub fn delete(&self, source: &NodeId, target: &NodeId, link_type: &str) -> Result<Link> {
        let link = self.find(source, target, link_type)?;
        self.delete_by_id(&link.id)?;
        Ok(link)
    }

    pub(crate) fn delete_by_id(&self, id: &LinkId) -> Result<()> {
        let key = IndexKey::from(*id);
        let mut index = self.index.lock();
        if index.get_live(&key).is_none() {
            return Err(CairnError::not_found(EntityKind::Link, id));
        }
        self.file
            .append(RecordKind::Tombstone, &encode_tombstone(IndexKind::Link, &key))?;
        index.set_flags(&key, IndexFlags::DELETED);
        debug!(link = %id, "link.delete");
        Ok(())
    }

    /// Makes `link` live, rewriting it only when the stored copy differs.
    pub(crate) fn restore(&self, link: &Link) -> Result<bool> {
        match self.get_by_id(&link.id) {
            Ok(current) if &current == link => Ok(false),
            Ok(_) => {
                let body = link.encode()?;
                let key = IndexKey::from(link.id);
                let mut index = self.index.lock();
                let loc = self.file.append(RecordKind::Link, &body)?;
                let mut entry = IndexEntry::new(key, loc);
                entry.flags = IndexFlags::MODIFIED;
                index.insert(entry);
                Ok(true)
            }
            Err(err) if err.is_not_found() => {
                self.insert(link, IndexFlags::NONE)?;
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// True if a live link has this id.
    pub fn contains(&self, id: &LinkId) -> bool {
        self.index.lock().get_live(&IndexKey::from(*id)).is_some()
    }

    pub(crate) fn set_flags(&self, id: &LinkId, flags: IndexFlags) {
        self.index.lock().set_flags(&IndexKey::from(*id), flags);
    }

    pub(crate) fn clear_flags(&self, id: &LinkId, flags: IndexFlags) {
        self.index.lock().clear_flags(&IndexKey::from(*id), flags);
    }

    /// Number of live links.
    pub fn len(&self) -> usize {
        self.index.lock().live_len()
    }

    /// True when no link is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Folds a link or tombstone frame found past the persisted index.
    pub(crate) fn apply_frame(&self, loc: RecordLoc, kind: RecordKind, body: &[u8]) -> Result<()> {
        let mut index = self.index.lock();
        match kind {
            RecordKind::Link => {
                let link = Link::decode(body)?;
                let key = IndexKey::from(link.id);
                let flags = match index.get(&key) {
                    Some(e) if e.is_live() => e.flags | IndexFlags::MODIFIED,
                    _ => IndexFlags::NONE,
                };
                let mut entry = IndexEntry::new(key, loc);
                entry.flags = flags;
                index.insert(entry);
            }
            RecordKind::Tombstone => {
                let (_, key) = decode_tombstone(body)?;
                index.set_flags(&key, IndexFlags::DELETED);
            }
            other => {
                return Err(CairnError::Format(format!(
                    "{other} frame handed to link store"
                )))
            }
        }
        Ok(())
    }

    pub(crate) fn encode_index(&self) -> Vec<u8> {
        self.index.lock().encode()
    }

    pub(crate) fn entries(&self) -> Vec<IndexEntry> {
        self.index.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::{FileIo, StdFileIo};
    use crate::types::meta::MAX_METADATA_LEN;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> LinkStore {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("links.bin")).unwrap());
        LinkStore::new(
            Arc::new(RecordFile::new(io, 0)),
            MAX_METADATA_LEN,
            Index::new(IndexKind::Link),
        )
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn links_are_visible_from_both_ends() {
        let dir = tempdir().unwrap();
        let links = store(&dir);
        links.add(&id("a"), &id("b"), "ref", &Metadata::new(), 1).unwrap();
        links.add(&id("c"), &id("d"), "ref", &Metadata::new(), 2).unwrap();

        let from_a = links.get(&id("a")).unwrap();
        let from_b = links.get(&id("b")).unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a, from_b);
        assert_eq!(from_a[0].target, id("b"));
    }

    #[test]
    fn distinct_types_may_join_the_same_pair() {
        let dir = tempdir().unwrap();
        let links = store(&dir);
        links.add(&id("a"), &id("b"), "ref", &Metadata::new(), 1).unwrap();
        links.add(&id("a"), &id("b"), "cites", &Metadata::new(), 1).unwrap();
        assert_eq!(links.len(), 2);
        let dup = links
            .add(&id("a"), &id("b"), "ref", &Metadata::new(), 3)
            .unwrap_err();
        assert!(matches!(dup, CairnError::Conflict { .. }));
    }

    #[test]
    fn ties_on_creation_break_by_order_field() {
        let dir = tempdir().unwrap();
        let links = store(&dir);
        let hub = id("hub");
        for (name, order) in [("x", 3i64), ("y", 1), ("z", 2)] {
            let meta = Metadata::new().with(ORDER_KEY, order);
            links.add(&hub, &id(name), "ref", &meta, 100).unwrap();
        }
        links.add(&hub, &id("early"), "ref", &Metadata::new(), 50).unwrap();
        links.add(&hub, &id("plain"), "ref", &Metadata::new(), 100).unwrap();

        let targets: Vec<String> = links
            .get(&hub)
            .unwrap()
            .into_iter()
            .map(|l| l.target.to_string())
            .collect();
        assert_eq!(targets, ["early", "y", "z", "x", "plain"]);
    }

    #[test]
    fn delete_tombstones_only_the_named_link() {
        let dir = tempdir().unwrap();
        let links = store(&dir);
        links.add(&id("a"), &id("b"), "ref", &Metadata::new(), 1).unwrap();
        links.add(&id("a"), &id("b"), "cites", &Metadata::new(), 1).unwrap();
        links.delete(&id("a"), &id("b"), "ref").unwrap();
        let left = links.get(&id("a")).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].link_type, "cites");
        assert!(links
            .delete(&id("a"), &id("b"), "ref")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn oversized_metadata_is_rejected_before_write() {
        let dir = tempdir().unwrap();
        let links = store(&dir);
        let meta = Metadata::new().with("k", "v".repeat(MAX_METADATA_LEN));
        let err = links
            .add(&id("a"), &id("b"), "ref", &meta, 1)
            .unwrap_err();
        assert!(matches!(err, CairnError::Capacity { .. }));
        assert_eq!(links.file.tail(), 0);
    }
}
