//! In-memory index mapping a 32-byte key to a record location.
//!
//! One index exists per store. It is materialized from the file on open,
//! mutated in memory, and written back as a single `INDX` frame on flush.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::primitives::bytes::{buf::Cursor, le};
use crate::storage::record::RecordLoc;
use crate::types::{CairnError, IndexKey, Result, DIGEST_LEN};

/// Encoded size of one entry: key + offset + length + flags.
pub const INDEX_ENTRY_LEN: usize = DIGEST_LEN + 8 + 4 + 4;

/// Bitset of per-entry state flags.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct IndexFlags(u32);

impl IndexFlags {
    /// No flags set.
    pub const NONE: IndexFlags = IndexFlags(0);
    /// Entry is tombstoned; lookups treat it as absent.
    pub const DELETED: IndexFlags = IndexFlags(1);
    /// Record has been rewritten since creation.
    pub const MODIFIED: IndexFlags = IndexFlags(1 << 1);
    /// Written by a transaction that has not committed yet.
    pub const TEMPORARY: IndexFlags = IndexFlags(1 << 2);

    /// Raw flag bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Flags from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        IndexFlags(bits)
    }

    /// True if every flag in `other` is set.
    pub const fn contains(self, other: IndexFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Clears the flags in `other`.
    pub fn remove(&mut self, other: IndexFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for IndexFlags {
    type Output = IndexFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        IndexFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for IndexFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for IndexFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(IndexFlags::DELETED) {
            names.push("DELETED");
        }
        if self.contains(IndexFlags::MODIFIED) {
            names.push("MODIFIED");
        }
        if self.contains(IndexFlags::TEMPORARY) {
            names.push("TEMPORARY");
        }
        write!(f, "IndexFlags({})", names.join("|"))
    }
}

/// Which store an index block belongs to.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IndexKind {
    /// Chunk store index.
    Chunk = 1,
    /// Node store index.
    Node = 2,
    /// Link store index.
    Link = 3,
}

impl IndexKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(IndexKind::Chunk),
            2 => Ok(IndexKind::Node),
            3 => Ok(IndexKind::Link),
            other => Err(CairnError::Format(format!("unknown index kind {other}"))),
        }
    }
}

/// Location and state of one record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    /// Lookup key.
    pub key: IndexKey,
    /// Frame offset in the repository file.
    pub offset: u64,
    /// Frame length including its header.
    pub len: u32,
    /// Entry state.
    pub flags: IndexFlags,
}

impl IndexEntry {
    /// Entry with no flags.
    pub fn new(key: IndexKey, loc: RecordLoc) -> Self {
        Self {
            key,
            offset: loc.offset,
            len: loc.len,
            flags: IndexFlags::NONE,
        }
    }

    /// Frame location.
    pub fn loc(&self) -> RecordLoc {
        RecordLoc {
            offset: self.offset,
            len: self.len,
        }
    }

    /// False once tombstoned.
    pub fn is_live(&self) -> bool {
        !self.flags.contains(IndexFlags::DELETED)
    }
}

/// Key-ordered map of record locations for one store.
#[derive(Debug)]
pub struct Index {
    kind: IndexKind,
    entries: BTreeMap<IndexKey, IndexEntry>,
}

impl Index {
    /// Empty index for `kind`.
    pub fn new(kind: IndexKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Store this index belongs to.
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Entry for `key`, including tombstoned ones.
    pub fn get(&self, key: &IndexKey) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    /// Entry for `key` unless it is tombstoned.
    pub fn get_live(&self, key: &IndexKey) -> Option<&IndexEntry> {
        self.entries.get(key).filter(|e| e.is_live())
    }

    /// Inserts or replaces an entry, returning the previous one.
    pub fn insert(&mut self, entry: IndexEntry) -> Option<IndexEntry> {
        self.entries.insert(entry.key, entry)
    }

    /// Sets flags on an entry; false if the key is absent.
    pub fn set_flags(&mut self, key: &IndexKey, flags: IndexFlags) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.flags |= flags;
                true
            }
            None => false,
        }
    }

    /// Clears flags on an entry; false if the key is absent.
    pub fn clear_flags(&mut self, key: &IndexKey, flags: IndexFlags) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.flags.remove(flags);
                true
            }
            None => false,
        }
    }

    /// Every entry, tombstones included, in key order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    /// Entries that are not tombstoned.
    pub fn iter_live(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values().filter(|e| e.is_live())
    }

    /// Number of live entries.
    pub fn live_len(&self) -> usize {
        self.iter_live().count()
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Serializes the index as an index-frame body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.entries.len() * INDEX_ENTRY_LEN);
        le::put_u8(&mut out, self.kind as u8);
        le::put_u32(&mut out, self.entries.len() as u32);
        for entry in self.entries.values() {
            out.extend_from_slice(entry.key.as_bytes());
            le::put_u64(&mut out, entry.offset);
            le::put_u32(&mut out, entry.len);
            le::put_u32(&mut out, entry.flags.bits());
        }
        out
    }

    /// Parses an index-frame body, checking its store kind.
    pub fn decode(body: &[u8], expected: IndexKind) -> Result<Self> {
        let mut cur = Cursor::new(body, "index block");
        let kind = IndexKind::from_u8(cur.u8()?)?;
        if kind != expected {
            return Err(CairnError::Format(format!(
                "expected {expected:?} index, found {kind:?}"
            )));
        }
        let count = cur.u32()? as usize;
        if cur.remaining() != count * INDEX_ENTRY_LEN {
            return Err(CairnError::Format(format!(
                "{kind:?} index declares {count} entries but holds {} bytes",
                cur.remaining()
            )));
        }
        let mut index = Index::new(kind);
        for _ in 0..count {
            let key = IndexKey(cur.array()?);
            let offset = cur.u64()?;
            let len = cur.u32()?;
            let flags = IndexFlags::from_bits(cur.u32()?);
            index.insert(IndexEntry {
                key,
                offset,
                len,
                flags,
            });
        }
        cur.finish()?;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sha256;

    fn entry(seed: &[u8], offset: u64) -> IndexEntry {
        IndexEntry::new(IndexKey(sha256(seed)), RecordLoc { offset, len: 64 })
    }

    #[test]
    fn tombstones_hide_entries() {
        let mut index = Index::new(IndexKind::Node);
        let e = entry(b"a", 128);
        index.insert(e);
        assert!(index.get_live(&e.key).is_some());
        index.set_flags(&e.key, IndexFlags::DELETED);
        assert!(index.get_live(&e.key).is_none());
        assert!(index.get(&e.key).is_some());
        assert_eq!(index.live_len(), 0);
        index.clear_flags(&e.key, IndexFlags::DELETED);
        assert_eq!(index.live_len(), 1);
    }

    #[test]
    fn encode_decode_preserves_flags() {
        let mut index = Index::new(IndexKind::Link);
        let a = entry(b"a", 128);
        let b = entry(b"b", 256);
        index.insert(a);
        index.insert(b);
        index.set_flags(&b.key, IndexFlags::MODIFIED | IndexFlags::TEMPORARY);

        let decoded = Index::decode(&index.encode(), IndexKind::Link).unwrap();
        assert_eq!(decoded.len(), 2);
        let flags = decoded.get(&b.key).unwrap().flags;
        assert!(flags.contains(IndexFlags::MODIFIED));
        assert!(flags.contains(IndexFlags::TEMPORARY));
        assert!(!flags.contains(IndexFlags::DELETED));
        assert!(Index::decode(&index.encode(), IndexKind::Node).is_err());
    }

    #[test]
    fn truncated_block_rejected() {
        let mut index = Index::new(IndexKind::Chunk);
        index.insert(entry(b"a", 128));
        let mut bytes = index.encode();
        bytes.pop();
        assert!(Index::decode(&bytes, IndexKind::Chunk).is_err());
    }
}
