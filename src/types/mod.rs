#![forbid(unsafe_code)]

//! Core identities, metadata values, errors, and checksums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// Checksum primitives used for record framing.
pub mod checksum;
mod error;
/// Tagged metadata values attached to nodes, links and transactions.
pub mod meta;

pub use checksum::{Checksum, Crc32Fast};
pub use error::{CairnError, EntityKind, Result};
pub use meta::{MetaValue, Metadata};

/// Width in bytes of every content digest.
pub const DIGEST_LEN: usize = 32;

/// Longest node id accepted by `put_with_id`.
pub const MAX_NODE_ID_LEN: usize = 256;

const DIRECT_KEY_DOMAIN: &[u8] = b"cairn.node-id\0";

/// Computes the SHA-256 digest of `bytes`.
pub fn sha256(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(bytes).into()
}

/// Current wall-clock time in unix nanoseconds.
pub fn now_nanos() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

macro_rules! digest_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(
            /// Raw SHA-256 digest.
            pub [u8; DIGEST_LEN],
        );

        impl $name {
            /// Returns the raw digest bytes.
            pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
                &self.0
            }

            /// Lowercase hex rendering of the digest.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parses a 64-character hex digest.
            pub fn from_hex(s: &str) -> Result<Self> {
                let mut out = [0u8; DIGEST_LEN];
                hex::decode_to_slice(s, &mut out).map_err(|_| {
                    CairnError::Invalid(format!(
                        "{} must be {} hex characters: {s:?}",
                        stringify!($name),
                        DIGEST_LEN * 2
                    ))
                })?;
                Ok(Self(out))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..12])
            }
        }

        impl FromStr for $name {
            type Err = CairnError;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

digest_id!(
    /// SHA-256 identity of a chunk's bytes.
    ChunkId
);
digest_id!(
    /// Identity of a link: SHA-256 over source, target and type.
    LinkId
);
digest_id!(
    /// Identity of a transaction in the action log.
    TxId
);
digest_id!(
    /// 32-byte key under which an entity is stored in an index.
    IndexKey
);

impl ChunkId {
    /// Hashes `bytes` into a chunk identity.
    pub fn of(bytes: &[u8]) -> Self {
        ChunkId(sha256(bytes))
    }
}

impl LinkId {
    /// Derives the identity of the `link_type` edge from `source` to `target`.
    ///
    /// Both endpoints are length-prefixed so `("ab","c")` and `("a","bc")`
    /// never collide.
    pub fn between(source: &NodeId, target: &NodeId, link_type: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [source.as_str(), target.as_str(), link_type] {
            hasher.update((part.len() as u32).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        LinkId(hasher.finalize().into())
    }
}

impl From<ChunkId> for IndexKey {
    fn from(id: ChunkId) -> Self {
        IndexKey(id.0)
    }
}

impl From<LinkId> for IndexKey {
    fn from(id: LinkId) -> Self {
        IndexKey(id.0)
    }
}

/// Identity of a node.
///
/// Ids minted by the repository are the lowercase hex SHA-256 of the node's
/// serialized record. Imported or renamed nodes may carry arbitrary ids.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Validates and wraps an id string.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_NODE_ID_LEN {
            return Err(CairnError::Invalid(format!(
                "node id must be 1..={MAX_NODE_ID_LEN} bytes, got {}",
                id.len()
            )));
        }
        if id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_whitespace())
        {
            return Err(CairnError::Invalid(format!(
                "node id contains a reserved character: {id:?}"
            )));
        }
        Ok(NodeId(id))
    }

    pub(crate) fn from_digest(digest: [u8; DIGEST_LEN]) -> Self {
        NodeId(hex::encode(digest))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key used for direct index lookups: SHA-256 of the id string under a
    /// fixed domain prefix, so it never coincides with the decoded digest
    /// of the hex id `hex(sha256(id))`.
    pub fn direct_key(&self) -> IndexKey {
        let mut hasher = Sha256::new();
        hasher.update(DIRECT_KEY_DOMAIN);
        hasher.update(self.0.as_bytes());
        IndexKey(hasher.finalize().into())
    }

    /// Key obtained by decoding the id itself as a hex digest, if it is one.
    pub fn digest_key(&self) -> Option<IndexKey> {
        IndexKey::from_hex(&self.0.to_ascii_lowercase()).ok()
    }

    /// Key under which a node with this id is written.
    pub fn storage_key(&self) -> IndexKey {
        self.digest_key().unwrap_or_else(|| self.direct_key())
    }

    /// Whether `other` names the same node. Hex ids compare without regard
    /// to case.
    pub fn same_node(&self, other: &NodeId) -> bool {
        self == other
            || matches!((self.digest_key(), other.digest_key()), (Some(a), Some(b)) if a == b)
    }

    /// Returns a new id with `prefix` prepended.
    pub fn with_prefix(&self, prefix: &str) -> Result<Self> {
        NodeId::new(format!("{prefix}{}", self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl FromStr for NodeId {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        NodeId::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = CairnError;

    fn try_from(value: String) -> Result<Self> {
        NodeId::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
