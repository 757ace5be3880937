use std::fmt;

/// Kind of entity an error refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntityKind {
    /// A content chunk.
    Chunk,
    /// A graph node.
    Node,
    /// A directed link between nodes.
    Link,
    /// A transaction in the action log.
    Transaction,
    /// The repository header or an index block.
    Repository,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Chunk => "chunk",
            EntityKind::Node => "node",
            EntityKind::Link => "link",
            EntityKind::Transaction => "transaction",
            EntityKind::Repository => "repository",
        };
        f.write_str(name)
    }
}

/// Errors produced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum CairnError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The requested entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of the missing entity.
        kind: EntityKind,
        /// Identity that failed to resolve.
        id: String,
    },
    /// Stored bytes did not match their hash or checksum.
    #[error("integrity error on {kind} {id}: {detail}")]
    Integrity {
        /// Kind of the corrupted entity.
        kind: EntityKind,
        /// Identity of the corrupted entity.
        id: String,
        /// What failed to verify.
        detail: String,
    },
    /// A size ceiling was exceeded before any write happened.
    #[error("{what} is {size} bytes, limit is {limit}")]
    Capacity {
        /// The oversized item.
        what: &'static str,
        /// Observed size in bytes.
        size: usize,
        /// Configured ceiling in bytes.
        limit: usize,
    },
    /// The file is not a repository or its header is unreadable.
    #[error("format: {0}")]
    Format(String),
    /// An identity collided under a policy that does not resolve it.
    #[error("conflict on id {id}")]
    Conflict {
        /// The colliding identity.
        id: String,
    },
    /// A transaction was asked to make an illegal status transition.
    #[error("transaction {id}: {detail}")]
    TransactionState {
        /// Transaction identity.
        id: String,
        /// Description of the rejected transition.
        detail: String,
    },
    /// Metadata or archive JSON failed to (de)serialize.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A caller-supplied argument is malformed.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// An export archive is malformed.
    #[error("archive: {0}")]
    Archive(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CairnError>;

impl CairnError {
    pub(crate) fn not_found(kind: EntityKind, id: impl fmt::Display) -> Self {
        CairnError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn integrity(
        kind: EntityKind,
        id: impl fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        CairnError::Integrity {
            kind,
            id: id.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn txn_state(id: impl fmt::Display, detail: impl Into<String>) -> Self {
        CairnError::TransactionState {
            id: id.to_string(),
            detail: detail.into(),
        }
    }

    /// Returns true for errors that make the repository unusable.
    ///
    /// Only a format error on open is unconditionally fatal; everything else
    /// leaves the handle usable and lets the caller decide.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CairnError::Format(_))
    }

    /// Returns true if this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CairnError::NotFound { .. })
    }
}
