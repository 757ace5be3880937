//! Knowledge-graph storage engine.
//!
//! Implements deduplicated chunk storage, node and link records over a
//! single append-only file, the in-memory indexes that locate them, and the
//! repository that ties them to the transaction log.

/// Content-addressed chunk persistence.
///
/// Deduplicates identical byte spans and reference counts them by node.
pub mod chunk;

/// Content-defined chunking.
pub mod chunker;

/// Directed, typed links between nodes.
pub mod edge;

/// Fixed-size repository header.
pub mod header;

/// Per-store index mapping a 32-byte key to a record location.
pub mod index;

/// Node records and their store.
pub mod node;

/// Record framing and the shared append-only file.
///
/// Every record is a `magic | length | crc32 | body` frame.
pub mod record;

mod options;
mod repository;

pub use chunker::{ChunkerConfig, MAX_CHUNK_LEN};
pub use edge::{Link, ORDER_KEY};
pub use header::Header;
pub use index::IndexFlags;
pub use node::Node;
/// Repository configuration options.
pub use options::RepositoryOptions;
/// Main repository interface.
pub use repository::Repository;
