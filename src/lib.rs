//! Cairn: a content-addressable knowledge-graph store.
//!
//! Node content is split into content-defined chunks and stored once per
//! distinct chunk. Nodes and the typed, directed links between them live in
//! a single append-only repository file, and every mutation runs as a
//! transaction in a sidecar log so an interrupted session is rolled back or
//! replayed on the next open.
//!
//! ```no_run
//! use cairn::storage::Repository;
//! use cairn::types::Metadata;
//!
//! # fn main() -> cairn::types::Result<()> {
//! let repo = Repository::open_with_options(
//!     "notes.cairn",
//!     cairn::storage::RepositoryOptions::new().create_if_missing(true),
//! )?;
//! let a = repo.add_node(b"hello", "note", &Metadata::new().with("title", "greeting"))?;
//! let b = repo.add_node(b"world", "note", &Metadata::new())?;
//! repo.add_link(&a, &b, "follows", &Metadata::new())?;
//! assert_eq!(repo.get_links(&a)?.len(), 1);
//! repo.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod admin;
pub mod migration;
pub mod primitives;
pub mod storage;
pub mod types;
