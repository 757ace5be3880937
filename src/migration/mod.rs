//! Export and import of repositories as tar archives.
//!
//! An archive is self-describing: node and edge documents are JSON, chunks
//! are raw bytes named by their hash, and a manifest records counts and ids
//! for cross-checking on import.

/// Archive layout and the manifest.
pub mod archive;
mod export;
mod import;

pub use archive::{ArchiveContents, EdgeEntry, Manifest, NodeEntry, ARCHIVE_FORMAT_VERSION};
pub use export::{export, export_subgraph, export_to_path, ExportScope, ExportSummary};
pub use import::{import, import_from_path, ConflictPolicy, ImportOptions, ImportSummary};
