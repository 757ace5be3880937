//! Tar layout shared by export and import.
//!
//! ```text
//! manifest.json
//! nodes/<id>.json
//! edges/<source>-<type>-<target>.json
//! chunks/<sha256 hex>
//! ```

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, Header};
use tracing::warn;

use crate::storage::{Link, Node};
use crate::types::{CairnError, ChunkId, Metadata, NodeId, Result};

/// Version written into every manifest.
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// Entry names inside an archive.
pub mod paths {
    /// The manifest.
    pub const MANIFEST: &str = "manifest.json";
    /// Directory of node documents.
    pub const NODES: &str = "nodes/";
    /// Directory of edge documents.
    pub const EDGES: &str = "edges/";
    /// Directory of raw chunks named by hash.
    pub const CHUNKS: &str = "chunks/";
}

/// Summary of an archive's contents, written last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Archive layout version.
    pub version: u32,
    /// When the archive was written, unix nanoseconds.
    pub created_at: i64,
    /// Last modification time of the source repository.
    pub modified_at: i64,
    /// Number of node documents.
    pub node_count: usize,
    /// Number of edge documents.
    pub edge_count: usize,
    /// Number of chunk entries.
    pub chunk_count: usize,
    /// Ids of every exported node, in export order.
    pub node_ids: Vec<NodeId>,
    /// `<source>-<type>-<target>` key of every exported edge.
    pub edge_keys: Vec<String>,
}

/// One `nodes/<id>.json` document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Node id in the source repository.
    pub id: NodeId,
    /// Type tag.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Ordered chunk hashes; content is their concatenation.
    pub chunks: Vec<ChunkId>,
    /// Content length in bytes.
    pub size: u64,
    /// User metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Creation time, unix nanoseconds.
    pub created_at: i64,
    /// Last modification time, unix nanoseconds.
    pub modified_at: i64,
}

impl NodeEntry {
    pub(crate) fn from_node(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            node_type: node.node_type.clone(),
            chunks: node.chunks.clone(),
            size: node.content.len() as u64,
            metadata: node.metadata.clone(),
            created_at: node.created_at,
            modified_at: node.modified_at,
        }
    }
}

/// One `edges/<key>.json` document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeEntry {
    /// Source node id in the source repository.
    pub source: NodeId,
    /// Target node id in the source repository.
    pub target: NodeId,
    /// Link type tag.
    #[serde(rename = "type")]
    pub link_type: String,
    /// Link metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Creation time, unix nanoseconds.
    pub created_at: i64,
    /// Last modification time, unix nanoseconds.
    pub modified_at: i64,
}

impl EdgeEntry {
    pub(crate) fn from_link(link: &Link) -> Self {
        Self {
            source: link.source.clone(),
            target: link.target.clone(),
            link_type: link.link_type.clone(),
            metadata: link.metadata.clone(),
            created_at: link.created_at,
            modified_at: link.modified_at,
        }
    }

    /// `<source>-<type>-<target>`.
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.source, self.link_type, self.target)
    }
}

fn archive_err(what: &str, err: impl std::fmt::Display) -> CairnError {
    CairnError::Archive(format!("{what}: {err}"))
}

/// Type tags may hold path separators; entry names must not.
fn path_safe(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

/// Streams entries into a tar archive.
pub(crate) struct ArchiveWriter<W: Write> {
    builder: Builder<W>,
    entries: usize,
}

impl<W: Write> ArchiveWriter<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            builder: Builder::new(writer),
            entries: 0,
        }
    }

    fn add_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        // Ids run to 256 bytes; append_data emits GNU long-name records.
        self.builder
            .append_data(&mut header, path, data)
            .map_err(|e| archive_err(&format!("append {path}"), e))?;
        self.entries += 1;
        Ok(())
    }

    fn add_json<T: Serialize>(&mut self, path: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.add_file(path, &data)
    }

    pub(crate) fn add_node(&mut self, entry: &NodeEntry) -> Result<()> {
        self.add_json(&format!("{}{}.json", paths::NODES, entry.id), entry)
    }

    pub(crate) fn add_edge(&mut self, entry: &EdgeEntry) -> Result<()> {
        let name = format!(
            "{}{}-{}-{}.json",
            paths::EDGES,
            entry.source,
            path_safe(&entry.link_type),
            entry.target
        );
        self.add_json(&name, entry)
    }

    pub(crate) fn add_chunk(&mut self, id: &ChunkId, bytes: &[u8]) -> Result<()> {
        self.add_file(&format!("{}{}", paths::CHUNKS, id.to_hex()), bytes)
    }

    pub(crate) fn finish(mut self, manifest: &Manifest) -> Result<W> {
        self.add_json(paths::MANIFEST, manifest)?;
        self.builder
            .into_inner()
            .map_err(|e| archive_err("tar finish", e))
    }
}

/// Everything read from an archive, classified but not yet applied.
#[derive(Debug, Default)]
pub struct ArchiveContents {
    /// The manifest, if the archive carried one.
    pub manifest: Option<Manifest>,
    /// Node documents in archive order.
    pub nodes: Vec<NodeEntry>,
    /// Edge documents in archive order.
    pub edges: Vec<EdgeEntry>,
    /// Verified chunk bytes keyed by hash.
    pub chunks: Vec<(ChunkId, Vec<u8>)>,
}

impl ArchiveContents {
    /// Reads and classifies every entry of a tar stream.
    ///
    /// Chunk bytes are re-hashed against their entry name. Unknown entries
    /// are skipped with a warning.
    pub fn read<R: Read>(reader: R) -> Result<Self> {
        let mut archive = Archive::new(reader);
        let mut out = ArchiveContents::default();
        for entry in archive
            .entries()
            .map_err(|e| archive_err("read entries", e))?
        {
            let mut entry = entry.map_err(|e| archive_err("read entry", e))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .map_err(|e| archive_err("entry path", e))?
                .to_string_lossy()
                .into_owned();
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| archive_err(&format!("read {name}"), e))?;

            if name == paths::MANIFEST {
                out.manifest = Some(
                    serde_json::from_slice(&data).map_err(|e| archive_err(&name, e))?,
                );
            } else if name.starts_with(paths::NODES) {
                out.nodes
                    .push(serde_json::from_slice(&data).map_err(|e| archive_err(&name, e))?);
            } else if name.starts_with(paths::EDGES) {
                out.edges
                    .push(serde_json::from_slice(&data).map_err(|e| archive_err(&name, e))?);
            } else if let Some(hex) = name.strip_prefix(paths::CHUNKS) {
                let id = ChunkId::from_hex(hex).map_err(|e| archive_err(&name, e))?;
                if ChunkId::of(&data) != id {
                    return Err(archive_err(&name, "bytes do not hash to the entry name"));
                }
                out.chunks.push((id, data));
            } else {
                warn!(entry = %name, "archive.unknown_entry");
            }
        }
        out.validate()?;
        Ok(out)
    }

    /// Cross-checks the manifest against what was read.
    fn validate(&self) -> Result<()> {
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| CairnError::Archive(format!("missing {}", paths::MANIFEST)))?;
        if manifest.version != ARCHIVE_FORMAT_VERSION {
            return Err(CairnError::Archive(format!(
                "unsupported archive version {}",
                manifest.version
            )));
        }
        let counts = [
            ("node", manifest.node_count, self.nodes.len()),
            ("edge", manifest.edge_count, self.edges.len()),
            ("chunk", manifest.chunk_count, self.chunks.len()),
        ];
        for (what, declared, found) in counts {
            if declared != found {
                return Err(CairnError::Archive(format!(
                    "manifest declares {declared} {what} entries, archive holds {found}"
                )));
            }
        }
        Ok(())
    }
}
