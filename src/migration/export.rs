use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info};

use crate::migration::archive::{
    ArchiveWriter, EdgeEntry, Manifest, NodeEntry, ARCHIVE_FORMAT_VERSION,
};
use crate::storage::{Link, Repository};
use crate::types::{now_nanos, CairnError, ChunkId, EntityKind, LinkId, NodeId, Result};

/// Which part of a repository to export.
#[derive(Clone, Debug, Default)]
pub enum ExportScope {
    /// Every node and every link touching one.
    #[default]
    All,
    /// Nodes reachable from `seeds` within `depth` link hops, in either
    /// direction, and the links among them.
    Subgraph {
        /// Nodes the walk starts from.
        seeds: Vec<NodeId>,
        /// Maximum number of link hops.
        depth: usize,
    },
}

/// What an export wrote.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    /// Node documents written.
    pub nodes: usize,
    /// Edge documents written.
    pub edges: usize,
    /// Distinct chunks written.
    pub chunks: usize,
    /// Total content bytes across exported nodes.
    pub content_bytes: u64,
}

/// Writes the whole repository as a tar stream.
pub fn export<W: Write>(repo: &Repository, writer: W) -> Result<ExportSummary> {
    write_archive(repo, &ExportScope::All, writer).map(|(summary, _)| summary)
}

/// Writes the subgraph around `seeds` as a tar stream.
pub fn export_subgraph<W: Write>(
    repo: &Repository,
    seeds: &[NodeId],
    depth: usize,
    writer: W,
) -> Result<ExportSummary> {
    let scope = ExportScope::Subgraph {
        seeds: seeds.to_vec(),
        depth,
    };
    write_archive(repo, &scope, writer).map(|(summary, _)| summary)
}

/// Exports to a file. The archive is written beside `path` and renamed into
/// place, so a failed export leaves nothing behind.
pub fn export_to_path(
    repo: &Repository,
    scope: &ExportScope,
    path: impl AsRef<Path>,
) -> Result<ExportSummary> {
    let path = path.as_ref();
    let temp = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let written = File::create(&temp)
        .map_err(CairnError::from)
        .and_then(|file| write_archive(repo, scope, BufWriter::new(file)))
        .and_then(|(summary, mut out)| {
            out.flush()?;
            out.get_ref().sync_all()?;
            Ok(summary)
        });
    match written {
        Ok(summary) => {
            fs::rename(&temp, path)?;
            info!(path = %path.display(), nodes = summary.nodes, edges = summary.edges, "export.written");
            Ok(summary)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp);
            Err(err)
        }
    }
}

/// Breadth-first walk over links in both directions.
fn reachable(repo: &Repository, seeds: &[NodeId], depth: usize) -> Result<BTreeSet<NodeId>> {
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::new();
    for seed in seeds {
        let id = repo.get_node(seed)?.id;
        if visited.insert(id.clone()) {
            queue.push_back((id, 0usize));
        }
    }
    while let Some((id, hops)) = queue.pop_front() {
        if hops == depth {
            continue;
        }
        for link in repo.get_links(&id)? {
            for next in [link.source, link.target] {
                if !visited.contains(&next) && repo.contains_node(&next) {
                    visited.insert(next.clone());
                    queue.push_back((next, hops + 1));
                }
            }
        }
    }
    Ok(visited)
}

fn select(repo: &Repository, scope: &ExportScope) -> Result<(Vec<NodeId>, Vec<Link>)> {
    match scope {
        ExportScope::All => {
            let nodes = repo.list_nodes();
            let live: BTreeSet<&NodeId> = nodes.iter().collect();
            let links = repo
                .all_links()?
                .into_iter()
                .filter(|link| live.contains(&link.source) || live.contains(&link.target))
                .collect();
            Ok((nodes, links))
        }
        ExportScope::Subgraph { seeds, depth } => {
            let nodes = reachable(repo, seeds, *depth)?;
            let mut seen: HashSet<LinkId> = HashSet::new();
            let mut links = Vec::new();
            for id in &nodes {
                for link in repo.get_links(id)? {
                    if nodes.contains(&link.source)
                        && nodes.contains(&link.target)
                        && seen.insert(link.id)
                    {
                        links.push(link);
                    }
                }
            }
            Ok((nodes.into_iter().collect(), links))
        }
    }
}

fn write_archive<W: Write>(
    repo: &Repository,
    scope: &ExportScope,
    writer: W,
) -> Result<(ExportSummary, W)> {
    let (node_ids, links) = select(repo, scope)?;
    let mut archive = ArchiveWriter::new(writer);
    let mut summary = ExportSummary::default();
    let mut written: HashSet<ChunkId> = HashSet::new();
    let mut exported = Vec::with_capacity(node_ids.len());

    for id in &node_ids {
        let node = repo.get_node(id)?;
        for chunk in &node.chunks {
            if !written.insert(*chunk) {
                continue;
            }
            let bytes = repo.get_chunk(chunk)?;
            if ChunkId::of(&bytes) != *chunk {
                return Err(CairnError::integrity(
                    EntityKind::Chunk,
                    chunk,
                    "content hash changed during export",
                ));
            }
            archive.add_chunk(chunk, &bytes)?;
            summary.chunks += 1;
        }
        archive.add_node(&NodeEntry::from_node(&node))?;
        summary.nodes += 1;
        summary.content_bytes += node.content.len() as u64;
        exported.push(node.id);
    }

    let mut edge_keys = Vec::with_capacity(links.len());
    for link in &links {
        let entry = EdgeEntry::from_link(link);
        archive.add_edge(&entry)?;
        edge_keys.push(entry.key());
        summary.edges += 1;
    }
    debug!(
        nodes = summary.nodes,
        edges = summary.edges,
        chunks = summary.chunks,
        "export.entries_written"
    );

    let manifest = Manifest {
        version: ARCHIVE_FORMAT_VERSION,
        created_at: now_nanos(),
        modified_at: repo.header().modified,
        node_count: summary.nodes,
        edge_count: summary.edges,
        chunk_count: summary.chunks,
        node_ids: exported,
        edge_keys,
    };
    let writer = archive.finish(&manifest)?;
    Ok((summary, writer))
}
