use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::migration::archive::{ArchiveContents, NodeEntry};
use crate::storage::Repository;
use crate::types::{CairnError, ChunkId, LinkId, Metadata, NodeId, Result};

/// What to do when an imported node id already exists.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Keep the existing node; the archive's node is dropped.
    #[default]
    Skip,
    /// Delete the existing node and insert the archive's under the same id.
    Replace,
    /// Insert the archive's node under a prefixed id.
    Rename,
}

impl FromStr for ConflictPolicy {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip" => Ok(ConflictPolicy::Skip),
            "replace" => Ok(ConflictPolicy::Replace),
            "rename" => Ok(ConflictPolicy::Rename),
            other => Err(CairnError::Invalid(format!(
                "conflict policy must be skip, replace or rename, got {other:?}"
            ))),
        }
    }
}

/// Import behavior.
#[derive(Clone, Debug)]
pub struct ImportOptions {
    /// Policy for node ids that already exist.
    pub on_conflict: ConflictPolicy,
    /// With `Replace`, overlay the archive's metadata on the existing
    /// metadata instead of substituting it.
    pub merge: bool,
    /// Prefix applied under `Rename`.
    pub prefix: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            on_conflict: ConflictPolicy::Skip,
            merge: false,
            prefix: "imported-".to_string(),
        }
    }
}

impl ImportOptions {
    /// Defaults: skip conflicts, no merge, prefix `imported-`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the conflict policy.
    pub fn on_conflict(mut self, policy: ConflictPolicy) -> Self {
        self.on_conflict = policy;
        self
    }

    /// Enables metadata overlay under `Replace`.
    pub fn merge(mut self, enabled: bool) -> Self {
        self.merge = enabled;
        self
    }

    /// Sets the prefix used by `Rename`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Outcome of an import.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// Nodes written under their archive id.
    pub nodes_imported: usize,
    /// Nodes left as they were under `Skip`.
    pub nodes_skipped: usize,
    /// Nodes overwritten under `Replace`.
    pub nodes_replaced: usize,
    /// Nodes written under a prefixed id.
    pub nodes_renamed: usize,
    /// Edges written or replaced.
    pub edges_imported: usize,
    /// Edges that already existed and were kept.
    pub edges_skipped: usize,
    /// Edges whose endpoints did not resolve after node import.
    pub dangling_edges: usize,
    /// Chunks the repository did not hold yet.
    pub chunks_stored: usize,
    /// Chunks already present.
    pub chunks_present: usize,
    /// Archive id to repository id for every node in the archive: the
    /// existing node when skipped, the same id when imported or replaced,
    /// and the prefixed id when renamed.
    pub id_map: BTreeMap<NodeId, NodeId>,
}

/// Imports a tar stream produced by [`super::export`].
///
/// The whole archive is read and checked against its manifest before
/// anything is written. Chunks go first, then nodes, then edges.
pub fn import<R: Read>(
    repo: &Repository,
    reader: R,
    options: &ImportOptions,
) -> Result<ImportSummary> {
    let contents = ArchiveContents::read(reader)?;
    apply(repo, contents, options)
}

/// Imports from an archive file.
pub fn import_from_path(
    repo: &Repository,
    path: impl AsRef<Path>,
    options: &ImportOptions,
) -> Result<ImportSummary> {
    let file = File::open(path.as_ref())?;
    let summary = import(repo, BufReader::new(file), options)?;
    info!(
        path = %path.as_ref().display(),
        nodes = summary.nodes_imported + summary.nodes_replaced + summary.nodes_renamed,
        edges = summary.edges_imported,
        "import.finished"
    );
    Ok(summary)
}

fn apply(
    repo: &Repository,
    contents: ArchiveContents,
    options: &ImportOptions,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    let mut chunks: HashMap<ChunkId, Vec<u8>> = HashMap::with_capacity(contents.chunks.len());
    for (id, bytes) in contents.chunks {
        match repo.get_chunk(&id) {
            Ok(_) => summary.chunks_present += 1,
            Err(err) if err.is_not_found() => {
                repo.store_chunk(&bytes)?;
                summary.chunks_stored += 1;
            }
            Err(err) => return Err(err),
        }
        chunks.insert(id, bytes);
    }

    for entry in &contents.nodes {
        import_node(repo, entry, &chunks, options, &mut summary)?;
    }

    for edge in &contents.edges {
        let source = summary.id_map.get(&edge.source).unwrap_or(&edge.source).clone();
        let target = summary.id_map.get(&edge.target).unwrap_or(&edge.target).clone();
        if !repo.contains_node(&source) || !repo.contains_node(&target) {
            warn!(edge = %edge.key(), "import.dangling_edge");
            summary.dangling_edges += 1;
            continue;
        }
        let stamps = (edge.created_at, edge.modified_at);
        let exists = repo
            .link_store()
            .contains(&LinkId::between(&source, &target, &edge.link_type));
        match (exists, options.on_conflict) {
            (false, _) => {
                repo.import_link(&source, &target, &edge.link_type, &edge.metadata, stamps)?;
                summary.edges_imported += 1;
            }
            (true, ConflictPolicy::Replace) => {
                let metadata = if options.merge {
                    let current = repo.link_store().find(&source, &target, &edge.link_type)?;
                    current.metadata.overlay(&edge.metadata)
                } else {
                    edge.metadata.clone()
                };
                repo.replace_link(&source, &target, &edge.link_type, &metadata, stamps)?;
                summary.edges_imported += 1;
            }
            (true, _) => summary.edges_skipped += 1,
        }
    }

    debug!(?summary, "import.applied");
    Ok(summary)
}

fn content_of(entry: &NodeEntry, archived: &HashMap<ChunkId, Vec<u8>>, repo: &Repository) -> Result<Vec<u8>> {
    let mut content = Vec::with_capacity(entry.size as usize);
    for id in &entry.chunks {
        match archived.get(id) {
            Some(bytes) => content.extend_from_slice(bytes),
            None => content.extend_from_slice(&repo.get_chunk(id).map_err(|err| {
                CairnError::Archive(format!("node {} references chunk {id}: {err}", entry.id))
            })?),
        }
    }
    if content.len() as u64 != entry.size {
        return Err(CairnError::Archive(format!(
            "node {} declares {} bytes, chunks hold {}",
            entry.id,
            entry.size,
            content.len()
        )));
    }
    Ok(content)
}

fn import_node(
    repo: &Repository,
    entry: &NodeEntry,
    chunks: &HashMap<ChunkId, Vec<u8>>,
    options: &ImportOptions,
    summary: &mut ImportSummary,
) -> Result<()> {
    let stamps = (entry.created_at, entry.modified_at);
    if !repo.contains_node(&entry.id) {
        let content = content_of(entry, chunks, repo)?;
        repo.import_node(&entry.id, &content, &entry.node_type, &entry.metadata, stamps)?;
        summary.nodes_imported += 1;
        summary.id_map.insert(entry.id.clone(), entry.id.clone());
        return Ok(());
    }

    match options.on_conflict {
        ConflictPolicy::Skip => {
            let existing = repo.node_store().get_record(&entry.id)?.id;
            debug!(node = %entry.id, "import.node_skipped");
            summary.nodes_skipped += 1;
            summary.id_map.insert(entry.id.clone(), existing);
        }
        ConflictPolicy::Replace => {
            let content = content_of(entry, chunks, repo)?;
            let metadata: Metadata = if options.merge {
                repo.get_node(&entry.id)?.metadata.overlay(&entry.metadata)
            } else {
                entry.metadata.clone()
            };
            repo.replace_node(&entry.id, &content, &entry.node_type, &metadata, stamps)?;
            summary.nodes_replaced += 1;
            summary.id_map.insert(entry.id.clone(), entry.id.clone());
        }
        ConflictPolicy::Rename => {
            let renamed = entry.id.with_prefix(&options.prefix)?;
            if repo.contains_node(&renamed) {
                return Err(CairnError::Conflict {
                    id: renamed.to_string(),
                });
            }
            let content = content_of(entry, chunks, repo)?;
            repo.import_node(&renamed, &content, &entry.node_type, &entry.metadata, stamps)?;
            debug!(from = %entry.id, to = %renamed, "import.node_renamed");
            summary.nodes_renamed += 1;
            summary.id_map.insert(entry.id.clone(), renamed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::export::export;
    use tempfile::tempdir;

    fn seeded(dir: &Path) -> Result<(Repository, Vec<u8>)> {
        let repo = Repository::create(dir.join("src.cairn"))?;
        let a = NodeId::new("alpha")?;
        let b = NodeId::new("beta")?;
        repo.add_node_with_id(&a, b"first", "note", &Metadata::new().with("v", 1i64))?;
        repo.add_node_with_id(&b, b"second", "note", &Metadata::new())?;
        repo.add_link(&a, &b, "ref", &Metadata::new())?;
        let mut out = Vec::new();
        export(&repo, &mut out)?;
        Ok((repo, out))
    }

    #[test]
    fn policy_parses_from_cli_words() {
        assert_eq!("rename".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Rename);
        assert!("overwrite".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn rename_remaps_edges() -> Result<()> {
        let dir = tempdir().unwrap();
        let (repo, archive) = seeded(dir.path())?;
        let opts = ImportOptions::new().on_conflict(ConflictPolicy::Rename);
        let summary = import(&repo, archive.as_slice(), &opts)?;
        assert_eq!(summary.nodes_renamed, 2);
        assert_eq!(summary.edges_imported, 1);
        let renamed = NodeId::new("imported-alpha")?;
        let links = repo.get_links(&renamed)?;
        assert_eq!(links[0].target.as_str(), "imported-beta");
        assert_eq!(repo.node_count(), 4);

        let err = import(&repo, archive.as_slice(), &opts).unwrap_err();
        assert!(matches!(err, CairnError::Conflict { .. }));
        repo.close()
    }

    #[test]
    fn skipped_nodes_map_to_the_existing_node() -> Result<()> {
        let dir = tempdir().unwrap();
        let (repo, archive) = seeded(dir.path())?;
        let summary = import(&repo, archive.as_slice(), &ImportOptions::default())?;
        assert_eq!(summary.nodes_skipped, 2);
        assert_eq!(summary.edges_skipped, 1);
        let alpha = NodeId::new("alpha")?;
        assert_eq!(summary.id_map.get(&alpha), Some(&alpha));
        assert_eq!(summary.id_map.len(), 2);
        repo.close()
    }

    #[test]
    fn replace_with_merge_overlays_metadata() -> Result<()> {
        let dir = tempdir().unwrap();
        let (repo, archive) = seeded(dir.path())?;
        let a = NodeId::new("alpha")?;
        repo.update_node(&a, None, Some(&Metadata::new().with("local", true)))?;

        let opts = ImportOptions::new()
            .on_conflict(ConflictPolicy::Replace)
            .merge(true);
        let summary = import(&repo, archive.as_slice(), &opts)?;
        assert_eq!(summary.nodes_replaced, 2);
        let node = repo.get_node(&a)?;
        assert_eq!(node.content, b"first");
        assert!(node.metadata.get("local").is_some());
        assert!(node.metadata.get("v").is_some());
        assert_eq!(repo.node_count(), 2);
        assert_eq!(repo.link_count(), 1);
        repo.close()
    }

    #[test]
    fn edges_to_missing_nodes_are_counted() -> Result<()> {
        let dir = tempdir().unwrap();
        let (src, archive) = seeded(dir.path())?;
        src.close()?;
        let dst = Repository::create(dir.path().join("dst.cairn"))?;
        let mut contents = ArchiveContents::read(archive.as_slice())?;
        contents.nodes.retain(|n| n.id.as_str() == "alpha");
        let summary = apply(&dst, contents, &ImportOptions::default())?;
        assert_eq!(summary.nodes_imported, 1);
        assert_eq!(summary.dangling_edges, 1);
        assert_eq!(dst.link_count(), 0);
        dst.close()
    }
}
