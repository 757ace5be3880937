#![allow(missing_docs)]

use std::path::Path;

use cairn::migration::{
    export, export_subgraph, export_to_path, import, import_from_path, ConflictPolicy,
    ExportScope, ImportOptions,
};
use cairn::storage::Repository;
use cairn::types::{CairnError, Metadata, NodeId, Result};
use tempfile::tempdir;

const NODES: usize = 12;

fn populate(path: &Path) -> Result<(Repository, Vec<NodeId>)> {
    let repo = Repository::create(path)?;
    let mut ids = Vec::new();
    for i in 0..NODES {
        let body = format!("node {i} ").repeat(200 + i * 50);
        let meta = Metadata::new().with("rank", i as i64).with("title", format!("n{i}"));
        ids.push(repo.add_node(body.as_bytes(), "doc", &meta)?);
    }
    for pair in ids.windows(2) {
        repo.add_link(&pair[0], &pair[1], "next", &Metadata::new())?;
    }
    repo.add_link(&ids[0], &ids[NODES - 1], "wraps", &Metadata::new().with("order", 1i64))?;
    Ok((repo, ids))
}

#[test]
fn full_roundtrip_preserves_everything() -> Result<()> {
    let dir = tempdir()?;
    let (src, ids) = populate(&dir.path().join("src.cairn"))?;
    let archive = dir.path().join("out/graph.tar");
    let summary = export_to_path(&src, &ExportScope::All, &archive)?;
    assert_eq!(summary.nodes, NODES);
    assert_eq!(summary.edges, NODES);

    let dst = Repository::create(dir.path().join("dst.cairn"))?;
    let imported = import_from_path(&dst, &archive, &ImportOptions::default())?;
    assert_eq!(imported.nodes_imported, NODES);
    assert_eq!(imported.edges_imported, NODES);
    assert_eq!(imported.dangling_edges, 0);

    assert_eq!(dst.list_nodes(), src.list_nodes());
    for id in &ids {
        let a = src.get_node(id)?;
        let b = dst.get_node(id)?;
        assert_eq!(a.content, b.content);
        assert_eq!(a.metadata, b.metadata);
        assert_eq!(a.node_type, b.node_type);
        assert_eq!(a.chunks, b.chunks);
        assert_eq!((a.created_at, a.modified_at), (b.created_at, b.modified_at));
    }
    let src_links = src.all_links()?;
    let dst_links = dst.all_links()?;
    assert_eq!(src_links, dst_links);
    assert_eq!(dst.chunk_count(), src.chunk_count());
    src.close()?;
    dst.close()
}

#[test]
fn reimport_with_skip_changes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let (repo, _) = populate(&dir.path().join("kg.cairn"))?;
    let mut archive = Vec::new();
    export(&repo, &mut archive)?;
    let summary = import(&repo, archive.as_slice(), &ImportOptions::default())?;
    assert_eq!(summary.nodes_skipped, NODES);
    assert_eq!(summary.edges_skipped, NODES);
    assert_eq!(repo.node_count(), NODES);
    assert_eq!(repo.link_count(), NODES);
    repo.close()
}

#[test]
fn reimport_with_replace_restores_archived_metadata() -> Result<()> {
    let dir = tempdir()?;
    let (repo, ids) = populate(&dir.path().join("kg.cairn"))?;
    let mut archive = Vec::new();
    export(&repo, &mut archive)?;
    let original = repo.get_node(&ids[3])?.metadata;
    repo.update_node(&ids[3], None, Some(&Metadata::new().with("title", "edited")))?;

    let opts = ImportOptions::new().on_conflict(ConflictPolicy::Replace);
    let summary = import(&repo, archive.as_slice(), &opts)?;
    assert_eq!(summary.nodes_replaced, NODES);
    assert_eq!(repo.node_count(), NODES);
    assert_eq!(repo.link_count(), NODES);
    assert_eq!(repo.get_node(&ids[3])?.metadata, original);
    repo.close()
}

#[test]
fn reimport_with_rename_doubles_the_graph() -> Result<()> {
    let dir = tempdir()?;
    let (repo, ids) = populate(&dir.path().join("kg.cairn"))?;
    let mut archive = Vec::new();
    export(&repo, &mut archive)?;

    let opts = ImportOptions::new()
        .on_conflict(ConflictPolicy::Rename)
        .prefix("copy-");
    let summary = import(&repo, archive.as_slice(), &opts)?;
    assert_eq!(summary.nodes_renamed, NODES);
    assert_eq!(repo.node_count(), NODES * 2);
    assert_eq!(repo.link_count(), NODES * 2);

    let renamed = ids[0].with_prefix("copy-")?;
    assert_eq!(repo.get_content(&renamed)?, repo.get_content(&ids[0])?);
    assert!(repo
        .get_links(&renamed)?
        .iter()
        .all(|l| l.source.as_str().starts_with("copy-") && l.target.as_str().starts_with("copy-")));
    repo.close()
}

#[test]
fn subgraph_export_respects_depth() -> Result<()> {
    let dir = tempdir()?;
    let (repo, ids) = populate(&dir.path().join("kg.cairn"))?;
    let mut out = Vec::new();
    // ids[5] reaches ids[3..=7] in two hops along the chain.
    let summary = export_subgraph(&repo, &ids[5..6], 2, &mut out)?;
    assert_eq!(summary.nodes, 5);
    assert_eq!(summary.edges, 4);

    let dst = Repository::create(dir.path().join("dst.cairn"))?;
    import(&dst, out.as_slice(), &ImportOptions::default())?;
    assert!(dst.contains_node(&ids[3]));
    assert!(!dst.contains_node(&ids[2]));
    repo.close()?;
    dst.close()
}

#[test]
fn truncated_archive_is_rejected_before_writing() -> Result<()> {
    let dir = tempdir()?;
    let (repo, _) = populate(&dir.path().join("kg.cairn"))?;
    let mut archive = Vec::new();
    export(&repo, &mut archive)?;
    repo.close()?;
    archive.truncate(archive.len() / 2);

    let dst = Repository::create(dir.path().join("dst.cairn"))?;
    let err = import(&dst, archive.as_slice(), &ImportOptions::default()).unwrap_err();
    assert!(matches!(err, CairnError::Archive(_)));
    assert_eq!(dst.node_count(), 0);
    assert_eq!(dst.chunk_count(), 0);
    dst.close()
}
