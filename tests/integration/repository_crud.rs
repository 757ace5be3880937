#![allow(missing_docs)]

use cairn::storage::{ChunkerConfig, Repository, RepositoryOptions, ORDER_KEY};
use cairn::types::{CairnError, ChunkId, Metadata, NodeId, Result};
use proptest::prelude::*;
use tempfile::tempdir;

#[test]
fn hex_ids_do_not_shadow_their_preimage() -> Result<()> {
    let dir = tempdir()?;
    let repo = Repository::create(dir.path().join("kg.cairn"))?;
    let hashed = NodeId::new(ChunkId::of(b"foo").to_hex())?;
    let plain = NodeId::new("foo")?;
    repo.add_node_with_id(&hashed, b"digest", "note", &Metadata::new())?;
    assert!(!repo.contains_node(&plain));
    assert!(matches!(repo.get_node(&plain), Err(CairnError::NotFound { .. })));

    repo.add_node_with_id(&plain, b"plain", "note", &Metadata::new())?;
    assert_eq!(repo.get_content(&plain)?, b"plain");
    assert_eq!(repo.get_content(&hashed)?, b"digest");
    let upper = NodeId::new(hashed.as_str().to_ascii_uppercase())?;
    assert_eq!(repo.get_node(&upper)?.id, hashed);
    repo.close()?;

    let repo = Repository::open(dir.path().join("kg.cairn"))?;
    assert_eq!(repo.get_content(&plain)?, b"plain");
    assert_eq!(repo.node_count(), 2);
    repo.close()
}

#[test]
fn links_delete_through_any_hex_spelling() -> Result<()> {
    let dir = tempdir()?;
    let repo = Repository::create(dir.path().join("kg.cairn"))?;
    let a = repo.add_node(b"a", "note", &Metadata::new())?;
    let b = repo.add_node(b"b", "note", &Metadata::new())?;
    let upper_a = NodeId::new(a.as_str().to_ascii_uppercase())?;
    let upper_b = NodeId::new(b.as_str().to_ascii_uppercase())?;
    repo.add_link(&upper_a, &upper_b, "ref", &Metadata::new())?;
    assert_eq!(repo.get_links(&a)?.len(), 1);

    repo.delete_link(&upper_a, &upper_b, "ref")?;
    assert!(repo.get_links(&a)?.is_empty());
    assert_eq!(repo.link_count(), 0);
    repo.close()
}

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

#[test]
fn large_content_is_chunked_and_deduplicated() -> Result<()> {
    let dir = tempdir()?;
    let repo = Repository::create(dir.path().join("kg.cairn"))?;
    let base = pseudo_random(64 * 1024, 7);
    let a = repo.add_node(&base, "blob", &Metadata::new())?;
    let chunks_after_first = repo.chunk_count();
    assert!(chunks_after_first > 1);

    let mut edited = base.clone();
    edited.extend_from_slice(b"appendix");
    let b = repo.add_node(&edited, "blob", &Metadata::new())?;
    assert_ne!(a, b);
    assert!(repo.chunk_count() < chunks_after_first * 2);
    assert_eq!(repo.get_content(&a)?, base);
    assert_eq!(repo.get_content(&b)?, edited);

    let node = repo.get_node(&a)?;
    for chunk in &node.chunks {
        assert!(repo.get_chunk(chunk)?.len() <= ChunkerConfig::default().max_len);
    }
    repo.close()
}

#[test]
fn identical_content_shares_chunks_not_identity() -> Result<()> {
    let dir = tempdir()?;
    let repo = Repository::create(dir.path().join("kg.cairn"))?;
    let meta = Metadata::new().with("k", "v");
    let a = repo.add_node(b"same", "note", &meta)?;
    let chunks = repo.chunk_count();
    let b = repo.add_node(b"same", "note", &meta)?;
    assert_ne!(a, b);
    assert_eq!(repo.chunk_count(), chunks);
    assert_eq!(repo.get_node(&a)?.chunks, repo.get_node(&b)?.chunks);
    repo.close()
}

#[test]
fn data_survives_close_and_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("kg.cairn");
    let (a, b) = {
        let repo = Repository::create(&path)?;
        let a = repo.add_node(b"alpha", "note", &Metadata::new().with("title", "A"))?;
        let b = repo.add_node(b"beta", "note", &Metadata::new())?;
        repo.add_link(&a, &b, "cites", &Metadata::new().with("weight", 0.5))?;
        repo.close()?;
        (a, b)
    };
    let repo = Repository::open(&path)?;
    assert!(repo.recovery_report().is_none());
    assert_eq!(repo.get_content(&a)?, b"alpha");
    assert_eq!(repo.get_node(&a)?.metadata, Metadata::new().with("title", "A"));
    let links = repo.get_links(&b)?;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].source, a);
    assert_eq!(repo.list_nodes().len(), 2);
    repo.close()
}

#[test]
fn links_require_existing_endpoints() -> Result<()> {
    let dir = tempdir()?;
    let repo = Repository::create(dir.path().join("kg.cairn"))?;
    let a = repo.add_node(b"a", "note", &Metadata::new())?;
    let ghost = NodeId::new("ghost")?;
    let err = repo.add_link(&a, &ghost, "ref", &Metadata::new()).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(repo.link_count(), 0);
    repo.close()
}

#[test]
fn links_sort_by_creation_then_order_key() -> Result<()> {
    let dir = tempdir()?;
    let repo = Repository::create(dir.path().join("kg.cairn"))?;
    let hub = NodeId::new("hub")?;
    repo.add_node_with_id(&hub, b"hub", "note", &Metadata::new())?;
    let mut expected = Vec::new();
    for name in ["one", "two", "three"] {
        let id = NodeId::new(name)?;
        repo.add_node_with_id(&id, name.as_bytes(), "note", &Metadata::new())?;
        repo.add_link(&hub, &id, "child", &Metadata::new().with(ORDER_KEY, 1i64))?;
        expected.push(id);
    }
    let targets: Vec<NodeId> = repo.get_links(&hub)?.into_iter().map(|l| l.target).collect();
    assert_eq!(targets, expected);
    repo.close()
}

#[test]
fn oversized_metadata_writes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let repo = Repository::create_with_options(
        dir.path().join("kg.cairn"),
        RepositoryOptions::new().max_metadata_len(64),
    )?;
    let len = repo.file_len()?;
    let meta = Metadata::new().with("blob", "x".repeat(200));
    let err = repo.add_node(b"content", "note", &meta).unwrap_err();
    assert!(matches!(err, CairnError::Capacity { .. }));
    assert_eq!(repo.file_len()?, len);
    assert_eq!(repo.chunk_count(), 0);
    repo.close()
}

#[test]
fn deleting_one_node_keeps_shared_chunks() -> Result<()> {
    let dir = tempdir()?;
    let repo = Repository::create(dir.path().join("kg.cairn"))?;
    let a = repo.add_node(b"shared body", "note", &Metadata::new())?;
    let b = repo.add_node(b"shared body", "copy", &Metadata::new())?;
    repo.delete_node(&a)?;
    assert_eq!(repo.get_content(&b)?, b"shared body");
    repo.delete_node(&b)?;
    assert_eq!(repo.chunk_count(), 0);
    repo.close()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn content_roundtrips(content in prop::collection::vec(any::<u8>(), 0..20_000)) {
        let dir = tempdir().unwrap();
        let repo = Repository::create(dir.path().join("kg.cairn")).unwrap();
        let id = repo.add_node(&content, "blob", &Metadata::new()).unwrap();
        prop_assert_eq!(repo.get_content(&id).unwrap(), content);
        repo.close().unwrap();
    }
}
