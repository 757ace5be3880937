#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::thread::sleep;
use std::time::Duration;

use cairn::primitives::wal::{TxKind, TxStatus};
use cairn::storage::{Repository, RepositoryOptions};
use cairn::types::{CairnError, Metadata, NodeId, Result};
use tempfile::tempdir;

#[test]
fn pending_transaction_is_rolled_back_after_crash() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("kg.cairn");
    let (kept, tx, lost) = {
        let repo = Repository::create(&path)?;
        let kept = repo.add_node(b"committed", "note", &Metadata::new())?;
        let tx = repo.begin_transaction(TxKind::Node, Metadata::new())?;
        let (lost, op) = repo.prepare_add_node(b"in flight", "note", &Metadata::new())?;
        repo.add_operation(&tx, op)?;
        assert!(repo.contains_node(&lost));
        // Dropped without close: the log still carries the recovery flag.
        drop(repo);
        (kept, tx, lost)
    };

    let repo = Repository::open(&path)?;
    let report = repo.recovery_report().cloned().expect("recovery ran");
    assert_eq!(report.rolled_back, 1);
    assert!(report.reapplied >= 1);
    assert!(repo.contains_node(&kept));
    assert!(!repo.contains_node(&lost));
    assert_eq!(repo.transaction(&tx)?.status, TxStatus::Rollback);
    repo.close()?;

    let repo = Repository::open(&path)?;
    assert!(repo.recovery_report().is_none());
    repo.close()
}

#[test]
fn committed_work_survives_a_crash_without_flush() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("kg.cairn");
    let (a, b) = {
        let repo = Repository::create(&path)?;
        let a = repo.add_node(b"first", "note", &Metadata::new())?;
        let b = repo.add_node(b"second", "note", &Metadata::new())?;
        repo.add_link(&a, &b, "next", &Metadata::new())?;
        drop(repo);
        (a, b)
    };
    let repo = Repository::open(&path)?;
    assert_eq!(repo.get_content(&a)?, b"first");
    assert_eq!(repo.get_content(&b)?, b"second");
    assert_eq!(repo.get_links(&a)?.len(), 1);
    assert_eq!(repo.recovery_report().map(|r| r.rolled_back), Some(0));
    repo.close()
}

#[test]
fn torn_tail_is_truncated_and_replayed_from_the_log() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("kg.cairn");
    let first = {
        let repo = Repository::create(&path)?;
        let first = repo.add_node(b"durable", "note", &Metadata::new())?;
        repo.close()?;
        first
    };
    let second = {
        let repo = Repository::open(&path)?;
        let second = repo.add_node(b"torn", "note", &Metadata::new())?;
        drop(repo);
        second
    };
    let file = OpenOptions::new().write(true).open(&path)?;
    let len = file.metadata()?.len();
    file.set_len(len - 5)?;
    drop(file);

    let repo = Repository::open(&path)?;
    assert_eq!(repo.get_content(&first)?, b"durable");
    assert_eq!(repo.get_content(&second)?, b"torn");
    repo.close()
}

#[test]
fn stale_transaction_cannot_commit() -> Result<()> {
    let dir = tempdir()?;
    let repo = Repository::create_with_options(
        dir.path().join("kg.cairn"),
        RepositoryOptions::new().txn_timeout(Duration::from_millis(20)),
    )?;
    let tx = repo.begin_transaction(TxKind::Node, Metadata::new())?;
    let (id, op) = repo.prepare_add_node(b"slow", "note", &Metadata::new())?;
    repo.add_operation(&tx, op)?;
    sleep(Duration::from_millis(60));

    let err = repo.commit_transaction(&tx).unwrap_err();
    assert!(matches!(err, CairnError::TransactionState { .. }));
    assert!(!repo.contains_node(&id));
    assert_eq!(repo.transaction(&tx)?.status, TxStatus::Rollback);
    repo.close()
}

#[test]
fn close_rolls_back_open_transactions() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("kg.cairn");
    let id = {
        let repo = Repository::create(&path)?;
        let tx = repo.begin_transaction(TxKind::Node, Metadata::new())?;
        let (id, op) = repo.prepare_add_node(b"abandoned", "note", &Metadata::new())?;
        repo.add_operation(&tx, op)?;
        repo.close()?;
        id
    };
    let repo = Repository::open(&path)?;
    assert!(repo.recovery_report().is_none());
    assert!(!repo.contains_node(&id));
    repo.close()
}

#[test]
fn rotation_carries_pending_transactions() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("kg.cairn");
    let (done, pending) = {
        let repo = Repository::create(&path)?;
        let done = repo.add_node(b"done", "note", &Metadata::new())?;
        let tx = repo.begin_transaction(TxKind::Node, Metadata::new())?;
        let (pending, op) = repo.prepare_add_node(b"pending", "note", &Metadata::new())?;
        repo.add_operation(&tx, op)?;

        let archived = repo.rotate_log()?;
        assert!(archived.exists());
        let live = repo.transactions();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, tx);
        drop(repo);
        (done, pending)
    };
    let repo = Repository::open(&path)?;
    assert!(repo.contains_node(&done));
    assert!(!repo.contains_node(&pending));
    repo.close()
}

#[test]
fn custom_ids_resolve_after_crash() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("kg.cairn");
    let id = NodeId::new("doc-42")?;
    {
        let repo = Repository::create(&path)?;
        repo.add_node_with_id(&id, b"named", "note", &Metadata::new())?;
        drop(repo);
    }
    let repo = Repository::open(&path)?;
    assert_eq!(repo.get_content(&id)?, b"named");
    assert_eq!(repo.list_nodes(), vec![id]);
    repo.close()
}
