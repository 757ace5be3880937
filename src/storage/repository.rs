//! The repository: one file of chunk, node and link records behind a fixed
//! header, plus a sidecar transaction log.
//!
//! Every mutation is a logged transaction. An operation is validated, written
//! to the log, applied to the stores with its index entries flagged
//! `TEMPORARY`, and the header is rewritten; commit clears the flag. Failure
//! at any step undoes what was applied and rolls the transaction back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::bytes::{buf::Cursor, le};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::wal::{
    Action, Operation, OperationApplier, RecoveryReport, TargetKind, Transaction,
    TransactionLog, TxKind, TxStatus,
};
use crate::storage::chunk::ChunkStore;
use crate::storage::chunker::MAX_CHUNK_LEN;
use crate::storage::edge::{Link, LinkStore};
use crate::storage::header::{Header, HEADER_LEN};
use crate::storage::index::{Index, IndexFlags, IndexKind};
use crate::storage::node::{decode_tombstone, Node, NodeRecord, NodeStore};
use crate::storage::options::RepositoryOptions;
use crate::storage::record::{RecordFile, RecordKind, ScanStep};
use crate::types::{
    now_nanos, CairnError, ChunkId, EntityKind, LinkId, Metadata, NodeId, Result, TxId,
};

/// An open repository handle. Dropping it without [`Repository::close`]
/// leaves the log's recovery flag set, exactly like a crash.
pub struct Repository {
    path: PathBuf,
    options: RepositoryOptions,
    file: Arc<RecordFile>,
    chunks: Arc<ChunkStore>,
    nodes: NodeStore,
    links: LinkStore,
    log: TransactionLog,
    header: Mutex<Header>,
    writer: Mutex<()>,
    recovery: Option<RecoveryReport>,
}

fn encode_pair(before: &[u8], after: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + before.len() + after.len());
    le::put_long_bytes(&mut out, before);
    le::put_long_bytes(&mut out, after);
    out
}

fn decode_pair(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    let mut cur = Cursor::new(payload, "update payload");
    let before = cur.long_bytes()?;
    let after = cur.long_bytes()?;
    cur.finish()?;
    Ok((before, after))
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn load_index(file: &RecordFile, offset: u64, kind: IndexKind, end: u64) -> Result<Index> {
    if offset == 0 {
        return Ok(Index::new(kind));
    }
    match file.scan_at(offset, end)? {
        ScanStep::Frame {
            kind: RecordKind::Index,
            body,
            ..
        } => Index::decode(&body, kind),
        _ => Err(CairnError::Format(format!(
            "{kind:?} index at offset {offset} is unreadable"
        ))),
    }
}

impl Repository {
    /// Creates a new repository at `path` with default options.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_options(path, RepositoryOptions::default())
    }

    /// Creates a new repository; fails if the file already exists.
    pub fn create_with_options(path: impl AsRef<Path>, options: RepositoryOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        options.chunker.validate()?;
        let log_path = options.resolve_log_path(&path);
        if log_path.exists() {
            return Err(CairnError::Invalid(format!(
                "transaction log {} already exists",
                log_path.display()
            )));
        }
        let io = StdFileIo::create_new(&path)?;
        io.write_at(0, &Header::new(now_nanos()).encode())?;
        io.sync_all()?;
        drop(io);
        info!(path = %path.display(), "repository.created");
        Self::open_with_options(&path, options)
    }

    /// Opens an existing repository with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, RepositoryOptions::default())
    }

    /// Opens a repository, replays unindexed records, and recovers the log.
    ///
    /// A file whose header does not carry the repository magic is refused
    /// with [`CairnError::Format`].
    pub fn open_with_options(path: impl AsRef<Path>, options: RepositoryOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            if options.create_if_missing {
                return Self::create_with_options(&path, options);
            }
            return Err(CairnError::not_found(
                EntityKind::Repository,
                path.display(),
            ));
        }
        options.chunker.validate()?;

        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open_existing(&path)?);
        let len = io.len()?;
        if len < HEADER_LEN as u64 {
            return Err(CairnError::Format(format!(
                "{} is {len} bytes, shorter than a repository header",
                path.display()
            )));
        }
        let mut buf = [0u8; HEADER_LEN];
        io.read_at(0, &mut buf)?;
        let header = Header::read(&buf)?;
        if header.data_end > len {
            return Err(CairnError::Format(format!(
                "header data_end {} is past end of file {len}",
                header.data_end
            )));
        }

        let file = Arc::new(RecordFile::new(io, header.data_end));
        let end = header.data_end;
        let chunk_index = load_index(&file, header.chunk_index_offset, IndexKind::Chunk, end)?;
        let node_index = load_index(&file, header.node_index_offset, IndexKind::Node, end)?;
        let link_index = load_index(&file, header.edge_index_offset, IndexKind::Link, end)?;

        let chunks = Arc::new(ChunkStore::new(file.clone(), chunk_index));
        let nodes = NodeStore::new(
            file.clone(),
            chunks.clone(),
            options.chunker,
            options.max_metadata_len,
            node_index,
        );
        let links = LinkStore::new(file.clone(), options.max_metadata_len, link_index);

        let replayed = file.replay_tail(header.data_end, |loc, kind, body| match kind {
            RecordKind::Chunk => chunks.apply_frame(loc, &body),
            RecordKind::Node => nodes.apply_frame(loc, kind, &body),
            RecordKind::Link => links.apply_frame(loc, kind, &body),
            RecordKind::Tombstone => match decode_tombstone(&body)?.0 {
                k if k == IndexKind::Node as u8 => nodes.apply_frame(loc, kind, &body),
                k if k == IndexKind::Link as u8 => links.apply_frame(loc, kind, &body),
                other => Err(CairnError::Format(format!(
                    "tombstone for unknown index kind {other}"
                ))),
            },
            RecordKind::Index => Ok(()),
            RecordKind::Transaction => Err(CairnError::Format(
                "transaction frame inside repository file".into(),
            )),
        })?;
        chunks.reset_refs(nodes.rebuild()?);

        let log_path = options.resolve_log_path(&path);
        let log = TransactionLog::open(&log_path, options.log_options())?;
        let mut repo = Self {
            path,
            options,
            file,
            chunks,
            nodes,
            links,
            log,
            header: Mutex::new(header),
            writer: Mutex::new(()),
            recovery: None,
        };
        if repo.log.needs_recovery() {
            warn!(path = %repo.path.display(), "repository.unclean_shutdown");
            let report = repo.log.recover(&Replayer(&repo))?;
            repo.recovery = Some(report);
        }
        repo.sweep_locked()?;
        repo.sync_header()?;
        info!(
            path = %repo.path.display(),
            replayed,
            nodes = repo.nodes.len(),
            links = repo.links.len(),
            chunks = repo.chunks.len(),
            "repository.opened"
        );
        Ok(repo)
    }

    /// Repository file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Transaction log path.
    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Options the repository was opened with.
    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    /// Report of the recovery pass run at open, if the previous session
    /// ended without a clean close.
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Snapshot of the in-memory header.
    pub fn header(&self) -> Header {
        self.header.lock().clone()
    }

    /// Size of the repository file in bytes.
    pub fn file_len(&self) -> Result<u64> {
        self.file.io().len()
    }

    pub(crate) fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    pub(crate) fn node_store(&self) -> &NodeStore {
        &self.nodes
    }

    pub(crate) fn link_store(&self) -> &LinkStore {
        &self.links
    }

    pub(crate) fn transaction_log(&self) -> &TransactionLog {
        &self.log
    }

    // ---- nodes ----

    /// Stores `content` as a new node and returns its minted id.
    pub fn add_node(&self, content: &[u8], node_type: &str, metadata: &Metadata) -> Result<NodeId> {
        let _w = self.writer.lock();
        let (id, op) = self.node_create_op(None, content, node_type, metadata, None)?;
        self.run_locked(TxKind::Node, "add_node", vec![op])?;
        Ok(id)
    }

    /// Stores `content` under a caller-chosen id; `Conflict` if it is taken.
    pub fn add_node_with_id(
        &self,
        id: &NodeId,
        content: &[u8],
        node_type: &str,
        metadata: &Metadata,
    ) -> Result<()> {
        let _w = self.writer.lock();
        let (_, op) = self.node_create_op(Some(id.clone()), content, node_type, metadata, None)?;
        self.run_locked(TxKind::Node, "add_node", vec![op])?;
        Ok(())
    }

    /// Inserts a node carrying its original timestamps.
    pub(crate) fn import_node(
        &self,
        id: &NodeId,
        content: &[u8],
        node_type: &str,
        metadata: &Metadata,
        stamps: (i64, i64),
    ) -> Result<()> {
        let _w = self.writer.lock();
        let (_, op) =
            self.node_create_op(Some(id.clone()), content, node_type, metadata, Some(stamps))?;
        self.run_locked(TxKind::Node, "import_node", vec![op])?;
        Ok(())
    }

    /// Deletes the node `id` and inserts a new one under the same id in a
    /// single composite transaction.
    pub(crate) fn replace_node(
        &self,
        id: &NodeId,
        content: &[u8],
        node_type: &str,
        metadata: &Metadata,
        stamps: (i64, i64),
    ) -> Result<()> {
        let _w = self.writer.lock();
        let delete = self.node_delete_op(id)?;
        let mut record = self
            .nodes
            .prepare(Some(id.clone()), content, node_type, metadata, now_nanos())?;
        record.id = NodeId::new(delete.target_id.as_str())?;
        (record.created_at, record.modified_at) = stamps;
        let create = Operation::new(
            TargetKind::Node,
            record.id.as_str(),
            Action::Create,
            record.encode()?,
        );
        self.run_locked(TxKind::Composite, "replace_node", vec![delete, create])?;
        Ok(())
    }

    /// Reads a node with its content.
    pub fn get_node(&self, id: &NodeId) -> Result<Node> {
        self.nodes.get(id)
    }

    /// Reconstructed content of a node.
    pub fn get_content(&self, id: &NodeId) -> Result<Vec<u8>> {
        Ok(self.nodes.get(id)?.content)
    }

    /// True if a live node has this id.
    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains(id)
    }

    /// Replaces a node's content and/or metadata, keeping its identity.
    pub fn update_node(
        &self,
        id: &NodeId,
        content: Option<&[u8]>,
        metadata: Option<&Metadata>,
    ) -> Result<()> {
        let _w = self.writer.lock();
        let op = self.node_update_op(id, content, metadata)?;
        self.run_locked(TxKind::Node, "update_node", vec![op])?;
        Ok(())
    }

    /// Deletes a node. Its chunks are released, and dropped once no other
    /// node references them. Links touching it are left in place.
    pub fn delete_node(&self, id: &NodeId) -> Result<()> {
        let _w = self.writer.lock();
        let op = self.node_delete_op(id)?;
        self.run_locked(TxKind::Node, "delete_node", vec![op])?;
        Ok(())
    }

    /// Ids of every live node.
    pub fn list_nodes(&self) -> Vec<NodeId> {
        self.nodes.list()
    }

    // ---- links ----

    /// Adds a directed link; both endpoints must currently exist.
    pub fn add_link(
        &self,
        source: &NodeId,
        target: &NodeId,
        link_type: &str,
        metadata: &Metadata,
    ) -> Result<Link> {
        let _w = self.writer.lock();
        let (link, op) = self.link_create_op(source, target, link_type, metadata, None)?;
        self.run_locked(TxKind::Link, "add_link", vec![op])?;
        Ok(link)
    }

    pub(crate) fn import_link(
        &self,
        source: &NodeId,
        target: &NodeId,
        link_type: &str,
        metadata: &Metadata,
        stamps: (i64, i64),
    ) -> Result<Link> {
        let _w = self.writer.lock();
        let (link, op) = self.link_create_op(source, target, link_type, metadata, Some(stamps))?;
        self.run_locked(TxKind::Link, "import_link", vec![op])?;
        Ok(link)
    }

    /// Swaps an existing link for one carrying `metadata` and `stamps`.
    pub(crate) fn replace_link(
        &self,
        source: &NodeId,
        target: &NodeId,
        link_type: &str,
        metadata: &Metadata,
        stamps: (i64, i64),
    ) -> Result<Link> {
        let _w = self.writer.lock();
        let delete = self.link_delete_op(source, target, link_type)?;
        let current = Link::decode(&delete.payload)?;
        let mut link = self.links.prepare(
            &current.source,
            &current.target,
            &current.link_type,
            metadata,
            now_nanos(),
        )?;
        (link.created_at, link.modified_at) = stamps;
        let create = Operation::new(
            TargetKind::Link,
            link.id.to_hex(),
            Action::Create,
            link.encode()?,
        );
        self.run_locked(TxKind::Composite, "replace_link", vec![delete, create])?;
        Ok(link)
    }

    /// Links in which `id` is source or target, oldest first.
    pub fn get_links(&self, id: &NodeId) -> Result<Vec<Link>> {
        self.links.get(&self.canonical_id(id)?)
    }

    /// The stored spelling of a live node's id; `id` itself once deleted.
    fn canonical_id(&self, id: &NodeId) -> Result<NodeId> {
        match self.nodes.get_record(id) {
            Ok(record) => Ok(record.id),
            Err(err) if err.is_not_found() => Ok(id.clone()),
            Err(err) => Err(err),
        }
    }

    /// Every live link, oldest first.
    pub fn all_links(&self) -> Result<Vec<Link>> {
        self.links.all()
    }

    /// Removes the link `source -[link_type]-> target`.
    pub fn delete_link(&self, source: &NodeId, target: &NodeId, link_type: &str) -> Result<()> {
        let _w = self.writer.lock();
        let op = self.link_delete_op(source, target, link_type)?;
        self.run_locked(TxKind::Link, "delete_link", vec![op])?;
        Ok(())
    }

    // ---- chunks ----

    /// Stores one chunk of at most 4096 bytes.
    pub fn store_chunk(&self, bytes: &[u8]) -> Result<ChunkId> {
        let _w = self.writer.lock();
        let id = ChunkId::of(bytes);
        let op = Operation::new(TargetKind::Chunk, id.to_hex(), Action::Create, bytes.to_vec());
        self.run_locked(TxKind::Chunk, "store_chunk", vec![op])?;
        Ok(id)
    }

    /// Reads a chunk, verifying hash and checksum.
    pub fn get_chunk(&self, id: &ChunkId) -> Result<Vec<u8>> {
        self.chunks.get(id)
    }

    /// Re-hashes a chunk; false on hash or CRC mismatch.
    pub fn verify_chunk(&self, id: &ChunkId) -> Result<bool> {
        self.chunks.verify(id)
    }

    /// Live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Live links.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Live chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    // ---- operation builders ----

    /// Builds the operation that creates a node from `content`. Chunks are
    /// stored immediately; they are content addressed and harmless if the
    /// operation is never applied.
    pub fn prepare_add_node(
        &self,
        content: &[u8],
        node_type: &str,
        metadata: &Metadata,
    ) -> Result<(NodeId, Operation)> {
        let _w = self.writer.lock();
        self.node_create_op(None, content, node_type, metadata, None)
    }

    /// Builds the operation that updates a node; new content chunks are stored immediately.
    pub fn prepare_update_node(
        &self,
        id: &NodeId,
        content: Option<&[u8]>,
        metadata: Option<&Metadata>,
    ) -> Result<Operation> {
        let _w = self.writer.lock();
        self.node_update_op(id, content, metadata)
    }

    /// Builds the operation that deletes a node.
    pub fn prepare_delete_node(&self, id: &NodeId) -> Result<Operation> {
        self.node_delete_op(id)
    }

    /// Builds the operation that adds a link.
    pub fn prepare_add_link(
        &self,
        source: &NodeId,
        target: &NodeId,
        link_type: &str,
        metadata: &Metadata,
    ) -> Result<Operation> {
        Ok(self
            .link_create_op(source, target, link_type, metadata, None)?
            .1)
    }

    /// Builds the operation that removes a link.
    pub fn prepare_delete_link(
        &self,
        source: &NodeId,
        target: &NodeId,
        link_type: &str,
    ) -> Result<Operation> {
        self.link_delete_op(source, target, link_type)
    }

    fn node_create_op(
        &self,
        id: Option<NodeId>,
        content: &[u8],
        node_type: &str,
        metadata: &Metadata,
        stamps: Option<(i64, i64)>,
    ) -> Result<(NodeId, Operation)> {
        if let Some(id) = &id {
            if self.nodes.contains(id) {
                return Err(CairnError::Conflict { id: id.to_string() });
            }
        }
        let mut record = self
            .nodes
            .prepare(id, content, node_type, metadata, now_nanos())?;
        if let Some((created, modified)) = stamps {
            record.created_at = created;
            record.modified_at = modified;
        }
        let op = Operation::new(
            TargetKind::Node,
            record.id.as_str(),
            Action::Create,
            record.encode()?,
        );
        Ok((record.id, op))
    }

    fn node_update_op(
        &self,
        id: &NodeId,
        content: Option<&[u8]>,
        metadata: Option<&Metadata>,
    ) -> Result<Operation> {
        let current = self.nodes.get_record(id)?;
        let next = self
            .nodes
            .prepare_update(&current, content, metadata, now_nanos())?;
        Ok(Operation::new(
            TargetKind::Node,
            current.id.as_str(),
            Action::Update,
            encode_pair(&current.encode()?, &next.encode()?),
        ))
    }

    fn node_delete_op(&self, id: &NodeId) -> Result<Operation> {
        let current = self.nodes.get_record(id)?;
        Ok(Operation::new(
            TargetKind::Node,
            current.id.as_str(),
            Action::Delete,
            current.encode()?,
        ))
    }

    fn link_create_op(
        &self,
        source: &NodeId,
        target: &NodeId,
        link_type: &str,
        metadata: &Metadata,
        stamps: Option<(i64, i64)>,
    ) -> Result<(Link, Operation)> {
        let source = self.nodes.get_record(source)?.id;
        let target = self.nodes.get_record(target)?.id;
        let mut link = self
            .links
            .prepare(&source, &target, link_type, metadata, now_nanos())?;
        if let Some((created, modified)) = stamps {
            link.created_at = created;
            link.modified_at = modified;
        }
        if self.links.contains(&link.id) {
            return Err(CairnError::Conflict {
                id: link.composite_key(),
            });
        }
        let op = Operation::new(
            TargetKind::Link,
            link.id.to_hex(),
            Action::Create,
            link.encode()?,
        );
        Ok((link, op))
    }

    fn link_delete_op(&self, source: &NodeId, target: &NodeId, link_type: &str) -> Result<Operation> {
        let source = self.canonical_id(source)?;
        let target = self.canonical_id(target)?;
        let link = self.links.find(&source, &target, link_type)?;
        Ok(Operation::new(
            TargetKind::Link,
            link.id.to_hex(),
            Action::Delete,
            link.encode()?,
        ))
    }

    // ---- transactions ----

    /// Starts a transaction after sweeping stale ones.
    pub fn begin_transaction(&self, kind: TxKind, metadata: Metadata) -> Result<TxId> {
        let _w = self.writer.lock();
        self.begin_locked(kind, metadata)
    }

    /// Validates, logs, then applies `op` inside a pending transaction.
    ///
    /// Applied entries stay flagged `TEMPORARY` until commit. If the
    /// transaction has timed out it is rolled back and an error returned.
    pub fn add_operation(&self, tx: &TxId, op: Operation) -> Result<()> {
        let _w = self.writer.lock();
        self.add_operation_locked(tx, op)
    }

    /// Commits a pending transaction and clears its `TEMPORARY` flags.
    pub fn commit_transaction(&self, tx: &TxId) -> Result<()> {
        let _w = self.writer.lock();
        self.commit_locked(tx)
    }

    /// Undoes a pending transaction's operations newest first and marks it
    /// `rollback`.
    pub fn rollback_transaction(&self, tx: &TxId) -> Result<()> {
        let _w = self.writer.lock();
        self.rollback_locked(tx)
    }

    /// Looks up one transaction.
    pub fn transaction(&self, tx: &TxId) -> Result<Transaction> {
        self.log.get(tx)
    }

    /// Every transaction in the current log, oldest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.log.transactions()
    }

    /// Rolls back every pending transaction older than the timeout.
    pub fn sweep_stale(&self) -> Result<usize> {
        let _w = self.writer.lock();
        self.sweep_locked()
    }

    fn begin_locked(&self, kind: TxKind, metadata: Metadata) -> Result<TxId> {
        self.sweep_locked()?;
        self.log.begin(kind, metadata)
    }

    fn add_operation_locked(&self, tx: &TxId, op: Operation) -> Result<()> {
        op.validate()?;
        self.precheck(&op)?;
        if let Err(err) = self.log.add_operation(tx, op.clone()) {
            if matches!(err, CairnError::TransactionState { .. }) {
                self.sweep_locked()?;
            }
            return Err(err);
        }
        self.apply(&op)?;
        self.sync_header()
    }

    fn commit_locked(&self, tx: &TxId) -> Result<()> {
        let committed = match self.log.commit(tx) {
            Ok(committed) => committed,
            Err(err @ CairnError::TransactionState { .. }) => {
                self.sweep_locked()?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        self.clear_temporary(&committed);
        self.sync_header()
    }

    fn rollback_locked(&self, tx: &TxId) -> Result<()> {
        let pending = self.log.get(tx)?;
        if pending.status.is_terminal() {
            return Err(CairnError::txn_state(
                tx,
                format!("is {}, expected pending", pending.status),
            ));
        }
        self.log.undo_and_rollback(&pending, &Replayer(self))?;
        self.sync_header()
    }

    fn sweep_locked(&self) -> Result<usize> {
        let mut swept = 0;
        for tx in self.log.stale() {
            warn!(tx = %tx.id, ops = tx.operations.len(), "transaction.stale_rollback");
            match self.log.undo_and_rollback(&tx, &Replayer(self)) {
                Ok(()) => swept += 1,
                Err(err) => warn!(tx = %tx.id, error = %err, "transaction.stale_rollback_failed"),
            }
        }
        if swept > 0 {
            self.sync_header()?;
        }
        Ok(swept)
    }

    /// Runs `ops` as one transaction, rolling back on the first failure.
    fn run_locked(&self, kind: TxKind, label: &str, ops: Vec<Operation>) -> Result<TxId> {
        let tx = self.begin_locked(kind, Metadata::new().with("op", label))?;
        for op in ops {
            if let Err(err) = self.add_operation_locked(&tx, op) {
                self.abandon(&tx);
                return Err(err);
            }
        }
        if let Err(err) = self.commit_locked(&tx) {
            self.abandon(&tx);
            return Err(err);
        }
        debug!(%tx, label, "transaction.committed");
        Ok(tx)
    }

    fn abandon(&self, tx: &TxId) {
        let still_pending = matches!(self.log.get(tx), Ok(t) if t.status == TxStatus::Pending);
        if still_pending {
            if let Err(err) = self.rollback_locked(tx) {
                warn!(%tx, error = %err, "transaction.abandon_failed");
            }
        }
    }

    fn clear_temporary(&self, tx: &Transaction) {
        for op in &tx.operations {
            match op.target_kind {
                TargetKind::Node => {
                    if let Ok(id) = NodeId::new(op.target_id.as_str()) {
                        self.nodes.clear_flags(&id, IndexFlags::TEMPORARY);
                    }
                }
                TargetKind::Link => {
                    if let Ok(id) = LinkId::from_hex(&op.target_id) {
                        self.links.clear_flags(&id, IndexFlags::TEMPORARY);
                    }
                }
                TargetKind::Chunk => {}
            }
        }
    }

    // ---- applying operations ----

    fn decode_node(op: &Operation, body: &[u8]) -> Result<NodeRecord> {
        let record = NodeRecord::decode(body)?;
        if record.id.as_str() != op.target_id {
            return Err(CairnError::Invalid(format!(
                "operation targets {} but carries node {}",
                op.target_id, record.id
            )));
        }
        Ok(record)
    }

    fn decode_link(op: &Operation, body: &[u8]) -> Result<Link> {
        let link = Link::decode(body)?;
        if link.id.to_hex() != op.target_id {
            return Err(CairnError::Invalid(format!(
                "operation targets {} but carries link {}",
                op.target_id,
                link.composite_key()
            )));
        }
        Ok(link)
    }

    /// Rejects an operation that cannot apply, before it is logged.
    fn precheck(&self, op: &Operation) -> Result<()> {
        match (op.target_kind, op.action) {
            (TargetKind::Node, Action::Create) => {
                let record = Self::decode_node(op, &op.payload)?;
                if self.nodes.contains(&record.id) {
                    return Err(CairnError::Conflict {
                        id: record.id.to_string(),
                    });
                }
            }
            (TargetKind::Node, Action::Delete) => {
                let record = Self::decode_node(op, &op.payload)?;
                self.nodes.get_record(&record.id)?;
            }
            (TargetKind::Node, Action::Update) => {
                let (_, after) = decode_pair(&op.payload)?;
                let record = Self::decode_node(op, after)?;
                self.nodes.get_record(&record.id)?;
            }
            (TargetKind::Link, Action::Create) => {
                let link = Self::decode_link(op, &op.payload)?;
                self.nodes.get_record(&link.source)?;
                self.nodes.get_record(&link.target)?;
                if self.links.contains(&link.id) {
                    return Err(CairnError::Conflict {
                        id: link.composite_key(),
                    });
                }
            }
            (TargetKind::Link, Action::Delete) => {
                let link = Self::decode_link(op, &op.payload)?;
                self.links.get_by_id(&link.id)?;
            }
            (TargetKind::Link, Action::Update) => {
                let (_, after) = decode_pair(&op.payload)?;
                let link = Self::decode_link(op, after)?;
                self.links.get_by_id(&link.id)?;
            }
            (TargetKind::Chunk, Action::Create) => {
                if op.payload.len() > MAX_CHUNK_LEN {
                    return Err(CairnError::Capacity {
                        what: "chunk",
                        size: op.payload.len(),
                        limit: MAX_CHUNK_LEN,
                    });
                }
                if ChunkId::of(&op.payload).to_hex() != op.target_id {
                    return Err(CairnError::Invalid(format!(
                        "chunk operation target {} does not match its payload",
                        op.target_id
                    )));
                }
            }
            (TargetKind::Chunk, action) => {
                return Err(CairnError::Invalid(format!(
                    "chunks are immutable; {action:?} is not loggable"
                )))
            }
        }
        Ok(())
    }

    /// First application of a logged operation.
    fn apply(&self, op: &Operation) -> Result<()> {
        match (op.target_kind, op.action) {
            (TargetKind::Node, Action::Create) => {
                let record = Self::decode_node(op, &op.payload)?;
                self.nodes.insert(&record, IndexFlags::TEMPORARY)
            }
            (TargetKind::Node, Action::Delete) => {
                let record = Self::decode_node(op, &op.payload)?;
                self.nodes.delete(&record.id).map(drop)
            }
            (TargetKind::Node, Action::Update) => {
                let (_, after) = decode_pair(&op.payload)?;
                let record = Self::decode_node(op, after)?;
                self.nodes.replace(&record)?;
                self.nodes.set_flags(&record.id, IndexFlags::TEMPORARY);
                Ok(())
            }
            (TargetKind::Link, Action::Create) => {
                let link = Self::decode_link(op, &op.payload)?;
                self.links.insert(&link, IndexFlags::TEMPORARY)
            }
            (TargetKind::Link, Action::Delete) => {
                let link = Self::decode_link(op, &op.payload)?;
                self.links.delete_by_id(&link.id)
            }
            (TargetKind::Link, Action::Update) => {
                let (_, after) = decode_pair(&op.payload)?;
                let link = Self::decode_link(op, after)?;
                self.links.restore(&link)?;
                self.links.set_flags(&link.id, IndexFlags::TEMPORARY);
                Ok(())
            }
            (TargetKind::Chunk, Action::Create) => self.chunks.store(&op.payload).map(drop),
            (TargetKind::Chunk, action) => Err(CairnError::Invalid(format!(
                "chunks are immutable; {action:?} is not applicable"
            ))),
        }
    }

    fn rewrite_header(&self, header: &Header) -> Result<()> {
        let io = self.file.io();
        io.write_at(0, &header.encode())?;
        if self.options.sync_writes {
            io.sync_all()?;
        }
        Ok(())
    }

    /// Refreshes counts and the modification time, rewriting the header in
    /// place.
    fn sync_header(&self) -> Result<()> {
        let mut header = self.header.lock();
        header.modified = now_nanos().max(header.modified);
        header.node_count = count(self.nodes.len());
        header.edge_count = count(self.links.len());
        header.chunk_count = count(self.chunks.len());
        self.rewrite_header(&header)
    }

    // ---- lifecycle ----

    /// Persists all three indexes and moves `data_end` past them.
    pub fn flush(&self) -> Result<()> {
        let _w = self.writer.lock();
        self.flush_locked()
    }

    fn flush_locked(&self) -> Result<()> {
        let mut header = self.header.lock();
        let chunk_loc = self
            .file
            .append(RecordKind::Index, &self.chunks.encode_index())?;
        let node_loc = self
            .file
            .append(RecordKind::Index, &self.nodes.encode_index())?;
        let link_loc = self
            .file
            .append(RecordKind::Index, &self.links.encode_index())?;
        self.file.io().sync_all()?;
        header.chunk_index_offset = chunk_loc.offset;
        header.node_index_offset = node_loc.offset;
        header.edge_index_offset = link_loc.offset;
        header.data_end = self.file.tail();
        header.modified = now_nanos().max(header.modified);
        header.node_count = count(self.nodes.len());
        header.edge_count = count(self.links.len());
        header.chunk_count = count(self.chunks.len());
        let io = self.file.io();
        io.write_at(0, &header.encode())?;
        io.sync_all()?;
        debug!(data_end = header.data_end, "repository.flushed");
        Ok(())
    }

    /// Flushes, then archives the transaction log and starts a fresh one.
    pub fn rotate_log(&self) -> Result<PathBuf> {
        let _w = self.writer.lock();
        self.flush_locked()?;
        self.log.rotate()
    }

    /// Rolls back open transactions, flushes indexes, closes the log, and
    /// syncs the file. Every step runs even if an earlier one failed; the
    /// first error is returned.
    pub fn close(self) -> Result<()> {
        let mut first: Option<CairnError> = None;
        let mut keep = |step: &str, res: Result<()>| {
            if let Err(err) = res {
                warn!(step, error = %err, "repository.close_step_failed");
                first.get_or_insert(err);
            }
        };
        {
            let _w = self.writer.lock();
            for tx in self.log.pending() {
                info!(tx = %tx.id, "repository.close_rolls_back_open_transaction");
                keep("rollback", self.log.undo_and_rollback(&tx, &Replayer(&self)));
            }
            keep("flush", self.flush_locked());
        }
        let Repository { path, file, log, .. } = self;
        keep("log", log.close());
        keep("sync", file.io().sync_all());
        drop(file);
        info!(path = %path.display(), "repository.closed");
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Replays logged operations against the repository's stores.
///
/// Both directions are lenient: redo converges on the logged after-image and
/// undo only reverses state the operation itself produced.
struct Replayer<'a>(&'a Repository);

impl OperationApplier for Replayer<'_> {
    fn redo(&self, op: &Operation) -> Result<()> {
        let repo = self.0;
        match (op.target_kind, op.action) {
            (TargetKind::Node, Action::Create) => {
                let record = Repository::decode_node(op, &op.payload)?;
                repo.nodes.restore(&record)?;
                repo.nodes.clear_flags(&record.id, IndexFlags::TEMPORARY);
            }
            (TargetKind::Node, Action::Update) => {
                let (_, after) = decode_pair(&op.payload)?;
                let record = Repository::decode_node(op, after)?;
                repo.nodes.restore(&record)?;
                repo.nodes.clear_flags(&record.id, IndexFlags::TEMPORARY);
            }
            (TargetKind::Node, Action::Delete) => {
                let record = Repository::decode_node(op, &op.payload)?;
                if repo.nodes.contains(&record.id) {
                    repo.nodes.delete(&record.id)?;
                }
            }
            (TargetKind::Link, Action::Create) => {
                let link = Repository::decode_link(op, &op.payload)?;
                repo.links.restore(&link)?;
                repo.links.clear_flags(&link.id, IndexFlags::TEMPORARY);
            }
            (TargetKind::Link, Action::Update) => {
                let (_, after) = decode_pair(&op.payload)?;
                let link = Repository::decode_link(op, after)?;
                repo.links.restore(&link)?;
                repo.links.clear_flags(&link.id, IndexFlags::TEMPORARY);
            }
            (TargetKind::Link, Action::Delete) => {
                let link = Repository::decode_link(op, &op.payload)?;
                if repo.links.contains(&link.id) {
                    repo.links.delete_by_id(&link.id)?;
                }
            }
            (TargetKind::Chunk, Action::Create) => {
                repo.chunks.store(&op.payload)?;
            }
            (TargetKind::Chunk, _) => {}
        }
        Ok(())
    }

    fn undo(&self, op: &Operation) -> Result<()> {
        let repo = self.0;
        match (op.target_kind, op.action) {
            (TargetKind::Node, Action::Create) => {
                let record = Repository::decode_node(op, &op.payload)?;
                match repo.nodes.get_record(&record.id) {
                    Ok(current) if current == record => {
                        repo.nodes.delete(&record.id)?;
                    }
                    Ok(_) => debug!(node = %record.id, "undo.node_create_superseded"),
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
            (TargetKind::Node, Action::Update) => {
                let (before, _) = decode_pair(&op.payload)?;
                let record = Repository::decode_node(op, before)?;
                repo.nodes.restore(&record)?;
                repo.nodes.clear_flags(&record.id, IndexFlags::TEMPORARY);
            }
            (TargetKind::Node, Action::Delete) => {
                let record = Repository::decode_node(op, &op.payload)?;
                repo.nodes.restore(&record)?;
            }
            (TargetKind::Link, Action::Create) => {
                let link = Repository::decode_link(op, &op.payload)?;
                match repo.links.get_by_id(&link.id) {
                    Ok(current) if current == link => repo.links.delete_by_id(&link.id)?,
                    Ok(_) => debug!(link = %link.composite_key(), "undo.link_create_superseded"),
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
            (TargetKind::Link, Action::Update) => {
                let (before, _) = decode_pair(&op.payload)?;
                let link = Repository::decode_link(op, before)?;
                repo.links.restore(&link)?;
                repo.links.clear_flags(&link.id, IndexFlags::TEMPORARY);
            }
            (TargetKind::Link, Action::Delete) => {
                let link = Repository::decode_link(op, &op.payload)?;
                repo.links.restore(&link)?;
            }
            // Chunks are shared and content addressed; an unreferenced one is
            // an orphan, not an inconsistency.
            (TargetKind::Chunk, _) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta() -> Metadata {
        Metadata::new().with("title", "x")
    }

    #[test]
    fn hello_node_lifecycle() -> Result<()> {
        let dir = tempdir().unwrap();
        let repo = Repository::create(dir.path().join("kg.cairn"))?;
        let id = repo.add_node(b"hello", "note", &meta())?;
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(repo.get_node(&id)?.content, b"hello");
        repo.delete_node(&id)?;
        assert!(repo.get_node(&id).unwrap_err().is_not_found());
        repo.close()
    }

    #[test]
    fn committed_entries_lose_temporary_flag() -> Result<()> {
        let dir = tempdir().unwrap();
        let repo = Repository::create(dir.path().join("kg.cairn"))?;
        let (id, op) = repo.prepare_add_node(b"draft", "note", &Metadata::new())?;
        let tx = repo.begin_transaction(TxKind::Node, Metadata::new())?;
        repo.add_operation(&tx, op)?;
        assert!(repo
            .nodes
            .flags(&id)
            .unwrap()
            .contains(IndexFlags::TEMPORARY));
        repo.commit_transaction(&tx)?;
        assert!(!repo
            .nodes
            .flags(&id)
            .unwrap()
            .contains(IndexFlags::TEMPORARY));
        assert_eq!(repo.transaction(&tx)?.status, TxStatus::Committed);
        repo.close()
    }

    #[test]
    fn explicit_rollback_undoes_in_reverse() -> Result<()> {
        let dir = tempdir().unwrap();
        let repo = Repository::create(dir.path().join("kg.cairn"))?;
        let keep = repo.add_node(b"keep", "note", &Metadata::new())?;

        let tx = repo.begin_transaction(TxKind::Composite, Metadata::new())?;
        let (temp, op) = repo.prepare_add_node(b"temp", "note", &Metadata::new())?;
        repo.add_operation(&tx, op)?;
        let link = repo.prepare_add_link(&keep, &temp, "ref", &Metadata::new())?;
        repo.add_operation(&tx, link)?;
        let del = repo.prepare_delete_node(&keep)?;
        repo.add_operation(&tx, del)?;
        assert!(!repo.contains_node(&keep));

        repo.rollback_transaction(&tx)?;
        assert!(repo.contains_node(&keep));
        assert!(!repo.contains_node(&temp));
        assert_eq!(repo.link_count(), 0);
        assert_eq!(repo.transaction(&tx)?.status, TxStatus::Rollback);
        assert!(repo.rollback_transaction(&tx).is_err());
        repo.close()
    }

    #[test]
    fn header_counts_follow_mutations() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kg.cairn");
        let repo = Repository::create(&path)?;
        let a = repo.add_node(b"a", "note", &Metadata::new())?;
        let b = repo.add_node(b"b", "note", &Metadata::new())?;
        repo.add_link(&a, &b, "ref", &Metadata::new())?;

        let mut buf = [0u8; HEADER_LEN];
        repo.file.io().read_at(0, &mut buf)?;
        let on_disk = Header::read(&buf)?;
        assert_eq!(on_disk.node_count, 2);
        assert_eq!(on_disk.edge_count, 1);
        assert_eq!(on_disk.chunk_count, 2);
        repo.close()
    }

    #[test]
    fn update_keeps_identity_and_releases_old_chunks() -> Result<()> {
        let dir = tempdir().unwrap();
        let repo = Repository::create(dir.path().join("kg.cairn"))?;
        let id = repo.add_node(b"first draft", "note", &meta())?;
        let old_chunk = repo.get_node(&id)?.chunks[0];
        repo.update_node(&id, Some(b"second draft"), None)?;
        let node = repo.get_node(&id)?;
        assert_eq!(node.id, id);
        assert_eq!(node.content, b"second draft");
        assert_eq!(node.metadata, meta());
        assert!(repo.get_chunk(&old_chunk).unwrap_err().is_not_found());
        repo.close()
    }

    #[test]
    fn failed_apply_rolls_back_the_transaction() -> Result<()> {
        let dir = tempdir().unwrap();
        let repo = Repository::create(dir.path().join("kg.cairn"))?;
        let id = NodeId::new("fixed")?;
        repo.add_node_with_id(&id, b"one", "note", &Metadata::new())?;
        let err = repo
            .add_node_with_id(&id, b"two", "note", &Metadata::new())
            .unwrap_err();
        assert!(matches!(err, CairnError::Conflict { .. }));
        assert_eq!(repo.get_content(&id)?, b"one");
        assert!(repo.log.pending().is_empty());
        repo.close()
    }

    #[test]
    fn non_repository_file_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-a-repo");
        std::fs::write(&path, vec![7u8; 512]).unwrap();
        let err = Repository::open(&path).err().unwrap();
        assert!(err.is_fatal());
    }
}
