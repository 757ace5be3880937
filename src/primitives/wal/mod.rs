#![forbid(unsafe_code)]

//! Write-ahead transaction log.
//!
//! The log lives in its own file next to the repository. Every state change
//! of a transaction appends a fresh `TXNR` frame holding the whole
//! transaction; on open the latest frame per id wins. The header carries a
//! recovery flag that is armed while a repository has the log open and
//! cleared on clean close, so a crash leaves it set.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use tracing::{debug, info, warn};

use crate::primitives::bytes::{buf::Cursor, le};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::storage::record::{RecordFile, RecordKind};
use crate::types::checksum::payload_crc32;
use crate::types::{now_nanos, CairnError, EntityKind, Metadata, Result, TxId};

const LOG_MAGIC: [u8; 4] = *b"CRNL";
const LOG_FORMAT_VERSION: u16 = 1;
/// Size of the log file header.
pub const LOG_HEADER_LEN: usize = 32;
/// Largest payload a single operation may carry.
pub const MAX_OPERATION_PAYLOAD: usize = 1 << 20;
/// Age after which a pending transaction counts as abandoned.
pub const DEFAULT_TXN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const FLAG_RECOVERY: u32 = 1;
const FLAG_ARCHIVED: u32 = 1 << 1;

#[derive(Clone, Debug, Eq, PartialEq)]
struct LogHeader {
    flags: u32,
    created: i64,
}

impl LogHeader {
    fn new(created: i64) -> Self {
        Self { flags: 0, created }
    }

    fn encode(&self) -> [u8; LOG_HEADER_LEN] {
        let mut buf = [0u8; LOG_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.created.to_le_bytes());
        let crc = payload_crc32(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(src: &[u8; LOG_HEADER_LEN]) -> Result<Self> {
        if src[0..4] != LOG_MAGIC {
            return Err(CairnError::Format("transaction log magic mismatch".into()));
        }
        let mut cur = Cursor::new(&src[4..], "transaction log header");
        let version = cur.u16()?;
        if version != LOG_FORMAT_VERSION {
            return Err(CairnError::Format(format!(
                "unsupported transaction log version {version}"
            )));
        }
        cur.take(2)?;
        let flags = cur.u32()?;
        cur.take(4)?;
        let created = cur.i64()?;
        cur.take(4)?;
        let stored_crc = cur.u32()?;
        if payload_crc32(&src[..28]) != stored_crc {
            return Err(CairnError::Format("transaction log header crc mismatch".into()));
        }
        Ok(Self { flags, created })
    }
}

/// Lifecycle state of a transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Open; operations may still be added.
    Pending,
    /// Durably applied.
    Committed,
    /// Undone, either explicitly, by recovery, or by the staleness sweep.
    Rollback,
    /// Replay could not complete; left for an operator to inspect.
    Failed,
}

impl TxStatus {
    fn code(self) -> u8 {
        match self {
            TxStatus::Pending => 0,
            TxStatus::Committed => 1,
            TxStatus::Rollback => 2,
            TxStatus::Failed => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => TxStatus::Pending,
            1 => TxStatus::Committed,
            2 => TxStatus::Rollback,
            3 => TxStatus::Failed,
            other => return Err(CairnError::Format(format!("unknown tx status {other}"))),
        })
    }

    /// True for every state except `Pending`.
    pub fn is_terminal(self) -> bool {
        self != TxStatus::Pending
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxStatus::Pending => "pending",
            TxStatus::Committed => "committed",
            TxStatus::Rollback => "rollback",
            TxStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a transaction touches as a whole.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    /// Touches one node.
    Node,
    /// Touches one link.
    Link,
    /// Touches chunks only.
    Chunk,
    /// Spans several stores.
    Composite,
}

impl TxKind {
    fn code(self) -> u8 {
        match self {
            TxKind::Node => 1,
            TxKind::Link => 2,
            TxKind::Chunk => 3,
            TxKind::Composite => 4,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => TxKind::Node,
            2 => TxKind::Link,
            3 => TxKind::Chunk,
            4 => TxKind::Composite,
            other => return Err(CairnError::Format(format!("unknown tx kind {other}"))),
        })
    }
}

/// Store an operation targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Node store.
    Node,
    /// Link store.
    Link,
    /// Chunk store.
    Chunk,
}

impl TargetKind {
    fn code(self) -> u8 {
        match self {
            TargetKind::Node => 1,
            TargetKind::Link => 2,
            TargetKind::Chunk => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => TargetKind::Node,
            2 => TargetKind::Link,
            3 => TargetKind::Chunk,
            other => return Err(CairnError::Format(format!("unknown op target {other}"))),
        })
    }
}

/// What an operation does to its target.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Brings the target into existence.
    Create,
    /// Rewrites the target in place.
    Update,
    /// Removes the target.
    Delete,
}

impl Action {
    fn code(self) -> u8 {
        match self {
            Action::Create => 1,
            Action::Update => 2,
            Action::Delete => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => Action::Create,
            2 => Action::Update,
            3 => Action::Delete,
            other => return Err(CairnError::Format(format!("unknown op action {other}"))),
        })
    }
}

/// One logical mutation inside a transaction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Operation {
    /// Store the operation applies to.
    pub target_kind: TargetKind,
    /// Hex digest or node id of the target.
    pub target_id: String,
    /// Kind of mutation.
    pub action: Action,
    /// Enough state to redo and undo the mutation.
    #[serde(skip)]
    pub payload: Vec<u8>,
    /// Free-form annotations.
    pub metadata: Metadata,
    /// CRC32 of `payload`.
    pub checksum: u32,
}

impl Operation {
    /// Builds an operation whose checksum matches `payload`.
    pub fn new(
        target_kind: TargetKind,
        target_id: impl Into<String>,
        action: Action,
        payload: Vec<u8>,
    ) -> Self {
        let checksum = payload_crc32(&payload);
        Self {
            target_kind,
            target_id: target_id.into(),
            action,
            payload,
            metadata: Metadata::new(),
            checksum,
        }
    }

    /// Attaches annotations.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Checks the target, payload ceiling, and payload checksum.
    pub fn validate(&self) -> Result<()> {
        if self.target_id.is_empty() {
            return Err(CairnError::Invalid("operation target id is empty".into()));
        }
        if self.payload.len() > MAX_OPERATION_PAYLOAD {
            return Err(CairnError::Capacity {
                what: "operation payload",
                size: self.payload.len(),
                limit: MAX_OPERATION_PAYLOAD,
            });
        }
        if payload_crc32(&self.payload) != self.checksum {
            return Err(CairnError::integrity(
                EntityKind::Transaction,
                &self.target_id,
                "operation payload checksum mismatch",
            ));
        }
        Ok(())
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        le::put_u8(out, self.target_kind.code());
        le::put_u8(out, self.action.code());
        le::put_short_bytes(out, self.target_id.as_bytes());
        le::put_u32(out, self.checksum);
        le::put_long_bytes(out, &self.payload);
        le::put_long_bytes(out, &serde_json::to_vec(&self.metadata)?);
        Ok(())
    }

    fn decode_from(cur: &mut Cursor<'_>) -> Result<Self> {
        let target_kind = TargetKind::from_code(cur.u8()?)?;
        let action = Action::from_code(cur.u8()?)?;
        let target_id = cur.short_str()?.to_string();
        let checksum = cur.u32()?;
        let payload = cur.long_bytes()?.to_vec();
        let metadata = Metadata::decode(cur.long_bytes()?)?;
        Ok(Self {
            target_kind,
            target_id,
            action,
            payload,
            metadata,
            checksum,
        })
    }
}

/// A logged unit of work and its operations.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Transaction {
    /// Transaction identity.
    pub id: TxId,
    /// What the transaction touches.
    pub kind: TxKind,
    /// Current lifecycle state.
    pub status: TxStatus,
    /// Operations in the order they were added.
    pub operations: Vec<Operation>,
    /// Caller annotations.
    pub metadata: Metadata,
    /// Begin time, unix nanoseconds.
    pub created_at: i64,
    /// Last status or operation change, unix nanoseconds.
    pub updated_at: i64,
}

impl Transaction {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(self.id.as_bytes());
        le::put_u8(&mut out, self.kind.code());
        le::put_u8(&mut out, self.status.code());
        le::put_i64(&mut out, self.created_at);
        le::put_i64(&mut out, self.updated_at);
        le::put_long_bytes(&mut out, &serde_json::to_vec(&self.metadata)?);
        le::put_u32(&mut out, self.operations.len() as u32);
        for op in &self.operations {
            op.encode_into(&mut out)?;
        }
        Ok(out)
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body, "transaction record");
        let id = TxId(cur.array()?);
        let kind = TxKind::from_code(cur.u8()?)?;
        let status = TxStatus::from_code(cur.u8()?)?;
        let created_at = cur.i64()?;
        let updated_at = cur.i64()?;
        let metadata = Metadata::decode(cur.long_bytes()?)?;
        let count = cur.u32()? as usize;
        let mut operations = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            operations.push(Operation::decode_from(&mut cur)?);
        }
        cur.finish()?;
        Ok(Self {
            id,
            kind,
            status,
            operations,
            metadata,
            created_at,
            updated_at,
        })
    }

    /// Pending and older than `timeout` as of `now` (unix nanoseconds).
    pub fn is_stale(&self, now: i64, timeout: Duration) -> bool {
        let age = now.saturating_sub(self.created_at);
        self.status == TxStatus::Pending && age > timeout.as_nanos().min(i64::MAX as u128) as i64
    }
}

/// Re-drives logged operations against the stores they describe.
pub trait OperationApplier {
    /// Re-applies a committed operation; must be idempotent.
    fn redo(&self, op: &Operation) -> Result<()>;
    /// Reverses an operation of a transaction that never committed.
    fn undo(&self, op: &Operation) -> Result<()>;
}

/// Outcome of a recovery pass.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Pending transactions undone and marked `rollback`.
    pub rolled_back: usize,
    /// Committed transactions whose operations were re-applied.
    pub reapplied: usize,
    /// Transactions already in `rollback` or `failed`.
    pub skipped: usize,
    /// Transactions whose replay raised an error.
    pub failed: usize,
}

/// Settings for a [`TransactionLog`].
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Age after which a pending transaction is rolled back.
    pub txn_timeout: Duration,
    /// Fsync after every appended frame.
    pub sync_writes: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            txn_timeout: DEFAULT_TXN_TIMEOUT,
            sync_writes: true,
        }
    }
}

struct LogState {
    file: RecordFile,
    header: LogHeader,
    txs: HashMap<TxId, Transaction>,
    order: Vec<TxId>,
    seq: u64,
}

impl LogState {
    fn load(io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        let header = if len < LOG_HEADER_LEN as u64 {
            let header = LogHeader::new(now_nanos());
            io.write_at(0, &header.encode())?;
            io.truncate(LOG_HEADER_LEN as u64)?;
            io.sync_all()?;
            header
        } else {
            let mut buf = [0u8; LOG_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            LogHeader::decode(&buf)?
        };
        let file = RecordFile::new(io, LOG_HEADER_LEN as u64);
        let mut txs = HashMap::new();
        let mut order = Vec::new();
        file.replay_tail(LOG_HEADER_LEN as u64, |_, kind, body| {
            if kind != RecordKind::Transaction {
                return Err(CairnError::Format(format!(
                    "{kind} frame in transaction log"
                )));
            }
            let tx = Transaction::decode(&body)?;
            if !txs.contains_key(&tx.id) {
                order.push(tx.id);
            }
            txs.insert(tx.id, tx);
            Ok(())
        })?;
        Ok(Self {
            file,
            header,
            txs,
            order,
            seq: 0,
        })
    }

    fn write_header(&self) -> Result<()> {
        let io = self.file.io();
        io.write_at(0, &self.header.encode())?;
        io.sync_all()
    }

    fn persist(&mut self, tx: Transaction, sync: bool) -> Result<()> {
        self.file.append(RecordKind::Transaction, &tx.encode()?)?;
        if sync {
            self.file.io().sync_all()?;
        }
        if !self.txs.contains_key(&tx.id) {
            self.order.push(tx.id);
        }
        self.txs.insert(tx.id, tx);
        Ok(())
    }

    fn pending_tx(&self, id: &TxId) -> Result<Transaction> {
        let tx = self
            .txs
            .get(id)
            .ok_or_else(|| CairnError::not_found(EntityKind::Transaction, id))?;
        if tx.status != TxStatus::Pending {
            return Err(CairnError::txn_state(
                id,
                format!("is {}, expected pending", tx.status),
            ));
        }
        Ok(tx.clone())
    }
}

/// Append-only log of transactions with crash recovery.
pub struct TransactionLog {
    path: PathBuf,
    options: LogOptions,
    needs_recovery: bool,
    state: Mutex<LogState>,
}

impl fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionLog")
            .field("path", &self.path)
            .field("needs_recovery", &self.needs_recovery)
            .finish()
    }
}

impl TransactionLog {
    /// Opens (or creates) the log at `path` and loads every transaction.
    ///
    /// The recovery flag found on disk is remembered for [`needs_recovery`]
    /// and the flag is then armed for this session.
    ///
    /// [`needs_recovery`]: TransactionLog::needs_recovery
    pub fn open(path: impl AsRef<Path>, options: LogOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
        let mut state = LogState::load(io)?;
        let needs_recovery = state.header.flags & FLAG_RECOVERY != 0;
        state.header.flags |= FLAG_RECOVERY;
        state.write_header()?;
        info!(
            path = %path.display(),
            transactions = state.txs.len(),
            needs_recovery,
            "txlog.open"
        );
        Ok(Self {
            path,
            options,
            needs_recovery,
            state: Mutex::new(state),
        })
    }

    /// Path of the active log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the previous session did not close the log cleanly.
    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery
    }

    /// Configured staleness timeout.
    pub fn timeout(&self) -> Duration {
        self.options.txn_timeout
    }

    /// Starts a pending transaction and returns its id.
    pub fn begin(&self, kind: TxKind, metadata: Metadata) -> Result<TxId> {
        let meta = serde_json::to_vec(&metadata)?;
        let now = now_nanos();
        let mut state = self.state.lock();
        state.seq += 1;
        let mut hasher = Sha256::new();
        hasher.update([kind.code()]);
        hasher.update(now.to_le_bytes());
        hasher.update(state.seq.to_le_bytes());
        hasher.update(&meta);
        let id = TxId(hasher.finalize().into());
        let tx = Transaction {
            id,
            kind,
            status: TxStatus::Pending,
            operations: Vec::new(),
            metadata,
            created_at: now,
            updated_at: now,
        };
        state.persist(tx, self.options.sync_writes)?;
        debug!(tx = %id, ?kind, "txlog.begin");
        Ok(id)
    }

    fn check_fresh(&self, tx: &Transaction, now: i64) -> Result<()> {
        if tx.is_stale(now, self.options.txn_timeout) {
            return Err(CairnError::txn_state(
                tx.id,
                format!(
                    "timed out after {:?}; it will be rolled back",
                    self.options.txn_timeout
                ),
            ));
        }
        Ok(())
    }

    /// Appends `op` to a pending transaction.
    pub fn add_operation(&self, id: &TxId, op: Operation) -> Result<()> {
        op.validate()?;
        let now = now_nanos();
        let mut state = self.state.lock();
        let mut tx = state.pending_tx(id)?;
        self.check_fresh(&tx, now)?;
        tx.operations.push(op);
        tx.updated_at = now;
        state.persist(tx, self.options.sync_writes)
    }

    fn finish(&self, id: &TxId, status: TxStatus, allow_stale: bool) -> Result<Transaction> {
        let now = now_nanos();
        let mut state = self.state.lock();
        let mut tx = state.pending_tx(id)?;
        if !allow_stale {
            self.check_fresh(&tx, now)?;
        }
        tx.status = status;
        tx.updated_at = now;
        state.persist(tx.clone(), self.options.sync_writes)?;
        debug!(tx = %id, %status, "txlog.finish");
        Ok(tx)
    }

    /// Moves a pending, unexpired transaction to `committed`.
    pub fn commit(&self, id: &TxId) -> Result<Transaction> {
        self.finish(id, TxStatus::Committed, false)
    }

    /// Moves a pending transaction to `rollback`. Undoing its operations is
    /// the caller's job.
    pub fn rollback(&self, id: &TxId) -> Result<Transaction> {
        self.finish(id, TxStatus::Rollback, true)
    }

    /// Marks a pending transaction `failed`.
    pub fn fail(&self, id: &TxId) -> Result<Transaction> {
        self.finish(id, TxStatus::Failed, true)
    }

    /// Looks up one transaction.
    pub fn get(&self, id: &TxId) -> Result<Transaction> {
        self.state
            .lock()
            .txs
            .get(id)
            .cloned()
            .ok_or_else(|| CairnError::not_found(EntityKind::Transaction, id))
    }

    /// Every transaction, oldest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.txs.get(id).cloned())
            .collect()
    }

    /// Transactions that have not finished.
    pub fn pending(&self) -> Vec<Transaction> {
        self.transactions()
            .into_iter()
            .filter(|tx| tx.status == TxStatus::Pending)
            .collect()
    }

    /// Pending transactions older than the timeout.
    pub fn stale(&self) -> Vec<Transaction> {
        let now = now_nanos();
        self.transactions()
            .into_iter()
            .filter(|tx| tx.is_stale(now, self.options.txn_timeout))
            .collect()
    }

    /// Undoes `tx`'s operations newest first and marks it `rollback`.
    ///
    /// If an undo step fails the transaction is marked `failed` instead and
    /// the error is returned.
    pub fn undo_and_rollback(&self, tx: &Transaction, applier: &dyn OperationApplier) -> Result<()> {
        for op in tx.operations.iter().rev() {
            if let Err(err) = applier.undo(op) {
                warn!(tx = %tx.id, target = %op.target_id, error = %err, "txlog.undo_failed");
                self.fail(&tx.id)?;
                return Err(err);
            }
        }
        self.rollback(&tx.id)?;
        Ok(())
    }

    /// Replays the log after an unclean shutdown.
    ///
    /// Pending transactions are undone and rolled back, committed ones are
    /// re-applied, the rest are skipped.
    pub fn recover(&self, applier: &dyn OperationApplier) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for tx in self.transactions() {
            match tx.status {
                TxStatus::Pending => match self.undo_and_rollback(&tx, applier) {
                    Ok(()) => report.rolled_back += 1,
                    Err(_) => report.failed += 1,
                },
                TxStatus::Committed => {
                    let mut ok = true;
                    for op in &tx.operations {
                        if let Err(err) = applier.redo(op) {
                            warn!(tx = %tx.id, target = %op.target_id, error = %err, "txlog.redo_failed");
                            ok = false;
                            break;
                        }
                    }
                    if ok {
                        report.reapplied += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                TxStatus::Rollback | TxStatus::Failed => report.skipped += 1,
            }
        }
        info!(
            rolled_back = report.rolled_back,
            reapplied = report.reapplied,
            skipped = report.skipped,
            failed = report.failed,
            "txlog.recovered"
        );
        Ok(report)
    }

    /// Archives the current log under `<path>.<timestamp>` and starts a
    /// fresh one. Pending transactions are carried into the new log.
    pub fn rotate(&self) -> Result<PathBuf> {
        let mut state = self.state.lock();
        state.header.flags |= FLAG_ARCHIVED;
        state.header.flags &= !FLAG_RECOVERY;
        state.write_header()?;

        let stamp = now_nanos();
        let mut archived = self.path.clone().into_os_string();
        archived.push(format!(".{stamp}"));
        let archived = PathBuf::from(archived);
        fs::rename(&self.path, &archived)?;

        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::create_new(&self.path)?);
        let mut fresh = LogState::load(io)?;
        fresh.header.flags |= FLAG_RECOVERY;
        fresh.write_header()?;
        fresh.seq = state.seq;
        let carried: Vec<Transaction> = state
            .order
            .iter()
            .filter_map(|id| state.txs.get(id))
            .filter(|tx| tx.status == TxStatus::Pending)
            .cloned()
            .collect();
        for tx in carried {
            fresh.persist(tx, false)?;
        }
        fresh.file.io().sync_all()?;
        let carried = fresh.txs.len();
        *state = fresh;
        info!(archived = %archived.display(), carried, "txlog.rotated");
        Ok(archived)
    }

    /// Syncs and clears the recovery flag.
    pub fn close(self) -> Result<()> {
        let mut state = self.state.lock();
        state.header.flags &= !FLAG_RECOVERY;
        state.write_header()?;
        info!(path = %self.path.display(), "txlog.closed");
        Ok(())
    }

    /// Size of the log file in bytes.
    pub fn len(&self) -> Result<u64> {
        self.state.lock().file.io().len()
    }

    /// True when the log holds nothing past its header.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= LOG_HEADER_LEN as u64)
    }
}
