use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_repository;
use crate::admin::Result;
use crate::primitives::wal::{RecoveryReport, TxStatus};

/// Repository, transaction log and file-size figures.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Header and store counts.
    pub repository: RepositoryStatsSection,
    /// Transaction tallies by status.
    pub log: LogStatsSection,
    /// Paths and on-disk sizes.
    pub filesystem: FilesystemStats,
    /// Present when opening ran a recovery pass.
    pub recovery: Option<RecoveryReport>,
}

/// Figures read from the header and stores.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryStatsSection {
    /// On-disk format version.
    pub format_version: u8,
    /// Creation time, unix nanoseconds.
    pub created: i64,
    /// Last header rewrite, unix nanoseconds.
    pub modified: i64,
    /// Live nodes.
    pub node_count: usize,
    /// Live links.
    pub edge_count: usize,
    /// Live chunks.
    pub chunk_count: usize,
    /// Offset covered by the persisted indexes.
    pub data_end: u64,
}

/// Transaction counts by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogStatsSection {
    /// All transactions in the current log.
    pub transactions: usize,
    /// Still open.
    pub pending: usize,
    /// Committed.
    pub committed: usize,
    /// Rolled back.
    pub rolled_back: usize,
    /// Marked failed during replay.
    pub failed: usize,
}

/// Paths and sizes of the repository and its log.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    /// Repository file.
    pub repository_path: String,
    /// Repository file size.
    pub repository_size_bytes: u64,
    /// Transaction log file.
    pub log_path: String,
    /// Transaction log size.
    pub log_size_bytes: u64,
}

/// Opens the repository at `path`, collects a [`StatsReport`] and closes it.
pub fn stats(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<StatsReport> {
    let path = path.as_ref();
    let repo = open_repository(path, opts)?;
    let header = repo.header();

    let repository = RepositoryStatsSection {
        format_version: header.version,
        created: header.created,
        modified: header.modified,
        node_count: repo.node_count(),
        edge_count: repo.link_count(),
        chunk_count: repo.chunk_count(),
        data_end: header.data_end,
    };

    let mut log = LogStatsSection::default();
    for tx in repo.transactions() {
        log.transactions += 1;
        match tx.status {
            TxStatus::Pending => log.pending += 1,
            TxStatus::Committed => log.committed += 1,
            TxStatus::Rollback => log.rolled_back += 1,
            TxStatus::Failed => log.failed += 1,
        }
    }

    let log_path = repo.log_path().to_path_buf();
    let filesystem = FilesystemStats {
        repository_path: path.display().to_string(),
        repository_size_bytes: repo.file_len()?,
        log_path: log_path.display().to_string(),
        log_size_bytes: fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0),
    };
    let recovery = repo.recovery_report().cloned();
    repo.close()?;

    Ok(StatsReport {
        repository,
        log,
        filesystem,
        recovery,
    })
}
