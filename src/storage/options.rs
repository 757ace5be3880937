use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::primitives::wal::{LogOptions, DEFAULT_TXN_TIMEOUT};
use crate::storage::chunker::ChunkerConfig;
use crate::types::meta::MAX_METADATA_LEN;

/// Configuration options supplied when opening a [`super::Repository`].
#[derive(Clone, Debug)]
pub struct RepositoryOptions {
    /// Whether `open` creates a missing repository instead of failing.
    pub create_if_missing: bool,
    /// Whether every mutation fsyncs the repository file.
    pub sync_writes: bool,
    /// Age after which a pending transaction is rolled back.
    pub txn_timeout: Duration,
    /// Transaction log location; defaults to `<repository>.txlog`.
    pub log_path: Option<PathBuf>,
    /// Ceiling on encoded node and link metadata.
    pub max_metadata_len: usize,
    /// Content-defined chunking parameters.
    pub chunker: ChunkerConfig,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            sync_writes: true,
            txn_timeout: DEFAULT_TXN_TIMEOUT,
            log_path: None,
            max_metadata_len: MAX_METADATA_LEN,
            chunker: ChunkerConfig::default(),
        }
    }
}

impl RepositoryOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether `open` may create the repository.
    pub fn create_if_missing(mut self, enabled: bool) -> Self {
        self.create_if_missing = enabled;
        self
    }

    /// Sets whether mutations fsync.
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Sets the pending-transaction timeout.
    pub fn txn_timeout(mut self, timeout: Duration) -> Self {
        self.txn_timeout = timeout;
        self
    }

    /// Overrides the transaction log path.
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the metadata ceiling. Values above the built-in 4 KiB are clamped.
    pub fn max_metadata_len(mut self, bytes: usize) -> Self {
        self.max_metadata_len = bytes.min(MAX_METADATA_LEN);
        self
    }

    /// Sets chunking parameters.
    pub fn chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    pub(crate) fn resolve_log_path(&self, repo: &Path) -> PathBuf {
        self.log_path.clone().unwrap_or_else(|| {
            let mut path = repo.as_os_str().to_owned();
            path.push(".txlog");
            PathBuf::from(path)
        })
    }

    pub(crate) fn log_options(&self) -> LogOptions {
        LogOptions {
            txn_timeout: self.txn_timeout,
            sync_writes: self.sync_writes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_defaults_to_sidecar() {
        let opts = RepositoryOptions::new();
        assert_eq!(
            opts.resolve_log_path(Path::new("/tmp/graph.cairn")),
            PathBuf::from("/tmp/graph.cairn.txlog")
        );
        let opts = opts.log_path("/var/log/graph.txlog");
        assert_eq!(
            opts.resolve_log_path(Path::new("/tmp/graph.cairn")),
            PathBuf::from("/var/log/graph.txlog")
        );
    }

    #[test]
    fn metadata_ceiling_is_clamped() {
        assert_eq!(
            RepositoryOptions::new().max_metadata_len(1 << 20).max_metadata_len,
            MAX_METADATA_LEN
        );
        assert_eq!(RepositoryOptions::new().max_metadata_len(512).max_metadata_len, 512);
    }
}
