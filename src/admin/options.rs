use std::path::PathBuf;
use std::time::Duration;

use crate::primitives::wal::DEFAULT_TXN_TIMEOUT;
use crate::storage::RepositoryOptions;

/// Common options used when opening a repository for administrative commands.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Whether to create the repository if it doesn't exist.
    pub create_if_missing: bool,
    /// Whether mutations fsync the repository file.
    pub sync_writes: bool,
    /// Age after which a pending transaction is rolled back.
    pub txn_timeout: Duration,
    /// Transaction log location; `None` means the `.txlog` sidecar.
    pub log_path: Option<PathBuf>,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            sync_writes: true,
            txn_timeout: DEFAULT_TXN_TIMEOUT,
            log_path: None,
        }
    }
}

impl AdminOpenOptions {
    /// Storage options equivalent to these admin options.
    pub fn repository_options(&self) -> RepositoryOptions {
        let mut opts = RepositoryOptions::new()
            .create_if_missing(self.create_if_missing)
            .sync_writes(self.sync_writes)
            .txn_timeout(self.txn_timeout);
        if let Some(path) = &self.log_path {
            opts = opts.log_path(path.clone());
        }
        opts
    }
}
