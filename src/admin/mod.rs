#![forbid(unsafe_code)]

//! Repository administration and maintenance utilities.
//!
//! Opens a repository by path for one-shot inspection: integrity
//! verification and statistics reporting. Both close the repository before
//! returning.

mod error;
mod options;
mod stats;
mod util;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Configuration options for opening a repository in admin mode.
pub use options::AdminOpenOptions;

/// Statistics collection and reporting.
///
/// Entity counts from the header and stores, transaction log status
/// totals, and on-disk file sizes.
pub use stats::{stats, FilesystemStats, LogStatsSection, RepositoryStatsSection, StatsReport};

/// Repository integrity verification.
///
/// Verifies the structural integrity of the repository and reports any issues found.
pub use verify::{verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity};

/// Opens a repository, honoring `create_if_missing`.
pub use util::open_repository;
