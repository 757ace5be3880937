use std::path::{Path, PathBuf};

use crate::types::CairnError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Repository file not found at the specified path.
    #[error("repository not found: {0}")]
    MissingRepository(PathBuf),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Storage engine error.
    #[error(transparent)]
    Core(#[from] CairnError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_repository(path: impl AsRef<Path>) -> Self {
        AdminError::MissingRepository(path.as_ref().to_path_buf())
    }
}
