use std::fs;
use std::path::Path;

use crate::storage::Repository;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens or creates a repository at the specified path.
///
/// # Errors
///
/// Returns an error if the repository doesn't exist and `create_if_missing`
/// is false, or if opening it fails.
pub fn open_repository(path: &Path, opts: &AdminOpenOptions) -> Result<Repository> {
    if !path.exists() {
        if !opts.create_if_missing {
            return Err(AdminError::missing_repository(path));
        }
        ensure_parent_dir(path)?;
    }
    Ok(Repository::open_with_options(path, opts.repository_options())?)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
