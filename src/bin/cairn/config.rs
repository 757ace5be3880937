use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cairn::admin::AdminOpenOptions;
use cairn::migration::ConflictPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings loaded from `cli.toml`. Command-line flags override them.
#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        if let Some(policy) = data.import.on_conflict.as_deref() {
            policy
                .parse::<ConflictPolicy>()
                .map_err(|_| ConfigError::InvalidPolicy {
                    value: policy.to_string(),
                })?;
        }
        Ok(Self { path, data })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_repository(&self) -> Option<&PathBuf> {
        self.data.repository.default_path.as_ref()
    }

    /// Open options with every configured override applied.
    pub fn open_options(&self) -> AdminOpenOptions {
        let mut opts = AdminOpenOptions::default();
        let section = &self.data.repository;
        if let Some(sync) = section.sync_writes {
            opts.sync_writes = sync;
        }
        if let Some(secs) = section.txn_timeout_secs {
            opts.txn_timeout = Duration::from_secs(secs);
        }
        if let Some(log) = &section.log_path {
            opts.log_path = Some(log.clone());
        }
        opts
    }

    pub fn conflict_policy(&self) -> Option<ConflictPolicy> {
        self.data
            .import
            .on_conflict
            .as_deref()
            .and_then(|value| value.parse().ok())
    }

    pub fn rename_prefix(&self) -> Option<&str> {
        self.data.import.prefix.as_deref()
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    repository: RepositorySection,
    #[serde(default)]
    import: ImportSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RepositorySection {
    #[serde(rename = "default")]
    default_path: Option<PathBuf>,
    sync_writes: Option<bool>,
    txn_timeout_secs: Option<u64>,
    log_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ImportSection {
    on_conflict: Option<String>,
    prefix: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("import.on_conflict value '{value}' is invalid")]
    InvalidPolicy { value: String },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("cairn").join("cli.toml"))
}
