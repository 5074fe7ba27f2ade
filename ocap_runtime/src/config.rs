//! Runtime configuration, loaded from TOML.
//!
//! ```toml
//! data_dir = "/var/lib/ocap"
//! snapshot_interval = 500
//! max_frame_len = 16777216
//!
//! [kernel]
//! weak_mode = "weak"
//! vom_cache_size = 64
//! ```
//!
//! Missing keys take their defaults; unknown keys are rejected.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ocap_kernel::KernelOptions;

use crate::journal::{JournalOptions, DEFAULT_MAX_FRAME_LEN};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {detail}")]
    Invalid { field: &'static str, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub kernel: KernelOptions,
    /// Commits between journal compactions; 0 never compacts.
    pub snapshot_interval: u64,
    pub max_frame_len: usize,
    /// Each host keeps its journal under `<data_dir>/<host name>/`.
    pub data_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            kernel: KernelOptions::default(),
            snapshot_interval: 1000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&s)
    }

    /// Defaults with `data_dir` replaced.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        RuntimeConfig { data_dir: data_dir.into(), ..Default::default() }
    }

    pub fn journal_options(&self) -> JournalOptions {
        JournalOptions { snapshot_interval: self.snapshot_interval, max_frame_len: self.max_frame_len }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_len < 64 || self.max_frame_len > u32::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "max_frame_len",
                detail: format!("{} is outside 64..={}", self.max_frame_len, u32::MAX),
            });
        }
        if self.kernel.vom_cache_size == 0 {
            return Err(ConfigError::Invalid { field: "kernel.vom_cache_size", detail: "must be at least 1".into() });
        }
        if self.kernel.max_cranks_per_run == Some(0) {
            return Err(ConfigError::Invalid { field: "kernel.max_cranks_per_run", detail: "must be at least 1".into() });
        }
        Ok(())
    }
}
