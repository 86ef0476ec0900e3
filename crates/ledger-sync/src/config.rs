//! Engine configuration.
//!
//! ```
//! use ledger_sync::SyncConfig;
//!
//! let config = SyncConfig::from_toml_str(
//!     r#"
//!     prune_keep = 3
//!     fetch_chunk_size = 100
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.prune_keep, 3);
//! assert_eq!(config.max_sync_rounds, 100);
//! ```

use std::path::Path;

use ledger_crdt::clock::DEFAULT_MAX_DRIFT_MS;
use ledger_crdt::merkle::DEFAULT_PRUNE_KEEP;
use ledger_crdt::Timestamp;
use serde::{Deserialize, Serialize};

/// Tuning knobs for the apply pipeline and the sync loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// How far ahead of physical time the clock may run, in milliseconds.
    pub max_drift_ms: u64,
    /// Recent children kept expanded at every trie node when pruning.
    pub prune_keep: usize,
    /// Row ids fetched per query when snapshotting rows.
    pub fetch_chunk_size: usize,
    /// Oldest timestamp some peer has not acknowledged. Trie history before
    /// it is collapsed.
    pub prune_horizon: Option<Timestamp>,
    /// Upper bound on full-sync rounds.
    pub max_sync_rounds: usize,
    /// Rounds allowed to report the same divergence point.
    pub max_same_diff_rounds: usize,
    /// How far back the first full sync looks, in milliseconds.
    pub default_lookback_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
            prune_keep: DEFAULT_PRUNE_KEEP,
            fetch_chunk_size: 500,
            prune_horizon: None,
            max_sync_rounds: 100,
            max_same_diff_rounds: 10,
            default_lookback_ms: 5 * 60 * 1000,
        }
    }
}

/// Error loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    /// The TOML is malformed or has unknown keys.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

impl SyncConfig {
    /// Parse from TOML. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.prune_keep == 0 {
            return Err(ConfigError::Invalid("prune_keep must be at least 1"));
        }
        if self.fetch_chunk_size == 0 {
            return Err(ConfigError::Invalid("fetch_chunk_size must be at least 1"));
        }
        if self.max_sync_rounds == 0 {
            return Err(ConfigError::Invalid("max_sync_rounds must be at least 1"));
        }
        Ok(())
    }
}
