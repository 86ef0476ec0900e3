//! Replication modes.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a replica treats incoming and local changes.
///
/// | mode       | bookkeeping (log, trie, clock) | outbound sync |
/// |------------|--------------------------------|---------------|
/// | `Enabled`  | yes                            | yes           |
/// | `Offline`  | yes                            | no            |
/// | `Disabled` | no                             | no            |
/// | `Import`   | no, fast path without prefs    | no            |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Full replication.
    Enabled,
    /// Full bookkeeping, but no exchange with peers.
    Offline,
    /// Rows are written without any replication bookkeeping.
    #[default]
    Disabled,
    /// Bulk loading of a budget file.
    Import,
}

impl SyncMode {
    /// Whether `self`, the current mode, satisfies `check`.
    ///
    /// `Enabled` is satisfied by `Enabled` and `Offline`; `Disabled` by
    /// `Disabled` and `Import`. The other two only match themselves.
    pub fn is_active(self, check: SyncMode) -> bool {
        match check {
            SyncMode::Enabled => matches!(self, SyncMode::Enabled | SyncMode::Offline),
            SyncMode::Disabled => matches!(self, SyncMode::Disabled | SyncMode::Import),
            SyncMode::Offline | SyncMode::Import => self == check,
        }
    }

    /// Whether messages are logged and folded into the trie.
    pub fn keeps_history(self) -> bool {
        self.is_active(SyncMode::Enabled)
    }

    /// Name used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Enabled => "enabled",
            SyncMode::Offline => "offline",
            SyncMode::Disabled => "disabled",
            SyncMode::Import => "import",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unknown mode name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sync mode {0:?}")]
pub struct UnknownMode(pub String);

impl FromStr for SyncMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(SyncMode::Enabled),
            "offline" => Ok(SyncMode::Offline),
            "disabled" => Ok(SyncMode::Disabled),
            "import" => Ok(SyncMode::Import),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}
