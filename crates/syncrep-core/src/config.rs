//! Provider configuration.

use std::path::PathBuf;
use std::time::Duration;

use syncrep_types::KeyVersion;

/// Commit-order enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum CommitOrderMode {
    /// Commit callbacks run one at a time in global-seqno order.
    #[default]
    Normal,
    /// No commit monitor; the application orders (or doesn't order) commits.
    Bypass,
    /// Deprecated alias accepted for compatibility; behaves like `Normal`.
    Trailing,
    /// Out-of-order commit; behaves like `Normal` at the monitor level.
    Oooc,
}

impl CommitOrderMode {
    /// Whether the commit monitor is disabled.
    #[must_use]
    pub const fn is_bypass(self) -> bool {
        matches!(self, Self::Bypass)
    }

    /// Parse the configuration string form (`0..=3` or the mode name).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "0" | "normal" => Some(Self::Normal),
            "1" | "bypass" => Some(Self::Bypass),
            "2" | "trailing" => Some(Self::Trailing),
            "3" | "oooc" => Some(Self::Oooc),
            _ => None,
        }
    }
}

/// Options recognized by the provider.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProviderConfig {
    /// Directory for the saved-state file (and the write-set cache, which is
    /// managed by the embedder).
    pub base_dir: PathBuf,
    /// Highest replication protocol version to advertise at view changes.
    pub proto_max: i32,
    /// Certification key encoding for locally-produced write sets.
    pub key_format: KeyVersion,
    /// Local write sets larger than this are rejected before replication.
    pub max_write_set_size: usize,
    pub commit_order: CommitOrderMode,
    /// Deadline for `causal_read` waits.
    pub causal_read_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            proto_max: 9,
            key_format: KeyVersion::V1,
            max_write_set_size: 0x7fff_ffff,
            commit_order: CommitOrderMode::Normal,
            causal_read_timeout: Duration::from_secs(30),
        }
    }
}
