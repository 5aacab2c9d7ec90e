use std::path::PathBuf;

use syncrep_types::{KeyError, Seqno, TrxId, WriteSetError};
use thiserror::Error;

/// Primary error type for replication provider operations.
///
/// Variants map one-to-one onto the status kinds the embedding server has to
/// react to: roll back, replay, retry after reconnect, or give up.
#[derive(Error, Debug)]
pub enum Error {
    // === Transaction outcomes ===
    /// Local transaction must roll back (certification failure or abort
    /// before replication completed).
    #[error("transaction {trx_id} failed: {reason}")]
    TrxFail { trx_id: TrxId, reason: String },

    /// Transaction was interrupted by an earlier-sequenced conflicting
    /// transaction after replication; the caller must replay it.
    #[error("transaction {trx_id} brute-force aborted at seqno {seqno}")]
    BfAbort { trx_id: TrxId, seqno: Seqno },

    /// Transaction was aborted in the window between replicate and
    /// pre-commit; the caller rolls back, no replay is possible.
    #[error("transaction {trx_id} aborted before pre-commit")]
    PreCommitAbort { trx_id: TrxId },

    // === Monitor ===
    /// A monitor wait was broken by an interrupt. Internal: the replicator
    /// converts this into [`Error::BfAbort`] before it reaches the caller.
    #[error("ordered wait interrupted at seqno {seqno}")]
    Interrupted { seqno: Seqno },

    /// A deadline passed while waiting for the pipeline to advance.
    #[error("timed out waiting for seqno {seqno}")]
    Timeout { seqno: Seqno },

    // === Cluster membership ===
    /// Group-layer connection lost; the operation may be retried after
    /// reconnecting.
    #[error("group connection failed: {detail}")]
    ConnFail { detail: String },

    /// This node cannot proceed (unsafe bootstrap, transport init failure).
    /// Operational error, not retryable.
    #[error("node failure: {detail}")]
    NodeFail { detail: String },

    // === Input validation ===
    /// Malformed key or write set.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Local write set exceeds the configured maximum.
    #[error("write set of {size} bytes exceeds maximum {max}")]
    WriteSetTooLarge { size: usize, max: usize },

    /// Feature gated behind a protocol version the cluster does not speak.
    #[error("not implemented at protocol version {version}: {feature}")]
    NotImplemented { version: i32, feature: &'static str },

    // === I/O ===
    /// Saved-state file I/O failure.
    #[error("state file '{path}': {source}")]
    StateFile {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Fatal ===
    /// Invariant violated: certification exception, apply retries exhausted,
    /// view callback failure. The node's state is marked corrupt and the
    /// embedder must isolate and terminate.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Create a transaction-failure error.
    pub fn trx_fail(trx_id: TrxId, reason: impl Into<String>) -> Self {
        Self::TrxFail {
            trx_id,
            reason: reason.into(),
        }
    }

    /// Create a connection-failure error.
    pub fn conn_fail(detail: impl Into<String>) -> Self {
        Self::ConnFail {
            detail: detail.into(),
        }
    }

    /// Create a node-failure error.
    pub fn node_fail(detail: impl Into<String>) -> Self {
        Self::NodeFail {
            detail: detail.into(),
        }
    }

    /// Create a fatal error.
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::Fatal(detail.into())
    }

    /// Whether this is a brute-force abort by an earlier-sequenced conflict.
    #[must_use]
    pub const fn is_bf_abort(&self) -> bool {
        matches!(self, Self::BfAbort { .. })
    }

    /// Whether the caller must invoke replay for this transaction.
    #[must_use]
    pub const fn must_replay(&self) -> bool {
        self.is_bf_abort()
    }

    /// Whether this error requires isolating the node and terminating.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Whether the operation may be retried after the cluster connection is
    /// re-established.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnFail { .. })
    }
}

impl From<KeyError> for Error {
    fn from(err: KeyError) -> Self {
        Self::Invalid(err.to_string())
    }
}

impl From<WriteSetError> for Error {
    fn from(err: WriteSetError) -> Self {
        match err {
            WriteSetError::TooLarge { size, max } => Self::WriteSetTooLarge { size, max },
            other => Self::Invalid(other.to_string()),
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
