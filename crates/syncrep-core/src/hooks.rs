//! Application-side callbacks.
//!
//! The embedding database implements [`ReplicationHooks`]; the provider
//! invokes them under the ordering guarantees of the monitors: `apply` in
//! global-seqno order (concurrently for independent transactions), `commit`
//! serially in seqno order unless commit ordering is bypassed.

use syncrep_types::{Gtid, Seqno, TrxFlags};

use crate::group::ViewInfo;

/// Ordering metadata handed to every apply/commit callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrxMeta {
    pub gtid: Gtid,
    pub depends_seqno: Seqno,
}

/// Failure of an apply callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// The write set could not be applied but the attempt rolled back
    /// cleanly; the provider rolls back and retries a bounded number of
    /// times. The status code is application-defined.
    #[error("recoverable apply failure (status {0})")]
    Recoverable(i32),
    /// The data store is in an unknown state; the node must isolate.
    #[error("fatal apply failure: {0}")]
    Fatal(String),
}

/// Failure of a commit, rollback or view callback. Always fatal: by the
/// time these run, ordering decisions are irreversible.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("callback failed: {0}")]
pub struct HookError(pub String);

/// The application's answer to a new primary view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StateRequest {
    /// No state transfer needed (or wanted).
    #[default]
    None,
    /// Opaque request passed to the donor selection machinery.
    Transfer(Vec<u8>),
}

impl StateRequest {
    #[must_use]
    pub const fn wants_transfer(&self) -> bool {
        matches!(self, Self::Transfer(_))
    }
}

/// Callbacks the embedding application provides.
pub trait ReplicationHooks: Send + Sync {
    /// Apply a write set's payload. Runs inside the transaction's
    /// apply-order slot.
    fn apply(&self, flags: TrxFlags, meta: &TrxMeta, data: &[u8]) -> Result<(), ApplyError>;

    /// Commit (`commit = true`) or roll back (`commit = false`) a previously
    /// applied write set. Returns `true` if the serving thread should exit
    /// after this transaction.
    fn commit(
        &self,
        flags: TrxFlags,
        meta: &TrxMeta,
        commit: bool,
    ) -> Result<bool, HookError>;

    /// A new cluster view was installed. The returned [`StateRequest`]
    /// decides whether a state transfer is requested.
    fn view(&self, view: &ViewInfo) -> Result<StateRequest, HookError>;

    /// This node became synced with the cluster.
    fn synced(&self);
}
