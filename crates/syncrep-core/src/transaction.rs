//! Transaction handle and lifecycle state machine.
//!
//! A [`TrxHandle`] is shared between the thread driving the transaction, the
//! certification index (which retains it until the safe-to-discard horizon
//! passes) and, for local transactions, whichever applier thread decides to
//! brute-force abort it. Mutable state lives behind an internal mutex;
//! callers hold the guard across a decision sequence and drop it around
//! blocking operations (group sends, monitor waits) so an aborter can get
//! in.
//!
//! Lock order: never acquire the certification engine's lock while holding a
//! transaction guard. The engine takes transaction guards internally.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use syncrep_cert::Certifiable;
use syncrep_types::{
    Key, KeyAccess, KeyRecord, KeyVersion, NodeId, Seqno, TrxFlags, TrxId, WriteSet,
};

/// Lifecycle states. See the transition table in [`legal_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrxState {
    /// Accumulating keys and data on the issuing client thread.
    Executing,
    /// Submitted to the group layer, waiting for total ordering.
    Replicating,
    /// Ordered; queued for (or undergoing) certification.
    Certifying,
    /// Brute-force abort requested; owner must unwind.
    MustAbort,
    /// Unwinding; rollback in progress.
    Aborting,
    RolledBack,
    /// BF-aborted after ordering; certification must be repeated.
    MustCertAndReplay,
    /// Replay pending: apply-order slot must be re-acquired.
    MustReplayAm,
    /// Replay pending: commit-order slot must be re-acquired.
    MustReplayCm,
    /// Replay pending: monitors held, write set must be re-applied.
    MustReplay,
    Replaying,
    Applying,
    Committing,
    Committed,
}

impl TrxState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TrxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Executing => "EXECUTING",
            Self::Replicating => "REPLICATING",
            Self::Certifying => "CERTIFYING",
            Self::MustAbort => "MUST_ABORT",
            Self::Aborting => "ABORTING",
            Self::RolledBack => "ROLLED_BACK",
            Self::MustCertAndReplay => "MUST_CERT_AND_REPLAY",
            Self::MustReplayAm => "MUST_REPLAY_AM",
            Self::MustReplayCm => "MUST_REPLAY_CM",
            Self::MustReplay => "MUST_REPLAY",
            Self::Replaying => "REPLAYING",
            Self::Applying => "APPLYING",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
        };
        f.write_str(name)
    }
}

/// Whether `from -> to` is a legal lifecycle transition.
#[must_use]
pub const fn legal_transition(from: TrxState, to: TrxState) -> bool {
    use TrxState::{
        Aborting, Applying, Certifying, Committed, Committing, Executing, MustAbort,
        MustCertAndReplay, MustReplay, MustReplayAm, MustReplayCm, Replaying, Replicating,
        RolledBack,
    };
    matches!(
        (from, to),
        (Executing, Replicating | MustAbort | RolledBack)
            | (Replicating, Certifying | MustAbort)
            | (Certifying, Applying | MustAbort)
            | (Applying, Committing | Executing | MustAbort)
            | (Committing, Committed | MustAbort)
            | (
                MustAbort,
                Aborting | MustCertAndReplay | MustReplayAm | MustReplayCm | MustReplay
            )
            | (Aborting, RolledBack)
            | (MustCertAndReplay, Certifying | MustAbort)
            | (MustReplayAm, MustReplayCm)
            | (MustReplayCm, MustReplay)
            | (MustReplay, Replaying)
            | (Replaying, Committed)
    )
}

/// Mutable transaction state; access through [`TrxHandle::lock`].
#[derive(Debug)]
pub struct TrxInner {
    state: TrxState,
    pub local_seqno: Seqno,
    pub global_seqno: Seqno,
    pub last_seen_seqno: Seqno,
    pub depends_seqno: Seqno,
    pub flags: TrxFlags,
    pub write_set: WriteSet,
    /// Outstanding group-layer send reservation, interruptible by an aborter.
    pub gcs_handle: Option<u64>,
    /// Commit-order slot already released by an interim commit.
    pub interim_committed: bool,
}

impl TrxInner {
    #[inline]
    #[must_use]
    pub const fn state(&self) -> TrxState {
        self.state
    }

    /// Transition the lifecycle state.
    ///
    /// # Panics
    ///
    /// Panics on an illegal transition: that is a provider bug, and carrying
    /// on would corrupt the ordering protocol.
    pub fn set_state(&mut self, to: TrxState) {
        assert!(
            legal_transition(self.state, to),
            "illegal transaction state transition {} -> {}",
            self.state,
            to
        );
        tracing::trace!(from = %self.state, to = %to, "trx state");
        self.state = to;
    }

    /// Record the seqnos assigned by the group layer on delivery.
    pub fn set_ordered(&mut self, local_seqno: Seqno, global_seqno: Seqno) {
        debug_assert!(!self.global_seqno.is_defined(), "seqno reassignment");
        self.local_seqno = local_seqno;
        self.global_seqno = global_seqno;
    }
}

/// Shared per-transaction handle.
pub struct TrxHandle {
    trx_id: TrxId,
    source_id: NodeId,
    local: bool,
    /// Set once certification has accepted the write set.
    certified: AtomicBool,
    inner: Mutex<TrxInner>,
}

impl TrxHandle {
    /// Create a handle for a locally-issued transaction. Write-set appends
    /// past `max_write_set_size` are rejected.
    #[must_use]
    pub fn new_local(
        trx_id: TrxId,
        source_id: NodeId,
        key_version: KeyVersion,
        max_write_set_size: usize,
    ) -> Self {
        let mut write_set = WriteSet::new(key_version, source_id, trx_id);
        write_set.set_max_size(max_write_set_size);
        Self {
            trx_id,
            source_id,
            local: true,
            certified: AtomicBool::new(false),
            inner: Mutex::new(TrxInner {
                state: TrxState::Executing,
                local_seqno: Seqno::UNDEFINED,
                global_seqno: Seqno::UNDEFINED,
                last_seen_seqno: Seqno::UNDEFINED,
                depends_seqno: Seqno::UNDEFINED,
                flags: TrxFlags::empty(),
                write_set,
                gcs_handle: None,
                interim_committed: false,
            }),
        }
    }

    /// Create a handle for a locally-issued total-order isolated action.
    #[must_use]
    pub fn new_toi(source_id: NodeId, key_version: KeyVersion, max_write_set_size: usize) -> Self {
        let handle = Self::new_local(
            TrxId::UNDEFINED,
            source_id,
            key_version,
            max_write_set_size,
        );
        {
            let mut inner = handle.inner.lock();
            inner.flags = TrxFlags::COMMIT | TrxFlags::ISOLATION;
            let flags = inner.flags;
            inner.write_set.set_flags(flags);
        }
        handle
    }

    /// Reconstruct a remote transaction from a delivered ordered action.
    pub fn from_action(
        payload: &[u8],
        local_seqno: Seqno,
        global_seqno: Seqno,
    ) -> Result<Self, syncrep_types::WriteSetError> {
        let write_set = WriteSet::unserialize(payload)?;
        Ok(Self {
            trx_id: TrxId::UNDEFINED,
            source_id: write_set.source_id(),
            local: false,
            certified: AtomicBool::new(false),
            inner: Mutex::new(TrxInner {
                state: TrxState::Replicating,
                local_seqno,
                global_seqno,
                last_seen_seqno: write_set.last_seen_seqno(),
                depends_seqno: Seqno::UNDEFINED,
                flags: write_set.flags(),
                write_set,
                gcs_handle: None,
                interim_committed: false,
            }),
        })
    }

    #[inline]
    #[must_use]
    pub const fn trx_id(&self) -> TrxId {
        self.trx_id
    }

    #[inline]
    #[must_use]
    pub const fn source_id(&self) -> NodeId {
        self.source_id
    }

    #[inline]
    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.local
    }

    #[must_use]
    pub fn is_toi(&self) -> bool {
        self.inner.lock().flags.contains(TrxFlags::ISOLATION)
    }

    #[must_use]
    pub fn is_certified(&self) -> bool {
        self.certified.load(Ordering::Acquire)
    }

    pub fn mark_certified(&self) {
        self.certified.store(true, Ordering::Release);
    }

    /// Acquire the state guard.
    pub fn lock(&self) -> MutexGuard<'_, TrxInner> {
        self.inner.lock()
    }

    #[must_use]
    pub fn state(&self) -> TrxState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn global_seqno(&self) -> Seqno {
        self.inner.lock().global_seqno
    }

    #[must_use]
    pub fn local_seqno(&self) -> Seqno {
        self.inner.lock().local_seqno
    }

    #[must_use]
    pub fn depends_seqno(&self) -> Seqno {
        self.inner.lock().depends_seqno
    }

    #[must_use]
    pub fn flags(&self) -> TrxFlags {
        self.inner.lock().flags
    }

    /// Set the transaction flags (commit, rollback, isolation) before
    /// replication.
    pub fn set_flags(&self, flags: TrxFlags) {
        let mut inner = self.inner.lock();
        inner.flags = flags;
        inner.write_set.set_flags(flags);
    }

    /// Append a certification key on the issuing thread.
    pub fn append_key(&self, key: Key, access: KeyAccess) -> Result<(), syncrep_types::WriteSetError> {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.state, TrxState::Executing);
        inner.write_set.append_key(key, access)
    }

    /// Append opaque payload data on the issuing thread.
    pub fn append_data(&self, data: &[u8]) -> Result<(), syncrep_types::WriteSetError> {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.state, TrxState::Executing);
        inner.write_set.append_data(data)
    }
}

impl Certifiable for TrxHandle {
    fn global_seqno(&self) -> Seqno {
        self.inner.lock().global_seqno
    }

    fn last_seen_seqno(&self) -> Seqno {
        self.inner.lock().last_seen_seqno
    }

    fn is_toi(&self) -> bool {
        self.is_toi()
    }

    fn set_depends_seqno(&self, seqno: Seqno) {
        self.inner.lock().depends_seqno = seqno;
    }

    fn with_keys(&self, f: &mut dyn FnMut(&KeyRecord)) {
        let inner = self.inner.lock();
        for record in inner.write_set.keys() {
            f(record);
        }
    }
}

impl fmt::Debug for TrxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TrxHandle")
            .field("trx_id", &self.trx_id)
            .field("local", &self.local)
            .field("state", &inner.state)
            .field("local_seqno", &inner.local_seqno)
            .field("global_seqno", &inner.global_seqno)
            .field("last_seen_seqno", &inner.last_seen_seqno)
            .field("depends_seqno", &inner.depends_seqno)
            .finish_non_exhaustive()
    }
}
