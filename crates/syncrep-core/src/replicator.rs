//! The replicator: membership state machine and transaction pipeline.
//!
//! One long-lived [`Replicator`] instance spans connect..close. Client
//! threads drive local transactions through [`Replicator::replicate`] /
//! [`Replicator::pre_commit`] / [`Replicator::post_commit`]; one or more
//! applier threads run [`Replicator::recv_loop`] to process the group
//! event stream.
//!
//! Three ordered monitors gate the pipeline:
//!
//! - local order (key: local seqno) serializes certification and membership
//!   events in delivery order;
//! - apply order (key: global seqno, gated on `depends_seqno`) lets
//!   independent transactions apply concurrently while keeping the
//!   watermark ordered;
//! - commit order (key: global seqno) serializes commit callbacks unless
//!   bypassed by configuration.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use syncrep_cert::{Certification, TestResult};
use syncrep_error::{Error, Result};
use syncrep_monitor::{DependentKey, Enter, OrderKey, OrderedMonitor, SerialKey};
use syncrep_types::{Gtid, NodeId, Seqno, TrxFlags, TrxId};

use crate::config::ProviderConfig;
use crate::group::{GroupEvent, GroupTransport, NextState, RecvError, SendError, ViewInfo};
use crate::hooks::{ApplyError, ReplicationHooks, TrxMeta};
use crate::state_file::StateFile;
use crate::transaction::{TrxHandle, TrxState};

/// Replicator membership states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicatorState {
    Closed,
    Closing,
    Connected,
    Joining,
    Joined,
    Synced,
    Donor,
    Destroyed,
}

impl ReplicatorState {
    /// Whether local transactions may be replicated in this state.
    #[must_use]
    pub const fn accepts_replication(self) -> bool {
        matches!(self, Self::Joined | Self::Synced | Self::Donor)
    }
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Closing => "CLOSING",
            Self::Connected => "CONNECTED",
            Self::Joining => "JOINING",
            Self::Joined => "JOINED",
            Self::Synced => "SYNCED",
            Self::Donor => "DONOR",
            Self::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

/// Whether `from -> to` is a legal membership transition.
#[must_use]
pub const fn state_transition_allowed(from: ReplicatorState, to: ReplicatorState) -> bool {
    use ReplicatorState::{
        Closed, Closing, Connected, Destroyed, Donor, Joined, Joining, Synced,
    };
    matches!(
        (from, to),
        (Closed, Destroyed | Connected)
            | (Closing, Closed)
            | (Connected, Closing | Connected | Joining | Joined | Donor | Synced)
            | (Joining, Closing | Connected | Joined)
            | (Joined, Closing | Connected | Synced | Donor)
            | (Synced, Closing | Connected | Donor)
            | (Donor, Closing | Connected | Joined)
    )
}

const MAX_APPLY_ATTEMPTS: u32 = 4;

/// Outcome of a certification pass, before conversion to the public error
/// taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CertOutcome {
    Ok,
    TrxFail,
    BfAbort,
}

#[derive(Debug, Clone, Copy)]
struct ProtocolVersions {
    repl: i32,
    trx: i32,
    state_transfer: i32,
}

/// Map a replication protocol version to (write-set version, state-transfer
/// version).
const fn protocol_table(proto: i32) -> Option<(i32, i32)> {
    match proto {
        1 => Some((1, 0)),
        2 => Some((1, 1)),
        3 | 4 => Some((2, 1)),
        5 => Some((3, 1)),
        6 | 7 => Some((3, 2)),
        // 8 enforces write-set alignment only; formats are unchanged.
        8 => Some((3, 2)),
        // 9 enables semi-shared key access.
        9 => Some((4, 2)),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Stats {
    replicated: AtomicU64,
    replicated_bytes: AtomicU64,
    local_commits: AtomicU64,
    local_rollbacks: AtomicU64,
    local_cert_failures: AtomicU64,
    local_replays: AtomicU64,
    causal_reads: AtomicU64,
}

/// Point-in-time view of the provider counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct StatsSnapshot {
    pub replicated: u64,
    pub replicated_bytes: u64,
    pub local_commits: u64,
    pub local_rollbacks: u64,
    pub local_cert_failures: u64,
    pub local_replays: u64,
    pub causal_reads: u64,
}

/// The replication provider.
pub struct Replicator<T: GroupTransport, H: ReplicationHooks> {
    transport: Arc<T>,
    hooks: H,
    config: ProviderConfig,

    state: Mutex<ReplicatorState>,
    state_cond: Condvar,

    local_monitor: OrderedMonitor,
    apply_monitor: OrderedMonitor,
    commit_monitor: OrderedMonitor,
    cert: Certification<TrxHandle>,
    state_file: StateFile,

    /// Group state identity this node's data corresponds to.
    state_uuid: Mutex<NodeId>,
    /// This node's own member identity within the current view.
    node_id: Mutex<NodeId>,
    safe_to_bootstrap: Mutex<bool>,
    /// Seqno of the last configuration change; commit cuts below it are
    /// stale and ignored.
    cc_seqno: Mutex<Seqno>,
    pause_seqno: Mutex<Seqno>,
    protocol: Mutex<ProtocolVersions>,
    incoming_list: Mutex<String>,
    receivers: AtomicUsize,
    stats: Stats,
}

impl<T: GroupTransport, H: ReplicationHooks> Replicator<T, H> {
    /// Build a provider from recovered state. The node starts `CLOSED`.
    pub fn new(config: ProviderConfig, transport: Arc<T>, hooks: H) -> Result<Self> {
        let state_file = StateFile::open(&config.base_dir)?;
        let (uuid, seqno, safe_to_bootstrap) = state_file.get();

        let (trx_version, str_version) =
            protocol_table(config.proto_max).ok_or_else(|| {
                Error::fatal(format!("unsupported proto_max {}", config.proto_max))
            })?;

        let replicator = Self {
            transport,
            hooks,
            config,
            state: Mutex::new(ReplicatorState::Closed),
            state_cond: Condvar::new(),
            local_monitor: OrderedMonitor::new("local"),
            apply_monitor: OrderedMonitor::new("apply"),
            commit_monitor: OrderedMonitor::new("commit"),
            cert: Certification::new(trx_version),
            state_file,
            state_uuid: Mutex::new(uuid),
            node_id: Mutex::new(NodeId::UNDEFINED),
            safe_to_bootstrap: Mutex::new(safe_to_bootstrap),
            cc_seqno: Mutex::new(seqno),
            pause_seqno: Mutex::new(Seqno::UNDEFINED),
            protocol: Mutex::new(ProtocolVersions {
                repl: -1,
                trx: trx_version,
                state_transfer: str_version,
            }),
            incoming_list: Mutex::new(String::new()),
            receivers: AtomicUsize::new(0),
            stats: Stats::default(),
        };

        replicator.local_monitor.set_initial_position(Seqno::ZERO);
        replicator.apply_monitor.set_initial_position(seqno);
        if !replicator.commit_order_bypass() {
            replicator.commit_monitor.set_initial_position(seqno);
        }
        replicator.cert.assign_initial_position(seqno, trx_version);
        Ok(replicator)
    }

    #[inline]
    fn commit_order_bypass(&self) -> bool {
        self.config.commit_order.is_bypass()
    }

    /// Current membership state.
    #[must_use]
    pub fn state(&self) -> ReplicatorState {
        *self.state.lock()
    }

    /// Block until the membership state satisfies `predicate`.
    pub fn wait_for_state(&self, predicate: impl Fn(ReplicatorState) -> bool) {
        let mut state = self.state.lock();
        while !predicate(*state) {
            self.state_cond.wait(&mut state);
        }
    }

    fn shift_to(&self, to: ReplicatorState) {
        let mut state = self.state.lock();
        assert!(
            state_transition_allowed(*state, to),
            "illegal replicator state transition {} -> {}",
            *state,
            to
        );
        tracing::info!(from = %*state, to = %to, "replicator state shift");
        *state = to;
        drop(state);
        self.state_cond.notify_all();
    }

    /// The group state identity of this node's data.
    #[must_use]
    pub fn state_uuid(&self) -> NodeId {
        *self.state_uuid.lock()
    }

    /// This node's member identity in the current view.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        *self.node_id.lock()
    }

    /// Negotiated protocol versions: (replication, write-set,
    /// state-transfer). Replication is `-1` before the first primary view.
    #[must_use]
    pub fn protocol_versions(&self) -> (i32, i32, i32) {
        let protocol = self.protocol.lock();
        (protocol.repl, protocol.trx, protocol.state_transfer)
    }

    /// Comma-joined client addresses of the current view's members.
    #[must_use]
    pub fn incoming_list(&self) -> String {
        self.incoming_list.lock().clone()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            replicated: self.stats.replicated.load(Ordering::Relaxed),
            replicated_bytes: self.stats.replicated_bytes.load(Ordering::Relaxed),
            local_commits: self.stats.local_commits.load(Ordering::Relaxed),
            local_rollbacks: self.stats.local_rollbacks.load(Ordering::Relaxed),
            local_cert_failures: self.stats.local_cert_failures.load(Ordering::Relaxed),
            local_replays: self.stats.local_replays.load(Ordering::Relaxed),
            causal_reads: self.stats.causal_reads.load(Ordering::Relaxed),
        }
    }

    /// Seqno this node's applied state corresponds to.
    #[must_use]
    pub fn state_seqno(&self) -> Seqno {
        self.apply_monitor.last_left()
    }

    /// Highest seqno whose commit this node has observed.
    fn last_committed(&self) -> Seqno {
        if self.commit_order_bypass() {
            self.apply_monitor.last_left()
        } else {
            self.commit_monitor.last_left()
        }
    }

    fn report_last_committed(&self, advanced: Option<Seqno>) {
        if let Some(seqno) = advanced {
            self.transport.report_last_committed(seqno);
        }
    }

    /// Mark local state compromised and cut the node out of the cluster.
    fn consistency_failure(&self, detail: &str) -> Error {
        tracing::error!(detail, "node consistency compromised, isolating");
        self.state_file.mark_corrupt();
        self.transport.isolate();
        Error::fatal(detail.to_owned())
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Connect to (or bootstrap) a cluster.
    pub fn connect(
        &self,
        cluster_name: &str,
        cluster_url: &str,
        bootstrap: bool,
    ) -> Result<()> {
        let seqno = self.state_seqno();
        let uuid = if seqno.is_defined() {
            self.state_uuid()
        } else {
            NodeId::UNDEFINED
        };
        tracing::info!(%uuid, %seqno, cluster_name, cluster_url, "connecting to group");

        if bootstrap && !*self.safe_to_bootstrap.lock() {
            tracing::error!(
                "it may not be safe to bootstrap the cluster from this node: it was not \
                 the last one to leave and may not contain all updates; force bootstrap \
                 by editing the saved state file"
            );
            return Err(Error::node_fail("unsafe bootstrap"));
        }

        self.transport
            .set_initial_position(uuid, seqno)
            .map_err(|err| Error::node_fail(format!("group init failed: {err}")))?;
        self.transport
            .connect(cluster_name, cluster_url, bootstrap)
            .map_err(|err| Error::node_fail(format!("group connect failed: {err}")))?;

        self.shift_to(ReplicatorState::Connected);
        Ok(())
    }

    /// Initiate shutdown. Applier threads observe the closed connection and
    /// finish the state machine.
    pub fn close(&self) {
        if self.state() != ReplicatorState::Closed {
            self.transport.close();
        }
    }

    /// Blocking receive loop; run from one or more applier threads.
    ///
    /// Returns when the provider shuts down or the connection fails. Fatal
    /// errors (inconsistency, apply failure) are returned after the node has
    /// been isolated; the embedder must terminate.
    pub fn recv_loop(&self) -> Result<()> {
        if matches!(
            self.state(),
            ReplicatorState::Closed | ReplicatorState::Closing | ReplicatorState::Destroyed
        ) {
            return Err(Error::fatal("receive loop started in closed state"));
        }
        self.receivers.fetch_add(1, Ordering::SeqCst);

        let result = loop {
            match self.transport.recv() {
                Ok(event) => match self.dispatch(event) {
                    Ok(exit_loop) => {
                        if exit_loop {
                            if self.receivers.load(Ordering::SeqCst) > 1 {
                                tracing::info!("applier thread exiting on request");
                                break Ok(());
                            }
                            tracing::warn!("refusing exit for the last applier thread");
                        }
                        if self.state() == ReplicatorState::Closing {
                            break Ok(());
                        }
                    }
                    Err(err) => break Err(err),
                },
                Err(RecvError::Closed) => {
                    break if matches!(
                        self.state(),
                        ReplicatorState::Closing | ReplicatorState::Closed
                    ) {
                        Ok(())
                    } else {
                        Err(Error::conn_fail("group connection closed"))
                    };
                }
                Err(RecvError::Inconsistency(detail)) => {
                    self.state_file.mark_corrupt();
                    break Err(Error::fatal(detail));
                }
            }
        };

        if self.receivers.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last applier out finishes the shutdown sequence.
            let state = self.state();
            if !matches!(state, ReplicatorState::Closing | ReplicatorState::Closed) {
                self.shift_to(ReplicatorState::Closing);
            }
            if self.state() == ReplicatorState::Closing {
                self.shift_to(ReplicatorState::Closed);
            }
        }
        tracing::debug!("applier thread exit");
        result
    }

    fn dispatch(&self, event: GroupEvent) -> Result<bool> {
        match event {
            GroupEvent::OrderedAction {
                local_seqno,
                global_seqno,
                payload,
            } => {
                let trx = TrxHandle::from_action(&payload, local_seqno, global_seqno)
                    .map_err(|err| {
                        // A corrupt totally-ordered action means this node
                        // disagrees with the cluster about the byte stream.
                        self.state_file.mark_corrupt();
                        Error::fatal(format!("undecodable ordered action: {err}"))
                    })?;
                self.process_trx(&Arc::new(trx))
            }
            GroupEvent::CommitCut { seqno, local_seqno } => {
                self.process_commit_cut(seqno, local_seqno)?;
                Ok(false)
            }
            GroupEvent::ConfChange {
                view,
                next_state,
                local_seqno,
            } => {
                self.process_conf_change(view, next_state, local_seqno)?;
                Ok(false)
            }
            GroupEvent::Join {
                status,
                local_seqno,
            } => {
                self.process_join(status, local_seqno)?;
                Ok(false)
            }
            GroupEvent::Sync { local_seqno } => {
                self.process_sync(local_seqno)?;
                Ok(false)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Local transaction pipeline
    // -----------------------------------------------------------------------

    /// Create a handle for a new local transaction using the configured key
    /// format, write-set cap and this node's identity.
    #[must_use]
    pub fn new_trx(&self, trx_id: TrxId) -> Arc<TrxHandle> {
        Arc::new(TrxHandle::new_local(
            trx_id,
            self.node_id(),
            self.config.key_format,
            self.config.max_write_set_size,
        ))
    }

    /// Create a handle for a local total-order isolated action.
    #[must_use]
    pub fn new_toi(&self) -> Arc<TrxHandle> {
        Arc::new(TrxHandle::new_toi(
            self.node_id(),
            self.config.key_format,
            self.config.max_write_set_size,
        ))
    }

    /// Drive a local transaction through replication: record the
    /// certification window, submit the write set for total ordering and
    /// receive its seqnos.
    pub fn replicate(&self, trx: &Arc<TrxHandle>, meta: &mut TrxMeta) -> Result<()> {
        if !self.state().accepts_replication() {
            return Err(Error::trx_fail(trx.trx_id(), "node is not synced"));
        }

        let mut guard = trx.lock();
        if guard.state() == TrxState::MustAbort {
            guard.set_state(TrxState::Aborting);
            return Err(Error::trx_fail(trx.trx_id(), "aborted before replication"));
        }
        debug_assert_eq!(guard.state(), TrxState::Executing);
        debug_assert!(!guard.global_seqno.is_defined());

        let size = guard.write_set.serial_size();
        if size > self.config.max_write_set_size {
            guard.set_state(TrxState::MustAbort);
            guard.set_state(TrxState::Aborting);
            return Err(Error::WriteSetTooLarge {
                size,
                max: self.config.max_write_set_size,
            });
        }
        guard.set_state(TrxState::Replicating);

        let ordered = loop {
            let handle = match self.transport.schedule() {
                Ok(handle) => handle,
                Err(err) => {
                    tracing::debug!(%err, "group schedule failed");
                    if guard.state() != TrxState::MustAbort {
                        guard.set_state(TrxState::MustAbort);
                    }
                    guard.set_state(TrxState::Aborting);
                    return Err(Error::trx_fail(trx.trx_id(), "group schedule failed"));
                }
            };
            guard.gcs_handle = Some(handle);
            let last_seen = self.last_committed();
            debug_assert!(last_seen.get() >= 0);
            guard.last_seen_seqno = last_seen;
            guard.write_set.set_last_seen_seqno(last_seen);
            let action = guard.write_set.gather();

            // Release the transaction across the blocking send so an
            // aborter can interrupt it.
            drop(guard);
            let sent = self.transport.repl(&action, handle);
            guard = trx.lock();
            guard.gcs_handle = None;

            match sent {
                Ok(ordered) => break ordered,
                Err(SendError::Congested) if guard.state() != TrxState::MustAbort => {
                    drop(guard);
                    std::thread::sleep(Duration::from_millis(1));
                    guard = trx.lock();
                }
                Err(err) => {
                    if !matches!(err, SendError::Interrupted) {
                        tracing::debug!(trx_id = %trx.trx_id(), %err, "group send failed");
                    }
                    if guard.state() != TrxState::MustAbort {
                        guard.set_state(TrxState::MustAbort);
                    }
                    guard.set_state(TrxState::Aborting);
                    return Err(Error::trx_fail(trx.trx_id(), "replication failed"));
                }
            }
        };

        self.stats.replicated.fetch_add(1, Ordering::Relaxed);
        self.stats
            .replicated_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
        guard.set_ordered(ordered.local_seqno, ordered.global_seqno);
        meta.gtid = Gtid::new(self.state_uuid(), ordered.global_seqno);
        meta.depends_seqno = guard.depends_seqno;

        if guard.state() != TrxState::MustAbort {
            return Ok(());
        }
        drop(guard);

        // Aborted while the send was in flight, but the write set is now
        // ordered: decide between replay and rollback.
        match self.cert_for_aborted(trx) {
            CertOutcome::BfAbort => Err(Error::BfAbort {
                trx_id: trx.trx_id(),
                seqno: ordered.global_seqno,
            }),
            _ => {
                self.cancel_monitors(trx);
                let mut guard = trx.lock();
                if guard.state() == TrxState::MustAbort {
                    guard.set_state(TrxState::Aborting);
                }
                Err(Error::trx_fail(trx.trx_id(), "aborted during replication"))
            }
        }
    }

    /// Drive a replicated local transaction through certification and into
    /// its apply-order (and, for committing fragments, commit-order) slots.
    ///
    /// On [`Error::BfAbort`] the caller must invoke
    /// [`Replicator::replay_trx`].
    pub fn pre_commit(&self, trx: &Arc<TrxHandle>, meta: &mut TrxMeta) -> Result<()> {
        {
            let guard = trx.lock();
            if guard.state() == TrxState::MustAbort {
                drop(guard);
                // Aborted in the window between replicate and pre-commit.
                return match self.cert_for_aborted(trx) {
                    CertOutcome::BfAbort => {
                        self.fill_meta(trx, meta);
                        Err(Error::BfAbort {
                            trx_id: trx.trx_id(),
                            seqno: trx.global_seqno(),
                        })
                    }
                    _ => {
                        self.cancel_monitors(trx);
                        let mut guard = trx.lock();
                        if guard.state() == TrxState::MustAbort {
                            guard.set_state(TrxState::Aborting);
                        }
                        Err(Error::PreCommitAbort {
                            trx_id: trx.trx_id(),
                        })
                    }
                };
            }
            debug_assert_eq!(guard.state(), TrxState::Replicating);
            debug_assert!(guard.global_seqno.is_defined());
        }

        match self.certify(trx) {
            CertOutcome::Ok => {}
            CertOutcome::TrxFail => {
                let mut guard = trx.lock();
                if guard.state() == TrxState::MustAbort {
                    guard.set_state(TrxState::Aborting);
                }
                return Err(Error::trx_fail(trx.trx_id(), "certification failed"));
            }
            CertOutcome::BfAbort => {
                return Err(Error::BfAbort {
                    trx_id: trx.trx_id(),
                    seqno: trx.global_seqno(),
                });
            }
        }

        let (apply_key, commit_key, flags) = {
            let mut guard = trx.lock();
            debug_assert_eq!(guard.state(), TrxState::Certifying);
            debug_assert!(guard.global_seqno > self.state_seqno());
            guard.set_state(TrxState::Applying);
            (
                DependentKey::new(guard.global_seqno, guard.depends_seqno),
                SerialKey::new(guard.global_seqno),
                guard.flags,
            )
        };
        self.fill_meta(trx, meta);

        match self.apply_monitor.enter(&apply_key) {
            Enter::Entered => {}
            Enter::Interrupted => {
                let mut guard = trx.lock();
                debug_assert_eq!(guard.state(), TrxState::MustAbort);
                guard.set_state(TrxState::MustReplayAm);
                return Err(Error::BfAbort {
                    trx_id: trx.trx_id(),
                    seqno: apply_key.seqno(),
                });
            }
            Enter::Canceled => {
                return Err(self.consistency_failure("apply slot canceled under owner"));
            }
        }

        {
            let mut guard = trx.lock();
            if guard.state() == TrxState::MustAbort {
                // Aborted after we already held the apply slot.
                guard.set_state(TrxState::MustReplayCm);
                return Err(Error::BfAbort {
                    trx_id: trx.trx_id(),
                    seqno: apply_key.seqno(),
                });
            }
            if !flags.contains(TrxFlags::COMMIT) {
                // Intermediate fragment of a streaming transaction: back to
                // the application for more work.
                guard.set_state(TrxState::Executing);
                return Ok(());
            }
            guard.set_state(TrxState::Committing);
        }

        if !self.commit_order_bypass() {
            match self.commit_monitor.enter(&commit_key) {
                Enter::Entered => {
                    let mut guard = trx.lock();
                    if guard.state() == TrxState::MustAbort {
                        guard.set_state(TrxState::MustReplay);
                        return Err(Error::BfAbort {
                            trx_id: trx.trx_id(),
                            seqno: commit_key.seqno(),
                        });
                    }
                }
                Enter::Interrupted => {
                    let mut guard = trx.lock();
                    debug_assert_eq!(guard.state(), TrxState::MustAbort);
                    guard.set_state(TrxState::MustReplayCm);
                    return Err(Error::BfAbort {
                        trx_id: trx.trx_id(),
                        seqno: commit_key.seqno(),
                    });
                }
                Enter::Canceled => {
                    return Err(self.consistency_failure("commit slot canceled under owner"));
                }
            }
        }
        Ok(())
    }

    /// Re-drive a brute-force-aborted transaction through the pipeline at
    /// its original seqno.
    pub fn replay_trx(&self, trx: &Arc<TrxHandle>) -> Result<()> {
        assert!(trx.is_local());
        let mut state = trx.state();
        debug_assert!(matches!(
            state,
            TrxState::MustCertAndReplay
                | TrxState::MustReplayAm
                | TrxState::MustReplayCm
                | TrxState::MustReplay
        ));
        debug_assert!(trx.global_seqno() > self.state_seqno());

        if state == TrxState::MustCertAndReplay {
            match self.certify(trx) {
                CertOutcome::Ok => {
                    trx.lock().set_state(TrxState::MustReplayAm);
                }
                CertOutcome::BfAbort => {
                    // Aborted again while re-certifying; the write set is
                    // appended and the replay continues.
                }
                CertOutcome::TrxFail => {
                    // Apply and commit slots were canceled during
                    // certification.
                    let mut guard = trx.lock();
                    if guard.state() == TrxState::MustAbort {
                        guard.set_state(TrxState::Aborting);
                    }
                    tracing::debug!(trx_id = %trx.trx_id(), "replay certification failed");
                    return Err(Error::trx_fail(trx.trx_id(), "replay certification failed"));
                }
            }
            state = trx.state();
            debug_assert_eq!(state, TrxState::MustReplayAm);
        }

        if state == TrxState::MustReplayAm {
            let apply_key = {
                let mut guard = trx.lock();
                // Everything preceding must finish before the replay runs.
                guard.depends_seqno = guard.global_seqno.prev();
                DependentKey::new(guard.global_seqno, guard.depends_seqno)
            };
            if self.apply_monitor.enter(&apply_key) != Enter::Entered {
                return Err(self.consistency_failure("replay apply slot unavailable"));
            }
            trx.lock().set_state(TrxState::MustReplayCm);
            state = TrxState::MustReplayCm;
        }

        if state == TrxState::MustReplayCm {
            if !self.commit_order_bypass() {
                let commit_key = SerialKey::new(trx.global_seqno());
                if self.commit_monitor.enter(&commit_key) != Enter::Entered {
                    return Err(self.consistency_failure("replay commit slot unavailable"));
                }
            }
            trx.lock().set_state(TrxState::MustReplay);
        }

        self.stats.local_replays.fetch_add(1, Ordering::Relaxed);
        let (flags, meta, data, is_toi) = {
            let mut guard = trx.lock();
            guard.set_state(TrxState::Replaying);
            (
                guard.flags,
                TrxMeta {
                    gtid: Gtid::new(self.state_uuid(), guard.global_seqno),
                    depends_seqno: guard.depends_seqno,
                },
                guard.write_set.data().to_vec(),
                guard.flags.contains(TrxFlags::ISOLATION),
            )
        };

        let replayed = self
            .apply_with_retry(flags, &meta, &data, is_toi)
            .and_then(|()| {
                self.hooks
                    .commit(flags, &meta, true)
                    .map(|_| ())
                    .map_err(|err| Error::fatal(format!("commit failed during replay: {err}")))
            });
        if let Err(err) = replayed {
            tracing::error!(trx_id = %trx.trx_id(), %err, "failed to re-apply transaction");
            return Err(self.consistency_failure("replay failed"));
        }
        // Monitors are released by post_commit.
        Ok(())
    }

    /// Release the commit-order slot early, once the transaction is queued
    /// in the application's group-commit pipeline.
    pub fn interim_commit(&self, trx: &Arc<TrxHandle>) -> Result<()> {
        let commit_key = {
            let mut guard = trx.lock();
            if guard.state() == TrxState::MustAbort {
                // An aborter raced with a transaction already past the
                // cancellation horizon; the abort is swallowed.
                tracing::debug!(trx_id = %trx.trx_id(), "BF abort during commit, ignoring");
                guard.set_state(TrxState::MustReplay);
                guard.set_state(TrxState::Replaying);
            }
            debug_assert!(matches!(
                guard.state(),
                TrxState::Committing | TrxState::Replaying
            ));
            guard.interim_committed = true;
            SerialKey::new(guard.global_seqno)
        };
        if !self.commit_order_bypass() {
            self.commit_monitor.leave(&commit_key);
        }
        Ok(())
    }

    /// Finish a committed local transaction: release monitors, report to
    /// certification, reach `COMMITTED`.
    pub fn post_commit(&self, trx: &Arc<TrxHandle>) -> Result<()> {
        let (apply_key, commit_key, interim) = {
            let mut guard = trx.lock();
            if guard.state() == TrxState::MustAbort {
                tracing::debug!(trx_id = %trx.trx_id(), "BF abort during commit, ignoring");
                guard.set_state(TrxState::MustReplay);
                guard.set_state(TrxState::Replaying);
            }
            debug_assert!(matches!(
                guard.state(),
                TrxState::Committing | TrxState::Replaying
            ));
            debug_assert!(guard.local_seqno.is_defined() && guard.global_seqno.is_defined());
            let interim = guard.interim_committed;
            guard.interim_committed = false;
            (
                DependentKey::new(guard.global_seqno, guard.depends_seqno),
                SerialKey::new(guard.global_seqno),
                interim,
            )
        };

        if !interim && !self.commit_order_bypass() {
            self.commit_monitor.leave(&commit_key);
        }
        self.report_last_committed(self.cert.set_trx_committed(trx));
        self.apply_monitor.leave(&apply_key);
        trx.lock().set_state(TrxState::Committed);
        self.stats.local_commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Finish a rolled-back local transaction.
    pub fn post_rollback(&self, trx: &Arc<TrxHandle>) -> Result<()> {
        let mut guard = trx.lock();
        if guard.state() == TrxState::MustAbort {
            guard.set_state(TrxState::Aborting);
        }
        debug_assert!(matches!(
            guard.state(),
            TrxState::Aborting | TrxState::Executing
        ));
        guard.set_state(TrxState::RolledBack);
        drop(guard);
        self.stats.local_rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Brute-force abort a local transaction on behalf of an
    /// earlier-sequenced conflicting transaction. Interrupts whatever the
    /// victim is blocked on; the victim unwinds when it observes the state.
    pub fn abort_trx(&self, trx: &Arc<TrxHandle>) {
        assert!(trx.is_local(), "cannot abort a remote transaction");

        enum Wakeup {
            None,
            GroupSend(u64),
            Local(SerialKey),
            Apply(DependentKey),
            Commit(SerialKey),
        }

        let wakeup = {
            let mut guard = trx.lock();
            tracing::debug!(trx_id = %trx.trx_id(), state = %guard.state(), "BF abort");
            match guard.state() {
                TrxState::MustAbort | TrxState::Aborting => Wakeup::None,
                TrxState::Executing => {
                    guard.set_state(TrxState::MustAbort);
                    Wakeup::None
                }
                TrxState::Replicating => {
                    guard.set_state(TrxState::MustAbort);
                    match guard.gcs_handle {
                        Some(handle) => Wakeup::GroupSend(handle),
                        None => Wakeup::None,
                    }
                }
                TrxState::Certifying => {
                    guard.set_state(TrxState::MustAbort);
                    Wakeup::Local(SerialKey::new(guard.local_seqno))
                }
                TrxState::Applying => {
                    guard.set_state(TrxState::MustAbort);
                    Wakeup::Apply(DependentKey::new(guard.global_seqno, guard.depends_seqno))
                }
                TrxState::Committing => {
                    guard.set_state(TrxState::MustAbort);
                    if self.commit_order_bypass() {
                        Wakeup::None
                    } else {
                        Wakeup::Commit(SerialKey::new(guard.global_seqno))
                    }
                }
                other => panic!("invalid state for BF abort: {other}"),
            }
        };

        match wakeup {
            Wakeup::None => {}
            Wakeup::GroupSend(handle) => self.transport.interrupt(handle),
            Wakeup::Local(key) => self.local_monitor.interrupt(&key),
            Wakeup::Apply(key) => self.apply_monitor.interrupt(&key),
            Wakeup::Commit(key) => self.commit_monitor.interrupt(&key),
        }
    }

    // -----------------------------------------------------------------------
    // Total-order isolation
    // -----------------------------------------------------------------------

    /// Begin a total-order isolated action: certify, then hold both apply
    /// and commit order for the duration of the application callback.
    pub fn to_isolation_begin(&self, trx: &Arc<TrxHandle>, meta: &mut TrxMeta) -> Result<()> {
        {
            let guard = trx.lock();
            debug_assert_eq!(guard.state(), TrxState::Replicating);
            debug_assert_eq!(trx.trx_id(), TrxId::UNDEFINED);
            debug_assert!(guard.global_seqno > self.state_seqno());
        }
        self.fill_meta(trx, meta);

        match self.certify(trx) {
            CertOutcome::Ok => {
                let (apply_key, commit_key) = {
                    let guard = trx.lock();
                    (
                        DependentKey::new(guard.global_seqno, guard.depends_seqno),
                        SerialKey::new(guard.global_seqno),
                    )
                };
                if self.apply_monitor.enter(&apply_key) != Enter::Entered {
                    return Err(
                        self.consistency_failure("cannot enter apply order for isolated action")
                    );
                }
                if !self.commit_order_bypass()
                    && self.commit_monitor.enter(&commit_key) != Enter::Entered
                {
                    return Err(
                        self.consistency_failure("cannot enter commit order for isolated action")
                    );
                }
                trx.lock().set_state(TrxState::Applying);
                tracing::debug!(seqno = %apply_key.seqno(), "executing total-order isolated action");
                self.state_file.mark_unsafe()?;
                self.fill_meta(trx, meta);
                Ok(())
            }
            CertOutcome::TrxFail => {
                // Apply and commit slots were canceled during certification.
                let mut guard = trx.lock();
                if guard.state() == TrxState::MustAbort {
                    guard.set_state(TrxState::Aborting);
                }
                tracing::info!("certification failed for total-order isolated action");
                Err(Error::trx_fail(trx.trx_id(), "isolated action failed certification"))
            }
            CertOutcome::BfAbort => {
                Err(self.consistency_failure("isolated action cannot be BF aborted"))
            }
        }
    }

    /// Finish a total-order isolated action and release all ordering.
    pub fn to_isolation_end(&self, trx: &Arc<TrxHandle>) -> Result<()> {
        let (apply_key, commit_key) = {
            let guard = trx.lock();
            debug_assert_eq!(guard.state(), TrxState::Applying);
            (
                DependentKey::new(guard.global_seqno, guard.depends_seqno),
                SerialKey::new(guard.global_seqno),
            )
        };
        tracing::debug!(seqno = %apply_key.seqno(), "done with total-order isolated action");
        if !self.commit_order_bypass() {
            self.commit_monitor.leave(&commit_key);
        }
        self.report_last_committed(self.cert.set_trx_committed(trx));
        self.apply_monitor.leave(&apply_key);
        self.state_file.mark_safe()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Causal reads, pause/resume, desync
    // -----------------------------------------------------------------------

    /// Wait until this node has applied everything the group had committed
    /// at the time of the call.
    pub fn causal_read(&self) -> Result<Gtid> {
        let deadline = Instant::now() + self.config.causal_read_timeout;
        let seqno = self.transport.caused(deadline)?;
        debug_assert!(seqno.get() >= 0);

        self.apply_monitor.wait(seqno, deadline).map_err(|timeout| {
            tracing::info!(seqno = %timeout.seqno, "causal read wait timed out");
            Error::Timeout {
                seqno: timeout.seqno,
            }
        })?;
        self.stats.causal_reads.fetch_add(1, Ordering::Relaxed);
        Ok(Gtid::new(self.state_uuid(), seqno))
    }

    /// Drain the pipeline and hold local ordering for the caller's exclusive
    /// use. Returns the seqno the node is paused at.
    pub fn pause(&self) -> Result<Seqno> {
        let local_seqno = self.transport.local_sequence();
        let key = SerialKey::new(local_seqno);
        if self.local_monitor.enter(&key) != Enter::Entered {
            return Err(self.consistency_failure("pause slot unavailable"));
        }

        {
            let mut paused = self.pause_seqno.lock();
            assert!(!paused.is_defined(), "provider already paused");
            *paused = local_seqno;
        }

        let upto = self.cert.position();
        self.apply_monitor.drain(upto);
        debug_assert!(self.apply_monitor.last_left() >= upto);
        if !self.commit_order_bypass() {
            self.commit_monitor.drain(upto);
            debug_assert!(self.commit_monitor.last_left() >= upto);
        }

        let paused_at = self.state_seqno();
        self.state_file
            .set(self.state_uuid(), paused_at, *self.safe_to_bootstrap.lock())?;
        tracing::info!(uuid = %self.state_uuid(), seqno = %paused_at, "provider paused");
        Ok(paused_at)
    }

    /// Release the pause and let pending work proceed in reserved order.
    pub fn resume(&self) {
        let paused = {
            let mut paused = self.pause_seqno.lock();
            let seqno = *paused;
            *paused = Seqno::UNDEFINED;
            seqno
        };
        if !paused.is_defined() {
            tracing::warn!("tried to resume unpaused provider");
            return;
        }
        let _ = self
            .state_file
            .set(self.state_uuid(), Seqno::UNDEFINED, *self.safe_to_bootstrap.lock());
        self.local_monitor.leave(&SerialKey::new(paused));
        tracing::info!(seqno = %paused, "provider resumed");
    }

    /// Desynchronize from the group flow control (donor preparation).
    pub fn desync(&self) -> Result<()> {
        let local_seqno = self.transport.desync()?;
        if local_seqno.get() > 0 {
            let key = SerialKey::new(local_seqno);
            if self.local_monitor.enter(&key) != Enter::Entered {
                return Err(self.consistency_failure("desync slot unavailable"));
            }
            if self.state() != ReplicatorState::Donor {
                self.shift_to(ReplicatorState::Donor);
            }
            self.local_monitor.leave(&key);
        }
        Ok(())
    }

    /// Rejoin the group flow after a desync.
    pub fn resync(&self) -> Result<()> {
        self.transport.join(self.last_committed())
    }

    /// Install the position delivered by a completed state transfer and
    /// announce it to the group. The embedder calls this once its transfer
    /// machinery has brought the data store to `gtid`.
    pub fn state_transfer_received(&self, gtid: Gtid) -> Result<()> {
        tracing::info!(%gtid, "state transfer complete");
        self.update_state_uuid(gtid.node, gtid.seqno)?;
        self.apply_monitor.set_initial_position(gtid.seqno);
        if !self.commit_order_bypass() {
            self.commit_monitor.set_initial_position(gtid.seqno);
        }
        let trx_version = self.protocol.lock().trx;
        self.cert.assign_initial_position(gtid.seqno, trx_version);
        self.transport.join(gtid.seqno)
    }

    /// Number of transactions currently retained by certification.
    #[must_use]
    pub fn cert_index_size(&self) -> usize {
        self.cert.index_size()
    }

    // -----------------------------------------------------------------------
    // Group event handlers
    // -----------------------------------------------------------------------

    /// Certify and apply a remote transaction. Returns the exit-loop flag
    /// from the commit callback.
    fn process_trx(&self, trx: &Arc<TrxHandle>) -> Result<bool> {
        {
            let guard = trx.lock();
            debug_assert!(guard.local_seqno.get() > 0);
            debug_assert!(guard.global_seqno.get() > 0);
            debug_assert!(guard.last_seen_seqno.get() >= 0);
            debug_assert!(!guard.depends_seqno.is_defined());
            debug_assert_eq!(guard.state(), TrxState::Replicating);
        }

        match self.certify(trx) {
            CertOutcome::Ok => match self.apply_trx(trx) {
                Ok(exit_loop) => Ok(exit_loop),
                Err(err) => {
                    tracing::error!(%err, trx = ?trx, "failed to apply transaction");
                    Err(self.consistency_failure("apply failed"))
                }
            },
            CertOutcome::TrxFail => {
                // Deterministic certification failure; every node discards
                // this write set. Apply and commit slots are canceled.
                let mut guard = trx.lock();
                guard.set_state(TrxState::Aborting);
                guard.set_state(TrxState::RolledBack);
                Ok(false)
            }
            CertOutcome::BfAbort => {
                Err(self.consistency_failure("BF abort verdict for a remote transaction"))
            }
        }
    }

    /// Apply-and-commit for a certified remote transaction.
    fn apply_trx(&self, trx: &Arc<TrxHandle>) -> Result<bool> {
        let (apply_key, commit_key, flags, is_toi, data) = {
            let guard = trx.lock();
            debug_assert!(trx.is_certified());
            debug_assert!(guard.global_seqno > self.state_seqno());
            (
                DependentKey::new(guard.global_seqno, guard.depends_seqno),
                SerialKey::new(guard.global_seqno),
                guard.flags,
                guard.flags.contains(TrxFlags::ISOLATION),
                guard.write_set.data().to_vec(),
            )
        };
        let meta = TrxMeta {
            gtid: Gtid::new(self.state_uuid(), apply_key.seqno()),
            depends_seqno: trx.depends_seqno(),
        };

        if self.apply_monitor.enter(&apply_key) != Enter::Entered {
            return Err(Error::fatal("remote apply slot unavailable"));
        }
        trx.lock().set_state(TrxState::Applying);

        if is_toi {
            tracing::debug!(gtid = %meta.gtid, "executing total-order isolated action");
            self.state_file.mark_unsafe()?;
        }

        self.apply_with_retry(flags, &meta, &data, is_toi)?;

        if !self.commit_order_bypass() && is_toi {
            // Isolated actions are fully serialized, so commit ordering is
            // enforced here; for plain transactions it is deferred to the
            // application's group-commit pipeline.
            if self.commit_monitor.enter(&commit_key) != Enter::Entered {
                return Err(Error::fatal("remote commit slot unavailable"));
            }
        }
        trx.lock().set_state(TrxState::Committing);

        let exit_loop = self
            .hooks
            .commit(flags, &meta, true)
            .map_err(|err| Error::fatal(format!("commit failed: {err}")))?;

        if !self.commit_order_bypass() {
            if is_toi {
                self.commit_monitor.leave(&commit_key);
            } else {
                // The slot was never entered; account for it so the commit
                // watermark and drains stay coherent.
                self.commit_monitor.self_cancel(&commit_key);
            }
        }
        trx.lock().set_state(TrxState::Committed);

        if trx.local_seqno().is_defined() {
            self.report_last_committed(self.cert.set_trx_committed(trx));
        }
        self.apply_monitor.leave(&apply_key);

        if is_toi {
            tracing::debug!(gtid = %meta.gtid, "done with total-order isolated action");
            self.state_file.mark_safe()?;
        }
        Ok(exit_loop)
    }

    fn process_commit_cut(&self, seqno: Seqno, local_seqno: Seqno) -> Result<()> {
        let key = SerialKey::new(local_seqno);
        if self.local_monitor.enter(&key) != Enter::Entered {
            return Err(self.consistency_failure("commit cut slot unavailable"));
        }
        if seqno >= *self.cc_seqno.lock() {
            self.cert.purge_trxs_upto(seqno, true);
        }
        self.local_monitor.leave(&key);
        tracing::debug!(%seqno, "commit cut processed");
        Ok(())
    }

    fn process_conf_change(
        &self,
        mut view: ViewInfo,
        next_state: NextState,
        local_seqno: Seqno,
    ) -> Result<()> {
        self.update_incoming_list(&view);

        let key = SerialKey::new(local_seqno);
        if self.local_monitor.enter(&key) != Enter::Entered {
            return Err(self.consistency_failure("conf change slot unavailable"));
        }

        let upto = self.cert.position();
        if view.is_primary() {
            *self.safe_to_bootstrap.lock() = view.members.len() == 1;
        }
        self.apply_monitor.drain(upto);
        if !self.commit_order_bypass() {
            self.commit_monitor.drain(upto);
        }

        if let Some(index) = view.my_index {
            *self.node_id.lock() = view.members[index].id;
        }

        let group_uuid = view.state_id.node;
        let group_seqno = view.state_id.seqno;
        let st_required = self.state_transfer_required(&view);
        if st_required {
            tracing::info!(
                group = %view.state_id,
                local = %Gtid::new(self.state_uuid(), self.state_seqno()),
                "state transfer required"
            );
            if self.state() != ReplicatorState::Connected {
                self.shift_to(ReplicatorState::Connected);
            }
        }

        // Protocols must be in force before the view callback runs any
        // version-dependent code.
        if view.is_primary() {
            if let Err(err) = self.establish_protocol_versions(view.proto_version) {
                self.local_monitor.leave(&key);
                return Err(err);
            }
        }
        view.state_gap = st_required;

        let request = match self.hooks.view(&view) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(%err, "view callback failed; this is unrecoverable");
                self.local_monitor.leave(&key);
                self.close();
                return Err(Error::fatal("view callback failed"));
            }
        };

        if st_required && !request.wants_transfer() && self.state_uuid() != group_uuid {
            tracing::error!(
                local = %self.state_uuid(),
                group = %group_uuid,
                "state identity diverged from group and no transfer was requested"
            );
            self.local_monitor.leave(&key);
            self.close();
            return Err(Error::fatal("state divergence without transfer request"));
        }

        if view.is_primary() {
            // A state transfer does not carry the certification index; it is
            // rebuilt from this position.
            let trx_version = self.protocol.lock().trx;
            self.cert.assign_initial_position(group_seqno, trx_version);
            *self.cc_seqno.lock() = group_seqno;

            if st_required && request.wants_transfer() {
                // The transfer itself is driven by the embedder; it reports
                // completion through the group layer's join event.
                if self.state() == ReplicatorState::Connected {
                    self.shift_to(ReplicatorState::Joining);
                }
                tracing::info!("awaiting state transfer");
            } else {
                if view.view_id == 1 || !request.wants_transfer() {
                    self.update_state_uuid(group_uuid, group_seqno)?;
                    self.apply_monitor.set_initial_position(group_seqno);
                    if !self.commit_order_bypass() {
                        self.commit_monitor.set_initial_position(group_seqno);
                    }
                }

                let state = self.state();
                if matches!(state, ReplicatorState::Connected | ReplicatorState::Donor) {
                    match next_state {
                        NextState::Joining => self.shift_to(ReplicatorState::Joining),
                        NextState::Donor => {
                            if state == ReplicatorState::Connected {
                                self.shift_to(ReplicatorState::Donor);
                            }
                        }
                        NextState::Joined => self.shift_to(ReplicatorState::Joined),
                        NextState::Synced => {
                            self.shift_to(ReplicatorState::Synced);
                            self.hooks.synced();
                        }
                        other => tracing::debug!(?other, "no state shift for view"),
                    }
                }

                let _ = self.state_file.set(
                    self.state_uuid(),
                    Seqno::UNDEFINED,
                    *self.safe_to_bootstrap.lock(),
                );
            }
        } else {
            // Non-primary component.
            if self.state_uuid().is_defined() && next_state == NextState::Closing {
                let _ = self.state_file.set(
                    self.state_uuid(),
                    self.state_seqno(),
                    *self.safe_to_bootstrap.lock(),
                );
            }
            match next_state {
                NextState::Connected => {
                    self.shift_to(ReplicatorState::Connected);
                }
                NextState::Closing => self.shift_to(ReplicatorState::Closing),
                other => {
                    tracing::error!(?other, "unexpected next state for non-primary view");
                    self.local_monitor.leave(&key);
                    self.close();
                    return Err(Error::fatal("unexpected next state for non-primary view"));
                }
            }
        }

        self.local_monitor.leave(&key);
        Ok(())
    }

    fn process_join(&self, status: Seqno, local_seqno: Seqno) -> Result<()> {
        let key = SerialKey::new(local_seqno);
        if self.local_monitor.enter(&key) != Enter::Entered {
            return Err(self.consistency_failure("join slot unavailable"));
        }
        let upto = self.cert.position();
        self.apply_monitor.drain(upto);
        if !self.commit_order_bypass() {
            self.commit_monitor.drain(upto);
        }

        if status.get() < 0 && self.state() == ReplicatorState::Joining {
            tracing::error!(%status, "failed to receive state transfer; restart required");
            self.local_monitor.leave(&key);
            return Err(Error::fatal("state transfer failed"));
        }
        self.shift_to(ReplicatorState::Joined);
        self.local_monitor.leave(&key);
        Ok(())
    }

    fn process_sync(&self, local_seqno: Seqno) -> Result<()> {
        let key = SerialKey::new(local_seqno);
        if self.local_monitor.enter(&key) != Enter::Entered {
            return Err(self.consistency_failure("sync slot unavailable"));
        }
        let upto = self.cert.position();
        self.apply_monitor.drain(upto);
        if !self.commit_order_bypass() {
            self.commit_monitor.drain(upto);
        }
        self.shift_to(ReplicatorState::Synced);
        self.hooks.synced();
        self.local_monitor.leave(&key);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Certification plumbing
    // -----------------------------------------------------------------------

    /// Run certification under local order.
    ///
    /// Any panic in here is unrecoverable by design: it would leak the local
    /// ordering guarantee, and the process must die with it.
    fn certify(&self, trx: &Arc<TrxHandle>) -> CertOutcome {
        let local_key = {
            let mut guard = trx.lock();
            debug_assert!(matches!(
                guard.state(),
                TrxState::Replicating | TrxState::MustCertAndReplay
            ));
            debug_assert!(guard.local_seqno.is_defined() && guard.global_seqno.is_defined());
            debug_assert!(guard.last_seen_seqno.get() >= 0);
            debug_assert!(guard.last_seen_seqno < guard.global_seqno);
            guard.set_state(TrxState::Certifying);
            SerialKey::new(guard.local_seqno)
        };

        let interrupted = match self.local_monitor.enter(&local_key) {
            Enter::Entered => false,
            Enter::Interrupted => true,
            Enter::Canceled => panic!("local order slot canceled under certifier"),
        };

        let global_seqno = trx.global_seqno();
        let applicable = global_seqno > self.state_seqno();
        if !applicable {
            // The position was already covered by a state transfer; the
            // write set is a duplicate and must be discarded.
            let mut guard = trx.lock();
            if guard.state() != TrxState::MustAbort {
                guard.set_state(TrxState::MustAbort);
            }
            drop(guard);
            if interrupted {
                self.local_monitor.self_cancel(&local_key);
            } else {
                self.local_monitor.leave(&local_key);
            }
            return CertOutcome::TrxFail;
        }

        if interrupted {
            let outcome = self.cert_for_aborted(trx);
            if outcome == CertOutcome::TrxFail {
                self.local_monitor.self_cancel(&local_key);
                self.cancel_apply_commit(trx);
            }
            // On BfAbort the local slot stays pending; the replay enters it
            // again at the same position.
            return outcome;
        }

        let outcome = match self.cert.append_trx(trx) {
            TestResult::Ok => {
                trx.mark_certified();
                let mut guard = trx.lock();
                if guard.state() == TrxState::Certifying {
                    CertOutcome::Ok
                } else {
                    debug_assert_eq!(guard.state(), TrxState::MustAbort);
                    guard.set_state(TrxState::MustReplayAm);
                    CertOutcome::BfAbort
                }
            }
            TestResult::Failed => {
                if trx.is_toi() {
                    tracing::info!(trx = ?trx, "certification failed for isolated action");
                } else {
                    tracing::debug!(trx = ?trx, "certification failed");
                }
                if trx.is_local() {
                    self.stats.local_cert_failures.fetch_add(1, Ordering::Relaxed);
                }
                let mut guard = trx.lock();
                if guard.state() != TrxState::MustAbort {
                    guard.set_state(TrxState::MustAbort);
                }
                CertOutcome::TrxFail
            }
        };

        if outcome == CertOutcome::TrxFail {
            self.report_last_committed(self.cert.set_trx_committed(trx));
        }
        self.local_monitor.leave(&local_key);
        if outcome == CertOutcome::TrxFail {
            self.cancel_apply_commit(trx);
        }
        outcome
    }

    /// Revalidate a BF-aborted transaction whose write set is already
    /// ordered: replay if it would still pass certification, fail otherwise.
    fn cert_for_aborted(&self, trx: &Arc<TrxHandle>) -> CertOutcome {
        match self.cert.test(trx) {
            TestResult::Ok => {
                trx.lock().set_state(TrxState::MustCertAndReplay);
                CertOutcome::BfAbort
            }
            TestResult::Failed => {
                let mut guard = trx.lock();
                if guard.state() != TrxState::MustAbort {
                    guard.set_state(TrxState::MustAbort);
                }
                CertOutcome::TrxFail
            }
        }
    }

    /// Self-cancel the apply and commit slots of a failed transaction.
    fn cancel_apply_commit(&self, trx: &Arc<TrxHandle>) {
        let (apply_key, commit_key) = {
            let guard = trx.lock();
            (
                DependentKey::new(guard.global_seqno, guard.depends_seqno),
                SerialKey::new(guard.global_seqno),
            )
        };
        self.apply_monitor.self_cancel(&apply_key);
        if !self.commit_order_bypass() {
            self.commit_monitor.self_cancel(&commit_key);
        }
    }

    /// Self-cancel all three ordering slots of a failed transaction.
    fn cancel_monitors(&self, trx: &Arc<TrxHandle>) {
        let local_key = SerialKey::new(trx.local_seqno());
        self.local_monitor.self_cancel(&local_key);
        self.cancel_apply_commit(trx);
    }

    fn fill_meta(&self, trx: &Arc<TrxHandle>, meta: &mut TrxMeta) {
        let guard = trx.lock();
        meta.gtid = Gtid::new(self.state_uuid(), guard.global_seqno);
        meta.depends_seqno = guard.depends_seqno;
    }

    /// Invoke the apply callback with bounded retries.
    ///
    /// Recoverable failures roll the partial apply back via the commit
    /// callback (`commit = false`, safe without commit ordering) and try
    /// again; the counter starts at one and allows four total attempts.
    /// Isolated actions are tolerated to fail.
    fn apply_with_retry(
        &self,
        flags: TrxFlags,
        meta: &TrxMeta,
        data: &[u8],
        is_toi: bool,
    ) -> Result<()> {
        let mut attempts: u32 = 1;
        loop {
            match self.hooks.apply(flags, meta, data) {
                Ok(()) => return Ok(()),
                Err(err) if is_toi => {
                    tracing::warn!(%err, gtid = %meta.gtid, "ignoring error for isolated action");
                    return Ok(());
                }
                Err(ApplyError::Recoverable(status)) => {
                    self.hooks
                        .commit(flags, meta, false)
                        .map_err(|err| Error::fatal(format!("rollback failed: {err}")))?;
                    attempts += 1;
                    if attempts <= MAX_APPLY_ATTEMPTS {
                        tracing::warn!(status, attempts, gtid = %meta.gtid, "apply failed, retrying");
                    } else {
                        return Err(Error::fatal(format!(
                            "failed to apply write set {} {MAX_APPLY_ATTEMPTS} times",
                            meta.gtid
                        )));
                    }
                }
                Err(ApplyError::Fatal(detail)) => return Err(Error::fatal(detail)),
            }
        }
    }

    // -----------------------------------------------------------------------
    // View bookkeeping
    // -----------------------------------------------------------------------

    fn establish_protocol_versions(&self, proto: i32) -> Result<()> {
        let effective = proto.min(self.config.proto_max);
        let Some((trx, state_transfer)) = protocol_table(effective) else {
            tracing::error!(
                version = proto,
                "configuration change resulted in an unsupported protocol version"
            );
            return Err(Error::fatal(format!(
                "unsupported replication protocol version {proto}"
            )));
        };
        *self.protocol.lock() = ProtocolVersions {
            repl: effective,
            trx,
            state_transfer,
        };
        tracing::info!(repl = effective, trx, state_transfer, "replication protocols");
        Ok(())
    }

    /// Whether this node's state lags the group. The transport reports the
    /// raw gap; a matching identity narrows it to a seqno comparison.
    fn state_transfer_required(&self, view: &ViewInfo) -> bool {
        if !view.state_gap || !view.is_primary() {
            return false;
        }
        if self.state_uuid() == view.state_id.node {
            return self.state_seqno() < view.state_id.seqno;
        }
        true
    }

    fn update_state_uuid(&self, uuid: NodeId, seqno: Seqno) -> Result<()> {
        {
            let mut current = self.state_uuid.lock();
            if *current != uuid {
                tracing::info!(old = %*current, new = %uuid, "state identity change");
                *current = uuid;
            }
        }
        self.state_file
            .set(uuid, seqno, *self.safe_to_bootstrap.lock())
    }

    fn update_incoming_list(&self, view: &ViewInfo) {
        let joined = view
            .members
            .iter()
            .map(|member| member.incoming.as_str())
            .collect::<Vec<_>>()
            .join(",");
        *self.incoming_list.lock() = joined;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_transition_table() {
        use ReplicatorState::{
            Closed, Closing, Connected, Destroyed, Donor, Joined, Joining, Synced,
        };
        assert!(state_transition_allowed(Closed, Connected));
        assert!(state_transition_allowed(Closed, Destroyed));
        assert!(state_transition_allowed(Connected, Connected));
        assert!(state_transition_allowed(Connected, Joined));
        assert!(state_transition_allowed(Joining, Joined));
        assert!(state_transition_allowed(Joined, Synced));
        assert!(state_transition_allowed(Synced, Donor));
        assert!(state_transition_allowed(Donor, Joined));
        assert!(state_transition_allowed(Closing, Closed));

        assert!(!state_transition_allowed(Closed, Synced));
        assert!(!state_transition_allowed(Synced, Joined));
        assert!(!state_transition_allowed(Joining, Synced));
        assert!(!state_transition_allowed(Destroyed, Closed));
        assert!(!state_transition_allowed(Closing, Connected));
    }

    #[test]
    fn replication_acceptance() {
        assert!(ReplicatorState::Synced.accepts_replication());
        assert!(ReplicatorState::Joined.accepts_replication());
        assert!(ReplicatorState::Donor.accepts_replication());
        assert!(!ReplicatorState::Joining.accepts_replication());
        assert!(!ReplicatorState::Connected.accepts_replication());
        assert!(!ReplicatorState::Closed.accepts_replication());
    }

    #[test]
    fn protocol_version_mapping() {
        assert_eq!(protocol_table(1), Some((1, 0)));
        assert_eq!(protocol_table(4), Some((2, 1)));
        assert_eq!(protocol_table(8), Some((3, 2)));
        assert_eq!(protocol_table(9), Some((4, 2)));
        assert_eq!(protocol_table(10), None);
        assert_eq!(protocol_table(0), None);
    }
}
