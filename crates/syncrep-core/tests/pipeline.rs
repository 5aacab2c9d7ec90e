//! End-to-end pipeline scenarios against a scripted in-memory transport.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use syncrep_core::{
    ApplyError, GroupEvent, GroupTransport, HookError, Member, NextState, Ordered,
    ProviderConfig, RecvError, ReplicationHooks, Replicator, ReplicatorState, SendError,
    StateRequest, TrxHandle, TrxMeta, TrxState, ViewInfo, ViewStatus,
};
use syncrep_error::{Error, Result};
use syncrep_types::{Gtid, Key, KeyAccess, KeyVersion, NodeId, Seqno, TrxFlags, TrxId};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TransportInner {
    events: VecDeque<GroupEvent>,
    closed: bool,
    local_seqno: i64,
    global_seqno: i64,
    next_handle: u64,
    interrupted: HashSet<u64>,
    hold_sends: bool,
    caused_tail: Option<i64>,
    joins: Vec<Seqno>,
    last_committed_reports: Vec<Seqno>,
    isolated: bool,
}

struct TestTransport {
    group_uuid: NodeId,
    inner: Mutex<TransportInner>,
    cond: Condvar,
}

impl TestTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            group_uuid: NodeId::generate(),
            inner: Mutex::new(TransportInner::default()),
            cond: Condvar::new(),
        })
    }

    fn push(&self, build: impl FnOnce(&mut TransportInner, Seqno) -> GroupEvent) {
        let mut inner = self.inner.lock();
        inner.local_seqno += 1;
        let local = Seqno::new(inner.local_seqno);
        let event = build(&mut inner, local);
        inner.events.push_back(event);
        drop(inner);
        self.cond.notify_all();
    }

    fn view(&self, members: usize, state_seqno: Seqno, state_gap: bool) -> ViewInfo {
        ViewInfo {
            status: ViewStatus::Primary,
            view_id: 1,
            state_id: Gtid::new(self.group_uuid, state_seqno),
            members: (0..members)
                .map(|i| Member {
                    id: NodeId::generate(),
                    name: format!("node{i}"),
                    incoming: format!("10.0.0.{i}:3306"),
                })
                .collect(),
            my_index: Some(0),
            proto_version: 9,
            state_gap,
        }
    }

    fn push_primary_view(&self, next_state: NextState) {
        let view = self.view(1, Seqno::ZERO, false);
        self.push(|_, local_seqno| GroupEvent::ConfChange {
            view,
            next_state,
            local_seqno,
        });
    }

    fn push_sync(&self) {
        self.push(|_, local_seqno| GroupEvent::Sync { local_seqno });
    }

    fn push_join(&self, status: Seqno) {
        self.push(|_, local_seqno| GroupEvent::Join {
            status,
            local_seqno,
        });
    }

    fn push_commit_cut(&self, seqno: Seqno) {
        self.push(|_, local_seqno| GroupEvent::CommitCut { seqno, local_seqno });
    }

    /// Deliver a remote write set, consuming the next global seqno.
    fn push_remote(&self, ws: syncrep_types::WriteSet) -> Seqno {
        let mut global = Seqno::UNDEFINED;
        self.push(|inner, local_seqno| {
            inner.global_seqno += 1;
            global = Seqno::new(inner.global_seqno);
            GroupEvent::OrderedAction {
                local_seqno,
                global_seqno: global,
                payload: ws.gather(),
            }
        });
        global
    }

    fn set_hold_sends(&self, hold: bool) {
        self.inner.lock().hold_sends = hold;
        self.cond.notify_all();
    }

    fn set_caused_tail(&self, seqno: Seqno) {
        self.inner.lock().caused_tail = Some(seqno.get());
    }

    fn joins(&self) -> Vec<Seqno> {
        self.inner.lock().joins.clone()
    }

    fn last_committed_reports(&self) -> Vec<Seqno> {
        self.inner.lock().last_committed_reports.clone()
    }
}

impl GroupTransport for TestTransport {
    fn schedule(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::conn_fail("transport closed"));
        }
        inner.next_handle += 1;
        Ok(inner.next_handle)
    }

    fn repl(&self, _action: &[u8], handle: u64) -> std::result::Result<Ordered, SendError> {
        let mut inner = self.inner.lock();
        while inner.hold_sends && !inner.interrupted.contains(&handle) && !inner.closed {
            self.cond.wait(&mut inner);
        }
        if inner.interrupted.remove(&handle) {
            return Err(SendError::Interrupted);
        }
        if inner.closed {
            return Err(SendError::Closed);
        }
        inner.local_seqno += 1;
        inner.global_seqno += 1;
        Ok(Ordered {
            local_seqno: Seqno::new(inner.local_seqno),
            global_seqno: Seqno::new(inner.global_seqno),
        })
    }

    fn interrupt(&self, handle: u64) {
        self.inner.lock().interrupted.insert(handle);
        self.cond.notify_all();
    }

    fn recv(&self) -> std::result::Result<GroupEvent, RecvError> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(event) = inner.events.pop_front() {
                return Ok(event);
            }
            if inner.closed {
                return Err(RecvError::Closed);
            }
            self.cond.wait(&mut inner);
        }
    }

    fn caused(&self, _deadline: Instant) -> Result<Seqno> {
        let inner = self.inner.lock();
        Ok(Seqno::new(inner.caused_tail.unwrap_or(inner.global_seqno)))
    }

    fn connect(&self, _cluster_name: &str, _cluster_url: &str, _bootstrap: bool) -> Result<()> {
        Ok(())
    }

    fn close(&self) {
        let view = ViewInfo {
            status: ViewStatus::NonPrimary,
            view_id: -1,
            state_id: Gtid::new(self.group_uuid, Seqno::UNDEFINED),
            members: Vec::new(),
            my_index: None,
            proto_version: -1,
            state_gap: false,
        };
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.local_seqno += 1;
        let local_seqno = Seqno::new(inner.local_seqno);
        inner.events.push_back(GroupEvent::ConfChange {
            view,
            next_state: NextState::Closing,
            local_seqno,
        });
        inner.closed = true;
        drop(inner);
        self.cond.notify_all();
    }

    fn set_initial_position(&self, _id: NodeId, _seqno: Seqno) -> Result<()> {
        Ok(())
    }

    fn join(&self, seqno: Seqno) -> Result<()> {
        self.inner.lock().joins.push(seqno);
        Ok(())
    }

    fn desync(&self) -> Result<Seqno> {
        let mut inner = self.inner.lock();
        inner.local_seqno += 1;
        Ok(Seqno::new(inner.local_seqno))
    }

    fn local_sequence(&self) -> Seqno {
        let mut inner = self.inner.lock();
        inner.local_seqno += 1;
        Seqno::new(inner.local_seqno)
    }

    fn report_last_committed(&self, seqno: Seqno) {
        self.inner.lock().last_committed_reports.push(seqno);
    }

    fn isolate(&self) {
        self.inner.lock().isolated = true;
    }
}

// ---------------------------------------------------------------------------
// Recording hooks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TestHooks {
    /// (global seqno, depends seqno, payload) per apply call.
    applied: Mutex<Vec<(Seqno, Seqno, Vec<u8>)>>,
    /// Global seqnos per commit(commit=true) call.
    committed: Mutex<Vec<Seqno>>,
    rolled_back: Mutex<Vec<Seqno>>,
    synced_count: AtomicUsize,
    /// Apply calls block while this is set (gates a remote apply).
    apply_gate: AtomicBool,
    gate_cond: Condvar,
    gate_mutex: Mutex<()>,
    /// Consume one recoverable failure per apply call while nonzero.
    apply_failures: AtomicU64,
    /// What to answer the next view callback with.
    state_request: Mutex<StateRequest>,
}

impl TestHooks {
    fn new() -> Arc<Self> {
        let hooks = Self {
            state_request: Mutex::new(StateRequest::None),
            ..Self::default()
        };
        Arc::new(hooks)
    }

    fn applied(&self) -> Vec<(Seqno, Seqno, Vec<u8>)> {
        self.applied.lock().clone()
    }

    fn committed(&self) -> Vec<Seqno> {
        self.committed.lock().clone()
    }

    fn open_gate(&self) {
        let _guard = self.gate_mutex.lock();
        self.apply_gate.store(false, Ordering::SeqCst);
        self.gate_cond.notify_all();
    }

    fn close_gate(&self) {
        let _guard = self.gate_mutex.lock();
        self.apply_gate.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct HooksHandle(Arc<TestHooks>);

impl std::ops::Deref for HooksHandle {
    type Target = TestHooks;
    fn deref(&self) -> &TestHooks {
        &self.0
    }
}

impl ReplicationHooks for HooksHandle {
    fn apply(&self, _flags: TrxFlags, meta: &TrxMeta, data: &[u8]) -> std::result::Result<(), ApplyError> {
        {
            let mut guard = self.gate_mutex.lock();
            while self.apply_gate.load(Ordering::SeqCst) {
                self.gate_cond.wait(&mut guard);
            }
        }
        if self.apply_failures.load(Ordering::SeqCst) > 0 {
            self.apply_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ApplyError::Recoverable(1));
        }
        self.applied
            .lock()
            .push((meta.gtid.seqno, meta.depends_seqno, data.to_vec()));
        Ok(())
    }

    fn commit(
        &self,
        _flags: TrxFlags,
        meta: &TrxMeta,
        commit: bool,
    ) -> std::result::Result<bool, HookError> {
        if commit {
            self.committed.lock().push(meta.gtid.seqno);
        } else {
            self.rolled_back.lock().push(meta.gtid.seqno);
        }
        Ok(false)
    }

    fn view(&self, _view: &ViewInfo) -> std::result::Result<StateRequest, HookError> {
        Ok(self.state_request.lock().clone())
    }

    fn synced(&self) {
        self.synced_count.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Node {
    replicator: Arc<Replicator<TestTransport, HooksHandle>>,
    transport: Arc<TestTransport>,
    hooks: Arc<TestHooks>,
    recv_thread: Option<thread::JoinHandle<Result<()>>>,
    _dir: TempDir,
}

impl Node {
    fn start() -> Self {
        Self::start_with(ProviderConfig::default())
    }

    fn start_with(mut config: ProviderConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let dir = TempDir::new().unwrap();
        config.base_dir = dir.path().to_path_buf();
        let transport = TestTransport::new();
        let hooks = TestHooks::new();
        let replicator = Arc::new(
            Replicator::new(config, Arc::clone(&transport), HooksHandle(Arc::clone(&hooks))).unwrap(),
        );
        replicator.connect("testcluster", "inmem://", true).unwrap();

        let recv_thread = {
            let replicator = Arc::clone(&replicator);
            thread::spawn(move || replicator.recv_loop())
        };
        Self {
            replicator,
            transport,
            hooks,
            recv_thread: Some(recv_thread),
            _dir: dir,
        }
    }

    /// Bring the node to SYNCED through a bootstrap view and a sync event.
    fn sync(&self) {
        self.transport.push_primary_view(NextState::Joined);
        self.transport.push_sync();
        self.replicator
            .wait_for_state(|state| state == ReplicatorState::Synced);
    }

    /// Build a local transaction with one exclusive key and a payload.
    fn local_trx(&self, trx_id: u64, key_parts: &[&[u8]], data: &[u8]) -> Arc<TrxHandle> {
        let trx = self.replicator.new_trx(TrxId::new(trx_id));
        trx.append_key(
            Key::from_parts(KeyVersion::V1, key_parts).unwrap(),
            KeyAccess::Exclusive,
        )
        .unwrap();
        trx.append_data(data).unwrap();
        trx.set_flags(TrxFlags::COMMIT);
        trx
    }

    /// A remote write set as another node would produce it.
    fn remote_ws(
        &self,
        key_parts: &[&[u8]],
        access: KeyAccess,
        last_seen: Seqno,
        data: &[u8],
    ) -> syncrep_types::WriteSet {
        let mut ws =
            syncrep_types::WriteSet::new(KeyVersion::V1, NodeId::generate(), TrxId::UNDEFINED);
        ws.set_flags(TrxFlags::COMMIT);
        ws.set_last_seen_seqno(last_seen);
        ws.append_key(Key::from_parts(KeyVersion::V1, key_parts).unwrap(), access)
            .unwrap();
        ws.append_data(data).unwrap();
        ws
    }

    fn commit_locally(&self, trx: &Arc<TrxHandle>) -> Result<()> {
        let mut meta = TrxMeta {
            gtid: Gtid::UNDEFINED,
            depends_seqno: Seqno::UNDEFINED,
        };
        self.replicator.replicate(trx, &mut meta)?;
        self.replicator.pre_commit(trx, &mut meta)?;
        self.replicator.post_commit(trx)
    }

    fn shutdown(mut self) {
        self.replicator.close();
        if let Some(handle) = self.recv_thread.take() {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(self.replicator.state(), ReplicatorState::Closed);
    }
}

fn wait_until(predicate: impl Fn() -> bool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(predicate(), "timed out waiting for condition");
}

const KEY_A: &[&[u8]] = &[b"db", b"t", b"a"];
const KEY_B: &[&[u8]] = &[b"db", b"t", b"b"];

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn bootstrap_reaches_synced_and_shuts_down() {
    let node = Node::start();
    node.sync();
    assert_eq!(node.hooks.synced_count.load(Ordering::SeqCst), 1);
    assert_eq!(node.replicator.incoming_list(), "10.0.0.0:3306");
    assert_eq!(node.replicator.state_uuid(), node.transport.group_uuid);
    assert!(node.replicator.node_id().is_defined());
    assert_eq!(node.replicator.protocol_versions(), (9, 4, 2));
    node.shutdown();
}

#[test]
fn non_conflicting_remote_commits_in_order() {
    let node = Node::start();
    node.sync();

    let g1 = node
        .transport
        .push_remote(node.remote_ws(KEY_A, KeyAccess::Exclusive, Seqno::ZERO, b"t1"));
    let g2 = node
        .transport
        .push_remote(node.remote_ws(KEY_B, KeyAccess::Exclusive, Seqno::ZERO, b"t2"));

    wait_until(|| node.hooks.committed().len() == 2, Duration::from_secs(5));
    let applied = node.hooks.applied();
    assert_eq!(applied.len(), 2);
    // Applied in seqno order, neither depending on the other.
    assert_eq!(applied[0].0, g1);
    assert_eq!(applied[1].0, g2);
    assert_eq!(applied[0].1, Seqno::UNDEFINED);
    assert_eq!(applied[1].1, Seqno::UNDEFINED);
    assert_eq!(node.hooks.committed(), vec![g1, g2]);

    // Commits advanced the safe-to-discard horizon toward the tail.
    let reports = node.transport.last_committed_reports();
    assert_eq!(reports.last().copied(), Some(g2));
    node.shutdown();
}

#[test]
fn first_committer_wins_on_conflicting_local_transactions() {
    let node = Node::start();
    node.sync();

    let t1 = node.local_trx(1, KEY_A, b"first");
    let t2 = node.local_trx(2, KEY_A, b"second");
    let mut meta = TrxMeta {
        gtid: Gtid::UNDEFINED,
        depends_seqno: Seqno::UNDEFINED,
    };

    // Both replicate before either commits: same certification window.
    node.replicator.replicate(&t1, &mut meta).unwrap();
    assert_eq!(t1.lock().last_seen_seqno, Seqno::ZERO);
    node.replicator.replicate(&t2, &mut meta).unwrap();
    assert_eq!(t2.lock().last_seen_seqno, Seqno::ZERO);

    node.replicator.pre_commit(&t1, &mut meta).unwrap();
    node.replicator.post_commit(&t1).unwrap();
    assert_eq!(t1.state(), TrxState::Committed);

    let err = node.replicator.pre_commit(&t2, &mut meta).unwrap_err();
    assert!(matches!(err, Error::TrxFail { .. }));
    node.replicator.post_rollback(&t2).unwrap();
    assert_eq!(t2.state(), TrxState::RolledBack);

    let stats = node.replicator.stats();
    assert_eq!(stats.local_commits, 1);
    assert_eq!(stats.local_cert_failures, 1);
    assert_eq!(stats.local_rollbacks, 1);
    node.shutdown();
}

#[test]
fn bf_abort_in_apply_wait_is_replayed_at_same_seqno() {
    let node = Node::start();
    node.sync();

    // A remote shared-key write occupies the apply pipeline behind a gate.
    node.hooks.close_gate();
    let g1 = node
        .transport
        .push_remote(node.remote_ws(KEY_A, KeyAccess::Shared, Seqno::ZERO, b"remote"));

    // The local transaction shares the key, so certification passes but
    // records a dependency on the remote write.
    let trx = node.replicator.new_trx(TrxId::new(7));
    trx.append_key(
        Key::from_parts(KeyVersion::V1, KEY_A).unwrap(),
        KeyAccess::Shared,
    )
    .unwrap();
    trx.append_data(b"local").unwrap();
    trx.set_flags(TrxFlags::COMMIT);

    let mut meta = TrxMeta {
        gtid: Gtid::UNDEFINED,
        depends_seqno: Seqno::UNDEFINED,
    };
    node.replicator.replicate(&trx, &mut meta).unwrap();
    let global = trx.global_seqno();
    assert_eq!(global, g1.next());

    let pre_commit_result = {
        let replicator = Arc::clone(&node.replicator);
        let trx = Arc::clone(&trx);
        thread::spawn(move || {
            let mut meta = TrxMeta {
                gtid: Gtid::UNDEFINED,
                depends_seqno: Seqno::UNDEFINED,
            };
            replicator.pre_commit(&trx, &mut meta)
        })
    };

    // The transaction ends up waiting in its apply-order slot (its
    // dependency has not left yet).
    wait_until(|| trx.state() == TrxState::Applying, Duration::from_secs(5));
    thread::sleep(Duration::from_millis(20));

    node.replicator.abort_trx(&trx);
    let err = pre_commit_result.join().unwrap().unwrap_err();
    assert!(err.must_replay(), "expected BF abort, got {err}");
    assert_eq!(trx.state(), TrxState::MustReplayAm);

    // Let the remote transaction finish, then replay at the original seqno.
    node.hooks.open_gate();
    wait_until(|| node.hooks.committed().len() == 1, Duration::from_secs(5));

    node.replicator.replay_trx(&trx).unwrap();
    node.replicator.post_commit(&trx).unwrap();
    assert_eq!(trx.state(), TrxState::Committed);
    assert_eq!(trx.global_seqno(), global);

    let stats = node.replicator.stats();
    assert_eq!(stats.local_replays, 1);
    assert_eq!(stats.local_commits, 1);

    // The replayed transaction committed after the remote one.
    assert_eq!(node.hooks.committed(), vec![g1, global]);
    node.shutdown();
}

#[test]
fn bf_abort_during_group_send_rolls_back() {
    let node = Node::start();
    node.sync();

    node.transport.set_hold_sends(true);
    let trx = node.local_trx(3, KEY_A, b"stuck");
    let replicate_result = {
        let replicator = Arc::clone(&node.replicator);
        let trx = Arc::clone(&trx);
        thread::spawn(move || {
            let mut meta = TrxMeta {
                gtid: Gtid::UNDEFINED,
                depends_seqno: Seqno::UNDEFINED,
            };
            replicator.replicate(&trx, &mut meta)
        })
    };

    wait_until(|| trx.state() == TrxState::Replicating, Duration::from_secs(5));
    thread::sleep(Duration::from_millis(20));
    node.replicator.abort_trx(&trx);

    let err = replicate_result.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::TrxFail { .. }));
    assert_eq!(trx.state(), TrxState::Aborting);
    node.replicator.post_rollback(&trx).unwrap();

    node.transport.set_hold_sends(false);
    node.shutdown();
}

#[test]
fn abort_before_replication_fails_fast() {
    let node = Node::start();
    node.sync();

    let trx = node.local_trx(4, KEY_A, b"never sent");
    node.replicator.abort_trx(&trx);
    assert_eq!(trx.state(), TrxState::MustAbort);

    let mut meta = TrxMeta {
        gtid: Gtid::UNDEFINED,
        depends_seqno: Seqno::UNDEFINED,
    };
    let err = node.replicator.replicate(&trx, &mut meta).unwrap_err();
    assert!(matches!(err, Error::TrxFail { .. }));
    assert_eq!(trx.state(), TrxState::Aborting);
    node.shutdown();
}

#[test]
fn oversized_write_set_is_rejected() {
    let node = Node::start_with(ProviderConfig {
        max_write_set_size: 64,
        ..ProviderConfig::default()
    });
    node.sync();

    // The configured cap is enforced as the write set is built.
    let trx = node.replicator.new_trx(TrxId::new(5));
    let err = trx.append_data(&[0_u8; 256]).unwrap_err();
    assert!(matches!(
        err,
        syncrep_types::WriteSetError::TooLarge { max: 64, .. }
    ));

    // A handle built without the cap is still rejected at replication.
    let unchecked = Arc::new(TrxHandle::new_local(
        TrxId::new(6),
        NodeId::generate(),
        KeyVersion::V1,
        usize::MAX,
    ));
    unchecked.append_data(&[0_u8; 256]).unwrap();
    unchecked.set_flags(TrxFlags::COMMIT);
    let mut meta = TrxMeta {
        gtid: Gtid::UNDEFINED,
        depends_seqno: Seqno::UNDEFINED,
    };
    let err = node.replicator.replicate(&unchecked, &mut meta).unwrap_err();
    assert!(matches!(err, Error::WriteSetTooLarge { .. }));
    node.replicator.post_rollback(&unchecked).unwrap();
    node.shutdown();
}

#[test]
fn causal_read_waits_for_apply() {
    let node = Node::start();
    node.sync();

    let mut tail = Seqno::ZERO;
    for i in 0..5 {
        tail = node.transport.push_remote(node.remote_ws(
            &[b"db", b"t", format!("row{i}").as_bytes()],
            KeyAccess::Exclusive,
            Seqno::ZERO,
            b"x",
        ));
    }

    let gtid = node.replicator.causal_read().unwrap();
    assert_eq!(gtid.seqno, tail);
    // Everything up to the tail had been applied before the call returned.
    assert!(node.hooks.committed().len() == 5);
    assert_eq!(node.replicator.stats().causal_reads, 1);
    node.shutdown();
}

#[test]
fn causal_read_times_out_when_apply_lags() {
    let node = Node::start_with(ProviderConfig {
        causal_read_timeout: Duration::from_millis(50),
        ..ProviderConfig::default()
    });
    node.sync();

    // The group tail is ahead of anything this node will ever apply.
    node.transport.set_caused_tail(Seqno::new(100));
    let err = node.replicator.causal_read().unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    node.shutdown();
}

#[test]
fn pause_blocks_new_work_and_resume_releases_it() {
    let node = Node::start();
    node.sync();

    let paused_at = node.replicator.pause().unwrap();
    assert_eq!(paused_at, Seqno::ZERO);

    let trx = node.local_trx(6, KEY_A, b"after pause");
    let committed = Arc::new(AtomicBool::new(false));
    let worker = {
        let replicator = Arc::clone(&node.replicator);
        let trx = Arc::clone(&trx);
        let committed = Arc::clone(&committed);
        thread::spawn(move || {
            let mut meta = TrxMeta {
                gtid: Gtid::UNDEFINED,
                depends_seqno: Seqno::UNDEFINED,
            };
            replicator.replicate(&trx, &mut meta).unwrap();
            replicator.pre_commit(&trx, &mut meta).unwrap();
            replicator.post_commit(&trx).unwrap();
            committed.store(true, Ordering::SeqCst);
        })
    };

    // Certification is gated by the held local order.
    thread::sleep(Duration::from_millis(50));
    assert!(!committed.load(Ordering::SeqCst));

    node.replicator.resume();
    worker.join().unwrap();
    assert!(committed.load(Ordering::SeqCst));
    node.shutdown();
}

#[test]
fn remote_toi_holds_commit_order_and_marks_state() {
    let node = Node::start();
    node.sync();

    let mut ws =
        syncrep_types::WriteSet::new(KeyVersion::V1, NodeId::generate(), TrxId::UNDEFINED);
    ws.set_flags(TrxFlags::COMMIT | TrxFlags::ISOLATION);
    ws.set_last_seen_seqno(Seqno::ZERO);
    ws.append_data(b"create table").unwrap();
    let seqno = node.transport.push_remote(ws);

    wait_until(|| node.hooks.committed().len() == 1, Duration::from_secs(5));
    assert_eq!(node.hooks.committed(), vec![seqno]);
    node.shutdown();
}

#[test]
fn recoverable_apply_failures_are_retried() {
    let node = Node::start();
    node.sync();

    // Two recoverable failures, then success: three attempts, within bound.
    node.hooks.apply_failures.store(2, Ordering::SeqCst);
    let seqno = node
        .transport
        .push_remote(node.remote_ws(KEY_A, KeyAccess::Exclusive, Seqno::ZERO, b"retry me"));

    wait_until(|| node.hooks.committed().len() == 1, Duration::from_secs(5));
    assert_eq!(node.hooks.committed(), vec![seqno]);
    // Each failed attempt was rolled back before the retry.
    assert_eq!(node.hooks.rolled_back.lock().len(), 2);
    node.shutdown();
}

#[test]
fn commit_cut_purges_certification_index() {
    let node = Node::start();
    node.sync();

    let g1 = node
        .transport
        .push_remote(node.remote_ws(KEY_A, KeyAccess::Exclusive, Seqno::ZERO, b"x"));
    wait_until(|| node.hooks.committed().len() == 1, Duration::from_secs(5));
    assert_eq!(node.replicator.cert_index_size(), 1);

    node.transport.push_commit_cut(g1);
    wait_until(|| node.replicator.cert_index_size() == 0, Duration::from_secs(5));
    node.shutdown();
}

#[test]
fn joiner_installs_state_transfer_before_joining() {
    let dir = TempDir::new().unwrap();
    let config = ProviderConfig {
        base_dir: dir.path().to_path_buf(),
        ..ProviderConfig::default()
    };
    let transport = TestTransport::new();
    let hooks = TestHooks::new();
    *hooks.state_request.lock() = StateRequest::Transfer(b"donor please".to_vec());
    let replicator = Arc::new(
        Replicator::new(config, Arc::clone(&transport), HooksHandle(Arc::clone(&hooks))).unwrap(),
    );
    replicator.connect("testcluster", "inmem://", true).unwrap();
    let recv_thread = {
        let replicator = Arc::clone(&replicator);
        thread::spawn(move || replicator.recv_loop())
    };

    // The group is at seqno 40 and reports a gap for this empty node.
    let group_seqno = Seqno::new(40);
    let view = transport.view(2, group_seqno, true);
    transport.push(|_, local_seqno| GroupEvent::ConfChange {
        view,
        next_state: NextState::Joining,
        local_seqno,
    });
    replicator.wait_for_state(|state| state == ReplicatorState::Joining);

    // The embedder's transfer machinery completes and reports the position.
    replicator
        .state_transfer_received(Gtid::new(transport.group_uuid, group_seqno))
        .unwrap();
    assert_eq!(transport.joins(), vec![group_seqno]);

    transport.push_join(group_seqno);
    replicator.wait_for_state(|state| state == ReplicatorState::Joined);
    transport.push_sync();
    replicator.wait_for_state(|state| state == ReplicatorState::Synced);

    // Replication proceeds from the transferred position.
    assert_eq!(replicator.state_seqno(), group_seqno);

    replicator.close();
    recv_thread.join().unwrap().unwrap();
}

#[test]
fn local_toi_holds_all_ordering_for_the_callback() {
    let node = Node::start();
    node.sync();

    let trx = node.replicator.new_toi();
    trx.append_data(b"alter table").unwrap();
    let mut meta = TrxMeta {
        gtid: Gtid::UNDEFINED,
        depends_seqno: Seqno::UNDEFINED,
    };
    node.replicator.replicate(&trx, &mut meta).unwrap();
    let global = trx.global_seqno();

    node.replicator.to_isolation_begin(&trx, &mut meta).unwrap();
    assert_eq!(trx.state(), TrxState::Applying);
    // Isolated actions serialize against everything before them.
    assert_eq!(meta.depends_seqno, global.prev());

    // The application executes the action here, with all ordering held.
    node.replicator.to_isolation_end(&trx).unwrap();

    // Ordering has been released: an ordinary transaction can commit.
    let follow_up = node.local_trx(8, KEY_B, b"after ddl");
    node.commit_locally(&follow_up).unwrap();
    assert_eq!(follow_up.state(), TrxState::Committed);
    node.shutdown();
}

#[test]
fn interim_commit_releases_commit_order_early() {
    let node = Node::start();
    node.sync();

    let trx = node.local_trx(9, KEY_A, b"queued");
    let mut meta = TrxMeta {
        gtid: Gtid::UNDEFINED,
        depends_seqno: Seqno::UNDEFINED,
    };
    node.replicator.replicate(&trx, &mut meta).unwrap();
    node.replicator.pre_commit(&trx, &mut meta).unwrap();

    // Release commit ordering while the transaction is still in the
    // application's commit queue.
    node.replicator.interim_commit(&trx).unwrap();

    // A later transaction can take the commit order before post_commit.
    let follow_up = node.local_trx(10, KEY_B, b"overtakes nothing");
    node.commit_locally(&follow_up).unwrap();

    node.replicator.post_commit(&trx).unwrap();
    assert_eq!(trx.state(), TrxState::Committed);
    assert_eq!(node.replicator.stats().local_commits, 2);
    node.shutdown();
}

#[test]
fn desync_and_resync_move_through_donor() {
    let node = Node::start();
    node.sync();

    node.replicator.desync().unwrap();
    assert_eq!(node.replicator.state(), ReplicatorState::Donor);

    node.replicator.resync().unwrap();
    assert_eq!(node.transport.joins(), vec![Seqno::ZERO]);

    // The group acknowledges the rejoin.
    node.transport.push_join(Seqno::ZERO);
    node.replicator
        .wait_for_state(|state| state == ReplicatorState::Joined);
    node.transport.push_sync();
    node.replicator
        .wait_for_state(|state| state == ReplicatorState::Synced);
    node.shutdown();
}
