//! Group communication transport contract.
//!
//! The transport delivers opaque actions in a single total order agreed by
//! the whole cluster and assigns each a global seqno (cluster-wide) and a
//! local seqno (per-node delivery order, which also covers non-ordered
//! events like view changes). The provider consumes the transport through
//! [`GroupTransport`]; the real implementation lives with the embedder.
//!
//! Ordered actions originated by this node come back through the blocking
//! [`GroupTransport::repl`] call with their seqnos assigned; the receive
//! stream delivers only actions from other nodes plus membership events.
//!
//! Both seqno spaces are gap-free: global seqnos increase by one per ordered
//! action cluster-wide, local seqnos by one per delivered event (ordered
//! actions and membership events alike). The ordering monitors rely on this.

use std::time::Instant;

use syncrep_error::Result;
use syncrep_types::{Gtid, NodeId, Seqno};

/// Cluster view status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewStatus {
    /// Primary component: replication proceeds.
    Primary,
    /// Non-primary component: replication is suspended.
    NonPrimary,
}

/// One cluster member as reported in a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: NodeId,
    pub name: String,
    /// Client-facing address, aggregated into the incoming list.
    pub incoming: String,
}

/// A new cluster configuration.
#[derive(Debug, Clone)]
pub struct ViewInfo {
    pub status: ViewStatus,
    /// Monotonic view number; `1` is the bootstrap view.
    pub view_id: i64,
    /// Group state identity and seqno at the view boundary.
    pub state_id: Gtid,
    pub members: Vec<Member>,
    /// This node's position in `members`, if present.
    pub my_index: Option<usize>,
    /// Replication protocol version negotiated for this view.
    pub proto_version: i32,
    /// On delivery: the group detected a gap between the position this node
    /// announced and the group state. Rewritten by the provider before the
    /// view callback with its final state-transfer decision.
    pub state_gap: bool,
}

impl ViewInfo {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.status == ViewStatus::Primary
    }
}

/// Membership state the transport suggests after a view change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Connected,
    Joining,
    Joined,
    Synced,
    Donor,
    Closing,
}

/// One event from the group layer's receive stream.
#[derive(Debug)]
pub enum GroupEvent {
    /// A totally-ordered action from another node.
    OrderedAction {
        local_seqno: Seqno,
        global_seqno: Seqno,
        payload: Vec<u8>,
    },
    /// Cluster-wide commit cut: everything at or below `seqno` is committed
    /// everywhere and certification state for it can be purged.
    CommitCut { seqno: Seqno, local_seqno: Seqno },
    /// New cluster configuration.
    ConfChange {
        view: ViewInfo,
        next_state: NextState,
        local_seqno: Seqno,
    },
    /// A node finished joining; negative status reports a failed transfer.
    Join { status: Seqno, local_seqno: Seqno },
    /// This node caught up with the cluster tail.
    Sync { local_seqno: Seqno },
}

/// Receive-stream termination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// The connection was closed (locally or by the group).
    #[error("group connection closed")]
    Closed,
    /// The group layer detected inconsistency; the node must not continue.
    #[error("group layer inconsistency: {0}")]
    Inconsistency(String),
}

/// Failure mode of a blocking ordered send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The send was interrupted via [`GroupTransport::interrupt`].
    #[error("send interrupted")]
    Interrupted,
    /// Transient congestion; retry after a short pause.
    #[error("group congested")]
    Congested,
    #[error("group connection closed")]
    Closed,
}

/// Seqnos assigned to a delivered ordered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ordered {
    pub local_seqno: Seqno,
    pub global_seqno: Seqno,
}

/// The group communication layer as seen by the provider.
pub trait GroupTransport: Send + Sync {
    /// Reserve a send slot. The returned handle stays valid until the send
    /// completes or [`GroupTransport::interrupt`] cancels it.
    fn schedule(&self) -> Result<u64>;

    /// Submit a totally-ordered action and block until it is delivered back
    /// with seqnos assigned.
    fn repl(&self, action: &[u8], handle: u64) -> std::result::Result<Ordered, SendError>;

    /// Cancel an outstanding scheduled send.
    fn interrupt(&self, handle: u64);

    /// Blocking receive of the next group event.
    fn recv(&self) -> std::result::Result<GroupEvent, RecvError>;

    /// Obtain the current group-wide tail seqno for a causal read.
    fn caused(&self, deadline: Instant) -> Result<Seqno>;

    fn connect(&self, cluster_name: &str, cluster_url: &str, bootstrap: bool) -> Result<()>;

    fn close(&self);

    /// Tell the group layer where this node's state is before connecting.
    fn set_initial_position(&self, id: NodeId, seqno: Seqno) -> Result<()>;

    /// Announce this node joined (or failed to join) at `seqno`.
    fn join(&self, seqno: Seqno) -> Result<()>;

    /// Ask the group to stop counting this node as synced. Returns the local
    /// seqno at which the desync takes effect.
    fn desync(&self) -> Result<Seqno>;

    /// Reserve and return the next local ordering slot; later deliveries
    /// receive higher slots. Used to pause the pipeline.
    fn local_sequence(&self) -> Seqno;

    /// Report the local last-committed seqno so the group can compute commit
    /// cuts.
    fn report_last_committed(&self, seqno: Seqno);

    /// Isolate this node from the cluster; called on fatal local failures so
    /// the remaining nodes re-evaluate quorum without it.
    fn isolate(&self);
}
