//! Synchronous multi-master replication provider.
//!
//! The embedding database hands locally-produced write sets to the
//! [`Replicator`], which replicates them through a total-order group
//! transport, certifies them against concurrent write sets from other nodes
//! and drives them through an ordered apply/commit pipeline. Transactions
//! can be brute-force aborted by a conflicting earlier-sequenced transaction
//! at any point before commit and either roll back or replay at their
//! original position.
//!
//! The group transport and the application callbacks are supplied by the
//! embedder through the [`group::GroupTransport`] and
//! [`hooks::ReplicationHooks`] traits.

pub mod config;
pub mod group;
pub mod hooks;
pub mod replicator;
pub mod state_file;
pub mod transaction;

pub use config::{CommitOrderMode, ProviderConfig};
pub use group::{
    GroupEvent, GroupTransport, Member, NextState, Ordered, RecvError, SendError, ViewInfo,
    ViewStatus,
};
pub use hooks::{ApplyError, HookError, ReplicationHooks, StateRequest, TrxMeta};
pub use replicator::{
    state_transition_allowed, Replicator, ReplicatorState, StatsSnapshot,
};
pub use state_file::{StateFile, STATE_FILE_NAME};
pub use transaction::{legal_transition, TrxHandle, TrxInner, TrxState};
