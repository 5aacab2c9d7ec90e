//! Foundation types for the syncrep replication provider.
//!
//! Identifier newtypes, transaction flags, versioned certification keys and
//! the write-set wire container. Runtime machinery (monitors, certification,
//! the replicator itself) lives in the sibling crates and builds on these.

pub mod encoding;
pub mod ids;
pub mod key;
pub mod writeset;

pub use encoding::DecodeError;
pub use ids::{Gtid, NodeId, Seqno, TrxFlags, TrxId};
pub use key::{Key, KeyError, KeyRef, KeyVersion, V0_MAX_PARTS, V0_MAX_PART_LEN};
pub use writeset::{
    KeyAccess, KeyRecord, WriteSet, WriteSetError, MIN_SHARED_KEY_VERSION, WRITE_SET_VERSION,
};
