//! Sequence numbers, transaction identifiers and global transaction ids.

use std::fmt;

use uuid::Uuid;

/// Group-assigned sequence number (global or local, depending on context).
///
/// `-1` is the undefined sentinel: not yet assigned by the group layer, or
/// "no dependency" when used as a `depends_seqno`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Seqno(i64);

impl Seqno {
    pub const UNDEFINED: Self = Self(-1);
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether the group layer has assigned this seqno.
    #[inline]
    #[must_use]
    pub const fn is_defined(self) -> bool {
        self.0 >= 0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Seqno {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Locally-unique identifier of a client transaction.
///
/// Remote transactions and total-order-isolated actions carry
/// [`TrxId::UNDEFINED`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TrxId(u64);

impl TrxId {
    pub const UNDEFINED: Self = Self(u64::MAX);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_defined(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_defined() {
            write!(f, "trx#{}", self.0)
        } else {
            f.write_str("trx#-")
        }
    }
}

/// Identity of a cluster member (also used as replication-state identity).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// The all-zero undefined identity.
    pub const UNDEFINED: Self = Self(Uuid::nil());

    #[inline]
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[inline]
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn is_defined(self) -> bool {
        !self.0.is_nil()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global transaction identifier: state identity plus global seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Gtid {
    pub node: NodeId,
    pub seqno: Seqno,
}

impl Gtid {
    pub const UNDEFINED: Self = Self {
        node: NodeId::UNDEFINED,
        seqno: Seqno::UNDEFINED,
    };

    #[inline]
    pub const fn new(node: NodeId, seqno: Seqno) -> Self {
        Self { node, seqno }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.seqno)
    }
}

/// Transaction flag bits carried in the replicated write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct TrxFlags(u32);

impl TrxFlags {
    /// Write set ends the transaction; commit on successful apply.
    pub const COMMIT: Self = Self(1);
    /// Write set requests rollback of the transaction.
    pub const ROLLBACK: Self = Self(1 << 1);
    /// Total-order isolated action (schema change and similar).
    pub const ISOLATION: Self = Self(1 << 2);
    /// Action is unsafe for parallel apply.
    pub const PA_UNSAFE: Self = Self(1 << 3);
    /// Write set was ordered outside the provider and injected preordered.
    pub const PREORDERED: Self = Self(1 << 4);

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for TrxFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}
