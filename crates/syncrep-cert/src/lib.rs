//! Write-set certification.
//!
//! Every replicated transaction passes through [`Certification::append_trx`]
//! in global-seqno order (the caller serializes on the local-order monitor).
//! The engine keeps an index of the keys referenced by recently-committed
//! transactions and checks each incoming write set against it:
//!
//! - an exclusive match against an entry newer than the transaction's
//!   `last_seen_seqno` is a conflict: first committer wins and the incoming
//!   transaction fails;
//! - any other match establishes an apply-order dependency, recorded as the
//!   transaction's `depends_seqno`.
//!
//! The decision is a pure function of the write set and the index, both of
//! which are identical on every node at a given global seqno, so every node
//! reaches the same verdict.
//!
//! Index entries are garbage-collected up to the *safe-to-discard* seqno:
//! the smallest `last_seen_seqno` over transactions still in flight (or the
//! index position when none are). Nothing at or below that horizon can
//! conflict with any future arrival.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use syncrep_types::{KeyAccess, KeyRecord, Seqno};

/// First write-set version honoring shared key access in conflict checks.
pub const MIN_SHARED_KEY_VERSION: i32 = 4;

/// Transactions over this count in the index trigger a size warning.
const TRX_MAP_WARN_SIZE: usize = 10_000;

/// Verdict of a certification test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    Ok,
    Failed,
}

/// What the certification engine needs from a transaction handle.
///
/// The engine holds `Arc`s of the implementing type in its ordered map, so
/// a transaction stays alive at least until the safe-to-discard horizon
/// passes its seqno.
pub trait Certifiable {
    fn global_seqno(&self) -> Seqno;
    fn last_seen_seqno(&self) -> Seqno;
    /// Total-order isolated actions depend on everything before them.
    fn is_toi(&self) -> bool;
    fn set_depends_seqno(&self, seqno: Seqno);
    /// Visit every key record in the write set.
    fn with_keys(&self, f: &mut dyn FnMut(&KeyRecord));
}

/// One indexed key reference.
#[derive(Debug, Clone)]
struct KeyEntry {
    /// Canonical key bytes, kept for exact comparison under hash collisions.
    canonical: Arc<[u8]>,
    /// Global seqno of the transaction that referenced the key.
    seqno: Seqno,
    shared: bool,
}

struct TrxRecord<T> {
    trx: Arc<T>,
    committed: bool,
}

struct Inner<T> {
    /// Key-hash buckets. A bucket holds the recent references to every key
    /// hashing there; exact bytes disambiguate collisions.
    index: HashMap<u64, SmallVec<[KeyEntry; 2]>>,
    /// All transactions currently retained, ordered by global seqno.
    trx_map: BTreeMap<i64, TrxRecord<T>>,
    /// Multiset of `last_seen_seqno` over uncommitted retained transactions.
    deps: BTreeMap<i64, usize>,
    /// Highest global seqno accepted into the index.
    position: Seqno,
    /// Last safe-to-discard value handed out; never decreases.
    safe_to_discard: Seqno,
    version: i32,
    size_warn_count: u64,
}

impl<T> Inner<T> {
    fn current_safe_to_discard(&self) -> Seqno {
        match self.deps.keys().next() {
            Some(&min_last_seen) => Seqno::new(min_last_seen),
            None => self.position,
        }
    }

    fn deps_remove(&mut self, last_seen: Seqno) {
        if let Some(count) = self.deps.get_mut(&last_seen.get()) {
            *count -= 1;
            if *count == 0 {
                self.deps.remove(&last_seen.get());
            }
        }
    }
}

/// The certification engine. All operations serialize on one internal mutex.
pub struct Certification<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Certifiable> Certification<T> {
    #[must_use]
    pub fn new(version: i32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                index: HashMap::new(),
                trx_map: BTreeMap::new(),
                deps: BTreeMap::new(),
                position: Seqno::UNDEFINED,
                safe_to_discard: Seqno::UNDEFINED,
                version,
                size_warn_count: 0,
            }),
        }
    }

    /// Certify `trx` and, on success, insert its keys into the index.
    ///
    /// Must be called in global-seqno order. On [`TestResult::Failed`] the
    /// index is left untouched except that `trx` is still retained in the
    /// ordered map (it occupies a seqno the purge horizon must account for).
    pub fn append_trx(&self, trx: &Arc<T>) -> TestResult {
        let seqno = trx.global_seqno();
        assert!(seqno.is_defined(), "append_trx without global seqno");
        let mut inner = self.inner.lock();
        assert!(
            seqno > inner.position,
            "append_trx out of order: {seqno} after position {}",
            inner.position
        );
        inner.position = seqno;

        let result = Self::do_test(&mut inner, trx, true);

        inner.trx_map.insert(
            seqno.get(),
            TrxRecord {
                trx: Arc::clone(trx),
                committed: false,
            },
        );
        let last_seen = trx.last_seen_seqno();
        *inner.deps.entry(last_seen.get()).or_insert(0) += 1;

        if inner.trx_map.len() > TRX_MAP_WARN_SIZE {
            inner.size_warn_count += 1;
            if inner.size_warn_count % 1000 == 1 {
                tracing::warn!(size = inner.trx_map.len(), "certification trx map size");
            }
        }
        result
    }

    /// Re-run the certification check without touching the index.
    ///
    /// Used to revalidate a brute-force-aborted transaction before replay:
    /// its keys are already indexed, so matches against its own seqno are
    /// ignored.
    pub fn test(&self, trx: &Arc<T>) -> TestResult {
        let mut inner = self.inner.lock();
        Self::do_test(&mut inner, trx, false)
    }

    fn do_test(inner: &mut Inner<T>, trx: &Arc<T>, store: bool) -> TestResult {
        let seqno = trx.global_seqno();
        let last_seen = trx.last_seen_seqno();
        let shared_keys_active = inner.version >= MIN_SHARED_KEY_VERSION;

        let mut depends = Seqno::UNDEFINED;
        let mut conflict = false;
        let mut staged: Vec<(u64, KeyEntry)> = Vec::new();

        trx.with_keys(&mut |record: &KeyRecord| {
            if conflict {
                return;
            }
            let hash = record.key.index_hash();
            let canonical = record.key.canonical();
            let shared = shared_keys_active && record.access == KeyAccess::Shared;

            if let Some(bucket) = inner.index.get(&hash) {
                for entry in bucket {
                    if entry.seqno == seqno || entry.canonical.as_ref() != canonical {
                        continue;
                    }
                    if entry.seqno > last_seen && !(shared && entry.shared) {
                        // First committer wins: a concurrent transaction
                        // already took this key exclusively (or we need it
                        // exclusively). Same verdict on every node.
                        conflict = true;
                        tracing::debug!(
                            %seqno,
                            conflicting = %entry.seqno,
                            %last_seen,
                            "certification conflict"
                        );
                        return;
                    }
                    depends = depends.max(entry.seqno);
                }
            }
            if store {
                staged.push((
                    hash,
                    KeyEntry {
                        canonical: Arc::from(canonical),
                        seqno,
                        shared,
                    },
                ));
            }
        });

        if conflict {
            return TestResult::Failed;
        }

        if trx.is_toi() {
            // Isolated actions serialize against everything before them.
            depends = seqno.prev();
        }
        trx.set_depends_seqno(depends);

        if store {
            for (hash, entry) in staged {
                inner.index.entry(hash).or_default().push(entry);
            }
        }
        TestResult::Ok
    }

    /// Record `trx` as committed. Returns the new safe-to-discard seqno when
    /// the horizon advanced, `None` otherwise.
    pub fn set_trx_committed(&self, trx: &T) -> Option<Seqno> {
        let seqno = trx.global_seqno();
        let mut inner = self.inner.lock();
        let Some(record) = inner.trx_map.get_mut(&seqno.get()) else {
            // Already purged (e.g. state-transfer preload); nothing to do.
            return None;
        };
        if record.committed {
            return None;
        }
        record.committed = true;
        inner.deps_remove(trx.last_seen_seqno());

        let fresh = inner.current_safe_to_discard();
        if fresh > inner.safe_to_discard {
            inner.safe_to_discard = fresh;
            Some(fresh)
        } else {
            None
        }
    }

    /// Remove transactions with `global_seqno <= seqno` from the index.
    ///
    /// Under `strict`, the purge refuses to pass the safe-to-discard
    /// horizon: entries a still-in-flight transaction may yet conflict with
    /// stay put.
    pub fn purge_trxs_upto(&self, seqno: Seqno, strict: bool) {
        let mut inner = self.inner.lock();
        let horizon = if strict {
            let safe = inner.safe_to_discard.max(inner.current_safe_to_discard());
            seqno.min(safe)
        } else {
            seqno
        };
        if !horizon.is_defined() {
            return;
        }

        let keep = inner.trx_map.split_off(&(horizon.get() + 1));
        let purged = std::mem::replace(&mut inner.trx_map, keep);
        if purged.is_empty() {
            return;
        }
        tracing::debug!(%horizon, count = purged.len(), "purging certified transactions");

        for (_, record) in purged {
            if !record.committed {
                // Non-strict purge may drop in-flight entries (initial
                // position reset); keep the deps multiset consistent.
                inner.deps_remove(record.trx.last_seen_seqno());
            }
            let trx_seqno = record.trx.global_seqno();
            record.trx.with_keys(&mut |key_record: &KeyRecord| {
                let hash = key_record.key.index_hash();
                if let Some(bucket) = inner.index.get_mut(&hash) {
                    bucket.retain(|entry| entry.seqno != trx_seqno);
                    if bucket.is_empty() {
                        inner.index.remove(&hash);
                    }
                }
            });
        }
    }

    /// Reset to a fresh position, e.g. after a state transfer. Drops every
    /// retained transaction and all index entries.
    pub fn assign_initial_position(&self, seqno: Seqno, version: i32) {
        let mut inner = self.inner.lock();
        let map_size = inner.trx_map.len();
        if map_size > 0 {
            tracing::info!(size = map_size, "dropping certification index for reposition");
        }
        inner.index.clear();
        inner.trx_map.clear();
        inner.deps.clear();
        inner.position = seqno;
        // The horizon is monotonic within one index lifetime but a reset
        // starts a new lifetime.
        inner.safe_to_discard = seqno;
        inner.version = version;
        tracing::debug!(%seqno, version, "certification position assigned");
    }

    /// Highest global seqno accepted into the index.
    #[must_use]
    pub fn position(&self) -> Seqno {
        self.inner.lock().position
    }

    /// Current safe-to-discard horizon.
    #[must_use]
    pub fn safe_to_discard(&self) -> Seqno {
        let inner = self.inner.lock();
        inner.safe_to_discard.max(inner.current_safe_to_discard())
    }

    /// Fetch a retained transaction by global seqno.
    #[must_use]
    pub fn get_trx(&self, seqno: Seqno) -> Option<Arc<T>> {
        self.inner
            .lock()
            .trx_map
            .get(&seqno.get())
            .map(|record| Arc::clone(&record.trx))
    }

    /// Number of transactions currently retained.
    #[must_use]
    pub fn index_size(&self) -> usize {
        self.inner.lock().trx_map.len()
    }
}
