//! Ordered-monitor: a totally-ordered admission gate.
//!
//! Every slot in the order is identified by a seqno. A thread calls
//! [`OrderedMonitor::enter`] with its slot and is suspended until the slot's
//! admission condition holds, does its work, then calls
//! [`OrderedMonitor::leave`]. The monitor maintains a `last_left` watermark
//! that advances strictly in seqno order over slots that have left or were
//! canceled, regardless of the wall-clock order in which workers finish.
//!
//! Slots that will never run are [`OrderedMonitor::self_cancel`]ed so the
//! watermark can pass them. A blocked waiter can be broken out of its wait
//! with [`OrderedMonitor::interrupt`]; the waiter observes
//! [`Enter::Interrupted`] and must either re-enter the slot or self-cancel
//! it. Until it does, the watermark (and any [`OrderedMonitor::drain`])
//! holds below that slot.
//!
//! Admission is pluggable through [`OrderKey`]: a serial gate admits a slot
//! only when the previous slot has left, while a dependency gate admits a
//! slot as soon as its declared dependency has left, allowing concurrent
//! occupancy with ordered entry and an ordered watermark.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use syncrep_types::Seqno;

/// A position in a monitor's total order.
pub trait OrderKey {
    /// The slot's seqno. Must be unique within a monitor's lifetime.
    fn seqno(&self) -> Seqno;

    /// Whether the slot may enter given the current watermark.
    ///
    /// The default is the serial gate: admit only the slot directly after
    /// the watermark.
    fn can_enter(&self, last_left: Seqno) -> bool {
        self.seqno().get() == last_left.get() + 1
    }
}

/// Outcome of an [`OrderedMonitor::enter`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enter {
    /// The slot was admitted; the caller now occupies it and must `leave`.
    Entered,
    /// The wait was broken by `interrupt`. The slot is still pending: the
    /// caller must re-enter or self-cancel it.
    Interrupted,
    /// The slot had already been self-canceled.
    Canceled,
}

/// Error from [`OrderedMonitor::wait`]: the deadline passed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeout {
    /// The seqno that had not left the monitor when the deadline expired.
    pub seqno: Seqno,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// A thread is blocked in `enter`; `interrupted` flags a pending break.
    Waiting { interrupted: bool },
    /// `interrupt` arrived before any waiter; the next `enter` consumes it.
    InterruptPending,
    Entered,
    Finished,
    Canceled,
}

#[derive(Debug)]
struct Inner {
    /// Lifecycle of every slot above `last_left` that has been touched.
    slots: HashMap<i64, SlotState>,
    /// Highest seqno such that every slot at or below it has left or been
    /// canceled. Advances strictly in order.
    last_left: i64,
    /// Highest seqno that has entered (monotonic; used for diagnostics).
    last_entered: i64,
}

impl Inner {
    /// Advance `last_left` over consecutively completed slots, dropping
    /// their bookkeeping.
    fn advance(&mut self) {
        loop {
            let next = self.last_left + 1;
            match self.slots.get(&next) {
                Some(SlotState::Finished | SlotState::Canceled) => {
                    self.slots.remove(&next);
                    self.last_left = next;
                }
                _ => return,
            }
        }
    }
}

/// A totally-ordered admission gate. See the module docs.
#[derive(Debug)]
pub struct OrderedMonitor {
    name: &'static str,
    inner: Mutex<Inner>,
    /// Woken on every state change; enter, drain and wait all re-check.
    cond: Condvar,
}

impl OrderedMonitor {
    /// Create a monitor positioned before slot `0` (i.e. `last_left = -1`).
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                last_left: -1,
                last_entered: -1,
            }),
            cond: Condvar::new(),
        }
    }

    /// Establish the watermark at `seqno`. Legal only while the monitor is
    /// idle (no slot in any lifecycle state).
    ///
    /// # Panics
    ///
    /// Panics if any slot is pending, waiting or entered.
    pub fn set_initial_position(&self, seqno: Seqno) {
        let mut inner = self.inner.lock();
        assert!(
            inner.slots.is_empty(),
            "{}: set_initial_position({seqno}) with slots outstanding",
            self.name
        );
        tracing::debug!(monitor = self.name, %seqno, "setting initial position");
        inner.last_left = seqno.get();
        inner.last_entered = seqno.get();
        drop(inner);
        self.cond.notify_all();
    }

    /// Suspend the caller until `key`'s slot is admitted.
    ///
    /// # Panics
    ///
    /// Panics if the slot is at or below the watermark, already occupied, or
    /// already left; all of these indicate a caller bug.
    pub fn enter<K: OrderKey>(&self, key: &K) -> Enter {
        let seqno = key.seqno().get();
        let mut inner = self.inner.lock();
        assert!(
            seqno > inner.last_left,
            "{}: enter({seqno}) at or below watermark {}",
            self.name,
            inner.last_left
        );
        match inner.slots.get(&seqno) {
            None => {
                inner
                    .slots
                    .insert(seqno, SlotState::Waiting { interrupted: false });
            }
            Some(SlotState::InterruptPending) => {
                inner.slots.remove(&seqno);
                return Enter::Interrupted;
            }
            Some(SlotState::Canceled) => return Enter::Canceled,
            Some(state) => {
                panic!("{}: enter({seqno}) on slot in state {state:?}", self.name)
            }
        }

        loop {
            if let Some(SlotState::Waiting { interrupted: true }) = inner.slots.get(&seqno) {
                // Consume the interrupt; the slot stays pending (absent from
                // the map) so the watermark holds until the caller resolves
                // it by re-entering or self-canceling.
                inner.slots.remove(&seqno);
                tracing::trace!(monitor = self.name, seqno, "enter interrupted");
                return Enter::Interrupted;
            }
            if key.can_enter(Seqno::new(inner.last_left)) {
                inner.slots.insert(seqno, SlotState::Entered);
                inner.last_entered = inner.last_entered.max(seqno);
                return Enter::Entered;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Release `key`'s slot. The watermark advances over it once every
    /// smaller slot has also left or been canceled.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not currently entered.
    pub fn leave<K: OrderKey>(&self, key: &K) {
        let seqno = key.seqno().get();
        let mut inner = self.inner.lock();
        let state = inner.slots.get(&seqno);
        assert_eq!(
            state,
            Some(&SlotState::Entered),
            "{}: leave({seqno}) on slot in state {state:?}",
            self.name
        );
        inner.slots.insert(seqno, SlotState::Finished);
        inner.advance();
        drop(inner);
        self.cond.notify_all();
    }

    /// Mark `key`'s slot as skipped without entering. Later slots proceed as
    /// if it had entered and left. A pending interrupt on the slot is
    /// discarded.
    ///
    /// # Panics
    ///
    /// Panics if a thread currently waits on or occupies the slot.
    pub fn self_cancel<K: OrderKey>(&self, key: &K) {
        let seqno = key.seqno().get();
        let mut inner = self.inner.lock();
        if seqno <= inner.last_left {
            // The watermark already passed: nothing to account for. Happens
            // when a canceled slot's bookkeeping raced with advancement.
            return;
        }
        match inner.slots.get(&seqno) {
            None | Some(SlotState::InterruptPending) => {
                inner.slots.insert(seqno, SlotState::Canceled);
                inner.advance();
            }
            Some(SlotState::Canceled) => {}
            Some(state) => {
                panic!(
                    "{}: self_cancel({seqno}) on slot in state {state:?}",
                    self.name
                )
            }
        }
        drop(inner);
        self.cond.notify_all();
    }

    /// Break a waiter out of `enter` on `key`'s slot.
    ///
    /// Idempotent: a slot that has already entered, left or been canceled is
    /// unaffected; repeated interrupts collapse into one. If no waiter has
    /// arrived yet the interrupt is held and consumed by the next `enter`.
    pub fn interrupt<K: OrderKey>(&self, key: &K) {
        let seqno = key.seqno().get();
        let mut inner = self.inner.lock();
        if seqno <= inner.last_left {
            return;
        }
        match inner.slots.get(&seqno) {
            None => {
                inner.slots.insert(seqno, SlotState::InterruptPending);
            }
            Some(SlotState::Waiting { interrupted: false }) => {
                tracing::trace!(monitor = self.name, seqno, "interrupting waiter");
                inner
                    .slots
                    .insert(seqno, SlotState::Waiting { interrupted: true });
                drop(inner);
                self.cond.notify_all();
                return;
            }
            _ => {}
        }
    }

    /// Block until every slot at or below `upto` has left or been canceled.
    pub fn drain(&self, upto: Seqno) {
        let mut inner = self.inner.lock();
        tracing::debug!(monitor = self.name, %upto, last_left = inner.last_left, "draining");
        while inner.last_left < upto.get() {
            self.cond.wait(&mut inner);
        }
    }

    /// Block until the watermark reaches `seqno` or `deadline` passes.
    pub fn wait(&self, seqno: Seqno, deadline: Instant) -> Result<(), WaitTimeout> {
        let mut inner = self.inner.lock();
        while inner.last_left < seqno.get() {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                if inner.last_left >= seqno.get() {
                    return Ok(());
                }
                return Err(WaitTimeout { seqno });
            }
        }
        Ok(())
    }

    /// The watermark: highest seqno with everything at or below it done.
    #[must_use]
    pub fn last_left(&self) -> Seqno {
        Seqno::new(self.inner.lock().last_left)
    }

    /// Highest seqno that has entered.
    #[must_use]
    pub fn last_entered(&self) -> Seqno {
        Seqno::new(self.inner.lock().last_entered)
    }
}

/// Serial order key: one slot inside at a time, in seqno order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialKey {
    seqno: Seqno,
}

impl SerialKey {
    #[must_use]
    pub const fn new(seqno: Seqno) -> Self {
        Self { seqno }
    }
}

impl OrderKey for SerialKey {
    fn seqno(&self) -> Seqno {
        self.seqno
    }
}

/// Dependency-gated order key: admitted as soon as `depends` has left.
///
/// Entry order still follows seqno order among slots whose dependencies are
/// met, and the watermark always advances serially; only occupancy overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependentKey {
    seqno: Seqno,
    depends: Seqno,
}

impl DependentKey {
    #[must_use]
    pub const fn new(seqno: Seqno, depends: Seqno) -> Self {
        Self { seqno, depends }
    }
}

impl OrderKey for DependentKey {
    fn seqno(&self) -> Seqno {
        self.seqno
    }

    fn can_enter(&self, last_left: Seqno) -> bool {
        self.depends.get() <= last_left.get()
    }
}
