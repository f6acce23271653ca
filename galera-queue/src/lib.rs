//! Ordered delivery queues (§4.4): `to_queue`/`commit_queue` are both
//! instances of [`OrderedQueue`], a ring of slots keyed by `seqno mod
//! capacity` that enforces a strict total order of entry into a critical
//! section while letting cancelled or interrupted seqnos be skipped rather
//! than block everyone behind them.

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use galera_base::{err_kind, ErrorKind, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    Idle,
    Waiting,
    Held,
    Cancelled,
    Interrupted,
}

/// What [`OrderedQueue::grab`] found once it was this seqno's turn (or would
/// have been, had the slot not been cancelled or interrupted first).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GrabOutcome {
    /// The caller now holds the critical section for this seqno and must
    /// eventually call [`OrderedQueue::release`].
    Held,
    /// The slot was cancelled before this seqno's turn arrived. No release
    /// is needed or permitted.
    Cancelled,
    /// The slot was interrupted before this seqno's turn arrived. A later
    /// `grab` for the same seqno is allowed and will proceed fresh.
    Interrupted,
}

/// What [`OrderedQueue::cancel`] did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelOutcome {
    /// The slot was marked cancelled (or, if it was exactly at `head` and
    /// unclaimed, head was advanced past it).
    Cancelled,
    /// The slot is exactly `head` and currently held; the holder must finish
    /// and call `release` itself.
    HeldAtHead,
    /// `seqno` is already behind `head`; nothing to do.
    AlreadyPast,
}

struct Inner {
    head: i64,
    slots: Vec<SlotState>,
}

impl Inner {
    fn slot_index(&self, seqno: i64) -> usize {
        (seqno as u64 & (self.slots.len() as u64 - 1)) as usize
    }

    /// Advances `head` by one past the slot that was just vacated, then
    /// keeps advancing through any run of cancelled slots, clearing each to
    /// `Idle` for reuse.
    fn advance_past_cancelled(&mut self) {
        self.head += 1;
        loop {
            let idx = self.slot_index(self.head);
            if self.slots[idx] == SlotState::Cancelled {
                self.slots[idx] = SlotState::Idle;
                self.head += 1;
            } else {
                break;
            }
        }
    }
}

/// A single total-order queue parameterised by an initial seqno and a
/// capacity rounded up to a power of two.
pub struct OrderedQueue {
    capacity: i64,
    state: Mutex<Inner>,
    cv: Condvar,
}

impl OrderedQueue {
    pub fn new(initial_seqno: i64, capacity_hint: usize) -> Self {
        let capacity = capacity_hint.max(1).next_power_of_two();
        OrderedQueue {
            capacity: capacity as i64,
            state: Mutex::new(Inner { head: initial_seqno, slots: vec![SlotState::Idle; capacity] }),
            cv: Condvar::new(),
        }
    }

    pub fn head(&self) -> i64 {
        self.state.lock().head
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Blocks until `seqno` is at the head of the queue, or until it is
    /// cancelled or interrupted first.
    pub fn grab(&self, seqno: i64) -> Result<GrabOutcome> {
        let mut g = self.state.lock();
        if seqno < g.head {
            return Err(err_kind(
                ErrorKind::Fatal,
                format!("grab({seqno}) called for a seqno already behind head {}", g.head),
            ));
        }
        if seqno - g.head >= self.capacity {
            return Err(err_kind(
                ErrorKind::Capacity,
                format!("grab({seqno}) would overflow queue of capacity {} at head {}", self.capacity, g.head),
            ));
        }
        let idx = g.slot_index(seqno);
        loop {
            match g.slots[idx] {
                SlotState::Cancelled => {
                    trace!(seqno, "grab observed cancelled slot");
                    return Ok(GrabOutcome::Cancelled);
                }
                SlotState::Interrupted => {
                    g.slots[idx] = SlotState::Idle;
                    trace!(seqno, "grab observed interrupted slot, resetting for retry");
                    return Ok(GrabOutcome::Interrupted);
                }
                _ => {}
            }
            if g.head == seqno {
                g.slots[idx] = SlotState::Held;
                return Ok(GrabOutcome::Held);
            }
            g.slots[idx] = SlotState::Waiting;
            self.cv.wait(&mut g);
        }
    }

    /// Releases a held slot, advances `head`, and wakes the next waiter.
    pub fn release(&self, seqno: i64) -> Result<()> {
        let mut g = self.state.lock();
        if g.head != seqno {
            return Err(err_kind(
                ErrorKind::Fatal,
                format!("release({seqno}) called but head is {}", g.head),
            ));
        }
        let idx = g.slot_index(seqno);
        if g.slots[idx] != SlotState::Held {
            return Err(err_kind(ErrorKind::Fatal, format!("release({seqno}) called on a slot that is not held")));
        }
        g.slots[idx] = SlotState::Idle;
        g.advance_past_cancelled();
        self.cv.notify_all();
        Ok(())
    }

    /// Cancels a seqno from outside its owning thread. If the seqno is
    /// exactly `head` and unclaimed, this performs an implicit release so
    /// `head` keeps advancing; if it is exactly `head` and held, the caller
    /// must wait for the holder to release.
    pub fn cancel(&self, seqno: i64) -> CancelOutcome {
        let mut g = self.state.lock();
        if seqno < g.head {
            return CancelOutcome::AlreadyPast;
        }
        let idx = g.slot_index(seqno);
        if seqno == g.head {
            if g.slots[idx] == SlotState::Held {
                return CancelOutcome::HeldAtHead;
            }
            g.slots[idx] = SlotState::Idle;
            g.advance_past_cancelled();
            self.cv.notify_all();
            return CancelOutcome::Cancelled;
        }
        g.slots[idx] = SlotState::Cancelled;
        self.cv.notify_all();
        CancelOutcome::Cancelled
    }

    /// Cancels a seqno on behalf of its own owner, who has decided not to
    /// enter the critical section at all. A no-op if `seqno` is already
    /// behind `head`.
    pub fn self_cancel(&self, seqno: i64) {
        let mut g = self.state.lock();
        if seqno < g.head {
            return;
        }
        let idx = g.slot_index(seqno);
        if seqno == g.head {
            g.slots[idx] = SlotState::Idle;
            g.advance_past_cancelled();
        } else {
            g.slots[idx] = SlotState::Cancelled;
        }
        self.cv.notify_all();
    }

    /// Interrupts a seqno that has not yet been held: supports BF-abort
    /// before total order is known. Unlike [`cancel`](Self::cancel), the
    /// slot stays "alive" — a later `grab` for the same seqno is allowed and
    /// proceeds as if nothing had happened.
    pub fn interrupt(&self, seqno: i64) {
        let mut g = self.state.lock();
        if seqno < g.head {
            return;
        }
        let idx = g.slot_index(seqno);
        if g.slots[idx] == SlotState::Held {
            warn!(seqno, "interrupt() called on a currently-held slot, ignoring");
            return;
        }
        g.slots[idx] = SlotState::Interrupted;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use test_log::test;

    #[test]
    fn grab_release_advances_head_in_order_p1() {
        let q = OrderedQueue::new(0, 4);
        assert_eq!(q.grab(0).unwrap(), GrabOutcome::Held);
        q.release(0).unwrap();
        assert_eq!(q.head(), 1);
        assert_eq!(q.grab(1).unwrap(), GrabOutcome::Held);
        q.release(1).unwrap();
        assert_eq!(q.head(), 2);
    }

    #[test]
    fn grab_rejects_overflow() {
        let q = OrderedQueue::new(0, 4);
        assert!(q.grab(4).is_err());
        assert!(q.grab(0).is_ok());
    }

    #[test]
    fn out_of_order_grab_blocks_until_predecessor_releases() {
        let q = Arc::new(OrderedQueue::new(0, 8));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.grab(1).unwrap());

        // Give the other thread a chance to start waiting; it cannot
        // observe Held until seqno 0 is released.
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(q.head(), 0);

        assert_eq!(q.grab(0).unwrap(), GrabOutcome::Held);
        q.release(0).unwrap();

        assert_eq!(handle.join().unwrap(), GrabOutcome::Held);
        q.release(1).unwrap();
        assert_eq!(q.head(), 2);
    }

    #[test]
    fn cancel_ahead_of_head_is_skipped_by_release() {
        let q = OrderedQueue::new(0, 8);
        assert_eq!(q.cancel(1), CancelOutcome::Cancelled);
        assert_eq!(q.grab(0).unwrap(), GrabOutcome::Held);
        q.release(0).unwrap();
        // head skips the cancelled seqno 1 straight to 2.
        assert_eq!(q.head(), 2);
        assert_eq!(q.grab(1).unwrap(), GrabOutcome::Cancelled);
    }

    #[test]
    fn cancel_at_head_unclaimed_advances_head() {
        let q = OrderedQueue::new(0, 8);
        assert_eq!(q.cancel(0), CancelOutcome::Cancelled);
        assert_eq!(q.head(), 1);
    }

    #[test]
    fn cancel_at_head_held_returns_held_at_head() {
        let q = OrderedQueue::new(0, 8);
        assert_eq!(q.grab(0).unwrap(), GrabOutcome::Held);
        assert_eq!(q.cancel(0), CancelOutcome::HeldAtHead);
        q.release(0).unwrap();
        assert_eq!(q.head(), 1);
    }

    #[test]
    fn self_cancel_at_head_is_implicit_release() {
        let q = OrderedQueue::new(0, 8);
        q.self_cancel(0);
        assert_eq!(q.head(), 1);
        assert_eq!(q.grab(1).unwrap(), GrabOutcome::Held);
    }

    #[test]
    fn self_cancel_before_head_is_noop() {
        let q = OrderedQueue::new(0, 8);
        q.grab(0).unwrap();
        q.release(0).unwrap();
        q.self_cancel(0);
        assert_eq!(q.head(), 1);
    }

    #[test]
    fn interrupt_then_retry_grab_succeeds() {
        let q = OrderedQueue::new(0, 8);
        q.interrupt(0);
        assert_eq!(q.grab(0).unwrap(), GrabOutcome::Interrupted);
        // A second grab for the same seqno proceeds fresh.
        assert_eq!(q.grab(0).unwrap(), GrabOutcome::Held);
        q.release(0).unwrap();
        assert_eq!(q.head(), 1);
    }

    #[test]
    fn interrupt_wakes_a_blocked_grabber() {
        let q = Arc::new(OrderedQueue::new(0, 8));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.grab(1).unwrap());
        thread::sleep(std::time::Duration::from_millis(20));
        q.interrupt(1);
        assert_eq!(handle.join().unwrap(), GrabOutcome::Interrupted);
    }

    #[test]
    fn release_rejects_wrong_seqno() {
        let q = OrderedQueue::new(0, 4);
        q.grab(0).unwrap();
        assert!(q.release(1).is_err());
    }

    #[test]
    fn release_rejects_unheld_slot() {
        let q = OrderedQueue::new(0, 4);
        assert!(q.release(0).is_err());
    }

    #[test]
    fn releases_happen_in_seqno_order_under_contention_p5() {
        let q = Arc::new(OrderedQueue::new(0, 64));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        // Spawn grabbers for seqnos 9..0 in reverse order; they must still
        // be served 0..9 because grab blocks until head reaches them.
        for seqno in (0..10).rev() {
            let q = Arc::clone(&q);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                q.grab(seqno).unwrap();
                order.lock().push(seqno);
                q.release(seqno).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let observed = order.lock().clone();
        assert_eq!(observed, (0..10).collect::<Vec<_>>());
    }
}
