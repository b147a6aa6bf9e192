//! Per-key fixed-window state

use super::AdmissionLimits;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A queued caller waiting for a slot
#[derive(Debug)]
struct Waiter {
    id: u64,
    grant: oneshot::Sender<u64>,
}

/// Outcome of a single arrival
#[derive(Debug)]
pub(crate) enum Arrival {
    /// Slot taken in the current window
    Admitted,
    /// Enqueued; the receiver yields the window generation of the grant
    Queued {
        id: u64,
        grant: oneshot::Receiver<u64>,
    },
    /// Window saturated and queue full
    Rejected { retry_after: Duration },
}

/// Point-in-time view of one key's window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    /// Slots used in the current window
    pub count: u32,
    /// Callers currently queued
    pub queued: usize,
}

/// Fixed-window counter plus FIFO wait queue for one key
#[derive(Debug, Default)]
pub(crate) struct WindowState {
    window_start: Option<Instant>,
    generation: u64,
    count: u32,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

impl WindowState {
    /// Reset the window if it has elapsed, then hand freed slots to waiters
    pub(crate) fn roll(&mut self, now: Instant, limits: &AdmissionLimits) {
        let Some(start) = self.window_start else {
            return;
        };
        if now.saturating_duration_since(start) < limits.window {
            return;
        }

        self.window_start = Some(now);
        self.generation += 1;
        self.count = 0;
        self.drain(limits);
    }

    /// Grant queued waiters, oldest first, while slots remain
    fn drain(&mut self, limits: &AdmissionLimits) {
        while self.count < limits.permit_limit {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.grant.send(self.generation).is_ok() {
                self.count += 1;
            } else {
                tracing::debug!(waiter = waiter.id, "Skipping abandoned waiter");
            }
        }
    }

    /// Register a new arrival
    pub(crate) fn arrive(&mut self, now: Instant, limits: &AdmissionLimits) -> Arrival {
        self.roll(now, limits);
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }

        if self.waiters.is_empty() && self.count < limits.permit_limit {
            self.count += 1;
            return Arrival::Admitted;
        }

        if self.waiters.len() < limits.queue_limit {
            let (tx, rx) = oneshot::channel();
            let id = self.next_id;
            self.next_id += 1;
            self.waiters.push_back(Waiter { id, grant: tx });
            return Arrival::Queued { id, grant: rx };
        }

        Arrival::Rejected {
            retry_after: self.window_end(now, limits).saturating_duration_since(now),
        }
    }

    /// Remove a waiter that has not been granted yet
    ///
    /// Returns false when the waiter is no longer queued.
    pub(crate) fn cancel(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Return a slot granted in `generation` that its waiter never used
    pub(crate) fn refund(&mut self, generation: u64, limits: &AdmissionLimits) {
        if generation != self.generation {
            return;
        }
        self.count = self.count.saturating_sub(1);
        self.drain(limits);
    }

    /// Instant at which the current window resets
    pub(crate) fn window_end(&self, now: Instant, limits: &AdmissionLimits) -> Instant {
        match self.window_start {
            Some(start) => start + limits.window,
            None => now,
        }
    }

    /// True when the window has elapsed and nobody is waiting
    pub(crate) fn is_idle(&self, now: Instant, limits: &AdmissionLimits) -> bool {
        self.waiters.is_empty()
            && self
                .window_start
                .map_or(true, |start| now.saturating_duration_since(start) >= limits.window)
    }

    pub(crate) fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            count: self.count,
            queued: self.waiters.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::QueueOrder;

    fn limits(permit_limit: u32, queue_limit: usize) -> AdmissionLimits {
        AdmissionLimits {
            permit_limit,
            window: Duration::from_secs(15),
            queue_limit,
            queue_order: QueueOrder::OldestFirst,
        }
    }

    fn queued_id(arrival: Arrival) -> (u64, oneshot::Receiver<u64>) {
        match arrival {
            Arrival::Queued { id, grant } => (id, grant),
            other => panic!("expected Queued, got {:?}", other),
        }
    }

    #[test]
    fn test_saturation_sequence() {
        let limits = limits(5, 2);
        let t0 = Instant::now();
        let mut state = WindowState::default();

        for _ in 0..5 {
            assert!(matches!(state.arrive(t0, &limits), Arrival::Admitted));
        }
        let (_, mut sixth) = queued_id(state.arrive(t0, &limits));
        let (_, mut seventh) = queued_id(state.arrive(t0, &limits));

        match state.arrive(t0 + Duration::from_secs(5), &limits) {
            Arrival::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(10)),
            other => panic!("expected Rejected, got {:?}", other),
        }
        assert_eq!(state.snapshot(), WindowSnapshot { count: 5, queued: 2 });

        state.roll(t0 + Duration::from_secs(15), &limits);
        assert_eq!(sixth.try_recv(), Ok(1));
        assert_eq!(seventh.try_recv(), Ok(1));
        assert_eq!(state.snapshot(), WindowSnapshot { count: 2, queued: 0 });
    }

    #[test]
    fn test_waiters_granted_before_new_arrivals() {
        let limits = limits(1, 2);
        let t0 = Instant::now();
        let mut state = WindowState::default();

        assert!(matches!(state.arrive(t0, &limits), Arrival::Admitted));
        let (_, mut first) = queued_id(state.arrive(t0, &limits));
        let (_, mut second) = queued_id(state.arrive(t0, &limits));

        // The arrival that triggers the reset finds the slot taken and queues
        let late = state.arrive(t0 + Duration::from_secs(15), &limits);
        assert_eq!(first.try_recv(), Ok(1));
        assert!(second.try_recv().is_err());
        let (_, _late) = queued_id(late);
        assert_eq!(state.snapshot(), WindowSnapshot { count: 1, queued: 2 });
    }

    #[test]
    fn test_cancel_keeps_order() {
        let limits = limits(1, 3);
        let t0 = Instant::now();
        let mut state = WindowState::default();

        assert!(matches!(state.arrive(t0, &limits), Arrival::Admitted));
        let (_, mut a) = queued_id(state.arrive(t0, &limits));
        let (b_id, _b) = queued_id(state.arrive(t0, &limits));
        let (_, mut c) = queued_id(state.arrive(t0, &limits));

        assert!(state.cancel(b_id));
        assert!(!state.cancel(b_id));

        state.roll(t0 + Duration::from_secs(15), &limits);
        assert_eq!(a.try_recv(), Ok(1));
        assert!(c.try_recv().is_err());

        state.roll(t0 + Duration::from_secs(30), &limits);
        assert_eq!(c.try_recv(), Ok(2));
    }

    #[test]
    fn test_refund_passes_slot_on() {
        let limits = limits(1, 2);
        let t0 = Instant::now();
        let mut state = WindowState::default();

        assert!(matches!(state.arrive(t0, &limits), Arrival::Admitted));
        let (a_id, a) = queued_id(state.arrive(t0, &limits));
        let (_, mut b) = queued_id(state.arrive(t0, &limits));

        state.roll(t0 + Duration::from_secs(15), &limits);
        assert!(!state.cancel(a_id));
        drop(a);

        state.refund(1, &limits);
        assert_eq!(b.try_recv(), Ok(1));
        assert_eq!(state.snapshot(), WindowSnapshot { count: 1, queued: 0 });
    }

    #[test]
    fn test_stale_refund_ignored() {
        let limits = limits(2, 0);
        let t0 = Instant::now();
        let mut state = WindowState::default();

        assert!(matches!(state.arrive(t0, &limits), Arrival::Admitted));
        state.roll(t0 + Duration::from_secs(15), &limits);
        assert!(matches!(
            state.arrive(t0 + Duration::from_secs(15), &limits),
            Arrival::Admitted
        ));

        state.refund(0, &limits);
        assert_eq!(state.snapshot().count, 1);
    }

    #[test]
    fn test_abandoned_waiter_skipped() {
        let limits = limits(1, 2);
        let t0 = Instant::now();
        let mut state = WindowState::default();

        assert!(matches!(state.arrive(t0, &limits), Arrival::Admitted));
        let (_, gone) = queued_id(state.arrive(t0, &limits));
        let (_, mut next) = queued_id(state.arrive(t0, &limits));
        drop(gone);

        state.roll(t0 + Duration::from_secs(15), &limits);
        assert_eq!(next.try_recv(), Ok(1));
        assert_eq!(state.snapshot().count, 1);
    }

    #[test]
    fn test_idle() {
        let limits = limits(1, 1);
        let t0 = Instant::now();
        let mut state = WindowState::default();
        assert!(state.is_idle(t0, &limits));

        state.arrive(t0, &limits);
        assert!(!state.is_idle(t0 + Duration::from_secs(14), &limits));
        assert!(state.is_idle(t0 + Duration::from_secs(15), &limits));

        let _queued = state.arrive(t0, &limits);
        assert!(!state.is_idle(t0 + Duration::from_secs(20), &limits));
    }
}
