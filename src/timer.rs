// Copyright 2023-2025 Martin Pool

//! One-shot timers for expectation deadlines.
//!
//! A min-heap keyed by deadline, drained by the scheduler between I/O
//! events. Timers are cancellable up to the moment they fire; cancelling a
//! timer that already fired (or was already cancelled) is a no-op, so leaves
//! never need to track whether their timer was consumed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

/// Identity of one scheduled timer, unique for the life of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Schedules one-shot deadlines and reports which have come due.
///
/// The service never invokes callbacks itself: the scheduler asks for the
/// next deadline, sleeps until it, and routes the due [TimerId]s back into
/// the expectation tree.
#[derive(Debug, Default)]
pub struct TimerService {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    /// Ids that are scheduled and neither cancelled nor fired.
    live: HashSet<u64>,
    next_id: u64,
}

impl TimerService {
    pub fn new() -> TimerService {
        TimerService::default()
    }

    /// Arm a timer that comes due `delay` from now.
    pub fn schedule(&mut self, delay: Duration) -> TimerId {
        self.schedule_at(Instant::now() + delay)
    }

    pub fn schedule_at(&mut self, deadline: Instant) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.live.insert(id);
        TimerId(id)
    }

    /// Disarm a timer. Idempotent; a fired timer is already disarmed.
    pub fn cancel(&mut self, id: TimerId) {
        self.live.remove(&id.0);
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.live.contains(&id.0)
    }

    pub fn armed_count(&self) -> usize {
        self.live.len()
    }

    /// The earliest deadline still armed, if any.
    ///
    /// Cancelled entries left in the heap are discarded here so the
    /// scheduler never sleeps towards a deadline that can't fire.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.live.contains(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every timer due at `now`, in deadline order.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if self.live.remove(&id) {
                due.push(TimerId(id));
            }
        }
        due
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerService::new();
        let base = Instant::now();
        let late = timers.schedule_at(base + Duration::from_secs(5));
        let early = timers.schedule_at(base + Duration::from_secs(1));
        assert_eq!(timers.next_deadline(), Some(base + Duration::from_secs(1)));
        assert_eq!(
            timers.take_due(base + Duration::from_secs(10)),
            vec![early, late]
        );
    }

    #[test]
    fn due_timer_fires_once() {
        let mut timers = TimerService::new();
        let base = Instant::now();
        let id = timers.schedule_at(base + Duration::from_secs(1));
        assert!(timers.is_armed(id));
        assert_eq!(timers.take_due(base + Duration::from_secs(2)), vec![id]);
        assert!(!timers.is_armed(id));
        assert_eq!(timers.take_due(base + Duration::from_secs(3)), vec![]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut timers = TimerService::new();
        let base = Instant::now();
        let id = timers.schedule_at(base + Duration::from_secs(1));
        timers.cancel(id);
        assert_eq!(timers.next_deadline(), None);
        assert_eq!(timers.take_due(base + Duration::from_secs(2)), vec![]);
    }

    #[test]
    fn cancel_after_fire_is_a_noop() {
        let mut timers = TimerService::new();
        let base = Instant::now();
        let id = timers.schedule_at(base + Duration::from_secs(1));
        let other = timers.schedule_at(base + Duration::from_secs(3));
        assert_eq!(timers.take_due(base + Duration::from_secs(2)), vec![id]);
        timers.cancel(id);
        timers.cancel(id);
        assert!(timers.is_armed(other));
        assert_eq!(timers.armed_count(), 1);
    }

    #[test]
    fn not_due_until_deadline() {
        let mut timers = TimerService::new();
        let base = Instant::now();
        timers.schedule_at(base + Duration::from_secs(2));
        assert_eq!(timers.take_due(base + Duration::from_secs(1)), vec![]);
        assert_eq!(timers.armed_count(), 1);
    }
}
