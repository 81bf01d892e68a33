// Copyright 2023-2025 Martin Pool

//! The master controller: outstanding expectations and their resolution.
//!
//! The master holds the current list of expectation roots, replays each
//! process's history through them when a wait begins, routes every freshly
//! received line through them, and resumes the suspended test exactly once
//! when the whole list is satisfied or a fatal timeout collapses it.

use tokio::sync::oneshot;
use tracing::debug;

use crate::expect::{Expectation, Progress};
use crate::logging::Reporter;
use crate::process::ProcessRegistry;
use crate::timer::{TimerId, TimerService};

/// Process/line token fed through the trees after a non-fatal timeout so
/// nodes recompute their residuals. No real process can have this name.
const INVALID: &str = "<invalid>";

/// How an `expect` call proceeds: already satisfied from history, or
/// suspended until the master resumes it.
pub(crate) enum ExpectStatus {
    Done(Vec<Expectation>),
    Wait(oneshot::Receiver<Vec<Expectation>>),
}

#[derive(Default)]
pub(crate) struct Master {
    /// Outstanding expectation roots. Typically one, but several
    /// independent roots may be staged and advanced concurrently.
    expected: Vec<Expectation>,
    /// Roots staged by `add_expected` for the next wait.
    next_expected: Vec<Expectation>,
    /// Resume handle for the suspended test.
    deferred: Option<oneshot::Sender<Vec<Expectation>>>,
}

impl Master {
    pub fn new() -> Master {
        Master::default()
    }

    fn log_state(&self, registry: &ProcessRegistry, message: &str) {
        debug!("{message}");
        for (i, e) in self.expected.iter().enumerate() {
            let indexes = e
                .get_processes()
                .iter()
                .map(|p| {
                    let cursor = registry.get(p).map(|proc| proc.cursor(i)).unwrap_or(0);
                    format!("{p}:{cursor}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            debug!("{i}: Indexes {indexes}");
            debug!("{e}");
        }
    }

    /// Feed one line to every outstanding root, advancing cursors for the
    /// roots that made progress and replacing completed roots with empty
    /// placeholders so the indices of the others stay stable.
    pub fn check_received(
        &mut self,
        registry: &mut ProcessRegistry,
        timers: &mut TimerService,
        reporter: &mut Reporter,
        process: &str,
        line: &str,
    ) -> Progress {
        if self.expected.is_empty() {
            return Progress::default();
        }
        let mut started = false;
        let mut timed_out = false;
        let mut completed = true;
        let expected = std::mem::take(&mut self.expected);
        let mut next = Vec::with_capacity(expected.len());
        for (i, mut e) in expected.into_iter().enumerate() {
            let p = e.completes(process, line, timers, reporter);
            started |= p.started;
            timed_out |= p.timed_out;
            if p.completed || p.started {
                registry.move_cursor(process, i, line);
            }
            if p.completed {
                next.push(Expectation::empty());
            } else {
                completed = false;
                next.push(e);
            }
        }
        if !completed {
            self.expected = next;
        }
        if completed || started {
            self.log_state(registry, "Events remaining:");
        }
        Progress {
            completed,
            started,
            timed_out,
        }
    }

    /// Replay histories through the outstanding roots until a pass makes no
    /// further progress. The fixpoint matters for sequences: one line can
    /// satisfy a head and unblock the next element against lines already in
    /// history.
    pub fn check_against_history(
        &mut self,
        registry: &mut ProcessRegistry,
        timers: &mut TimerService,
        reporter: &mut Reporter,
    ) {
        let mut changed = true;
        while changed {
            changed = false;
            let mut i = 0;
            while i < self.expected.len() {
                for process in self.expected[i].get_processes() {
                    let lines = match registry.get(&process) {
                        Some(record) => record.history_from_cursor(i),
                        None => continue,
                    };
                    for line in lines {
                        debug!("checkAgainstHistory: {}: {}", process, line.trim_end());
                        let p = self.check_received(registry, timers, reporter, &process, &line);
                        changed |= p.started && !p.completed;
                        if self.expected.is_empty() {
                            return;
                        }
                    }
                }
                i += 1;
            }
        }
    }

    /// Stage a root to be waited on by the next `start_next` + `expect`.
    pub fn add_expected(&mut self, expected: Expectation) {
        self.next_expected.push(expected);
    }

    /// Promote the staged roots to the outstanding list.
    pub fn start_next(&mut self) {
        self.expected = std::mem::take(&mut self.next_expected);
    }

    /// Begin a wait. Returns `Done` when history already satisfies
    /// everything (no suspension), otherwise arms timers and hands back the
    /// receiver the test suspends on.
    pub fn expect(
        &mut self,
        expected: Option<Expectation>,
        registry: &mut ProcessRegistry,
        timers: &mut TimerService,
        reporter: &mut Reporter,
    ) -> ExpectStatus {
        if let Some(expected) = expected {
            self.expected = vec![expected];
        }
        if self.expected.is_empty() {
            return ExpectStatus::Done(Vec::new());
        }
        self.log_state(registry, "Master expect:");
        self.check_against_history(registry, timers, reporter);
        if self.expected.is_empty() {
            return ExpectStatus::Done(Vec::new());
        }
        for e in &mut self.expected {
            e.register_timeouts(timers);
        }
        let (tx, rx) = oneshot::channel();
        self.deferred = Some(tx);
        ExpectStatus::Wait(rx)
    }

    /// A freshly demultiplexed line. A start without a completion re-runs
    /// the history replay to pick up newly unblocked leaves.
    pub fn receive(
        &mut self,
        registry: &mut ProcessRegistry,
        timers: &mut TimerService,
        reporter: &mut Reporter,
        process: &str,
        line: &str,
    ) {
        if !self.expected.is_empty() {
            let p = self.check_received(registry, timers, reporter, process, line);
            if p.started && !p.completed {
                self.check_against_history(registry, timers, reporter);
            }
        }
        if self.expected.is_empty() {
            self.call_deferred();
        }
    }

    /// A timer fired: find the leaf that owns it and act on its policy.
    pub fn on_timer(
        &mut self,
        id: TimerId,
        registry: &mut ProcessRegistry,
        timers: &mut TimerService,
        reporter: &mut Reporter,
    ) {
        let mut verdict = None;
        for e in &mut self.expected {
            if let Some(done) = e.timer_fired(id, reporter) {
                verdict = Some(done);
                break;
            }
        }
        if let Some(done) = verdict {
            self.timed_out(done, registry, timers, reporter);
        }
    }

    /// One timeout has been seen. A fatal one cancels every other pending
    /// timer and resumes the test; a benign one lets nodes recompute their
    /// residuals, which may have just emptied.
    pub fn timed_out(
        &mut self,
        done: bool,
        registry: &mut ProcessRegistry,
        timers: &mut TimerService,
        reporter: &mut Reporter,
    ) {
        if self.expected.is_empty() {
            return;
        }
        if done {
            for e in &mut self.expected {
                e.cancel_timeouts(timers);
            }
            self.call_deferred();
        } else {
            self.check_received(registry, timers, reporter, INVALID, INVALID);
            if self.expected.is_empty() {
                self.call_deferred();
            }
        }
    }

    /// Resume the suspended test with whatever is left outstanding (empty
    /// on success). At most once per wait.
    fn call_deferred(&mut self) {
        let remaining = std::mem::take(&mut self.expected);
        if let Some(deferred) = self.deferred.take() {
            let _ = deferred.send(remaining);
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::expect::{all_of, expected, none_of, sequence};
    use crate::process::Process;

    struct Bed {
        master: Master,
        registry: ProcessRegistry,
        timers: TimerService,
        reporter: Reporter,
    }

    impl Bed {
        fn new(names: &[&str]) -> Bed {
            let mut registry = ProcessRegistry::new();
            for name in names {
                registry.insert(Process::new(name)).unwrap();
            }
            Bed {
                master: Master::new(),
                registry,
                timers: TimerService::new(),
                reporter: Reporter::new(true),
            }
        }

        fn feed(&mut self, process: &str, data: &[u8]) {
            let lines = self
                .registry
                .get_mut(process)
                .expect("process exists")
                .push_bytes(data);
            for line in lines {
                self.master.receive(
                    &mut self.registry,
                    &mut self.timers,
                    &mut self.reporter,
                    process,
                    &line,
                );
            }
        }

        fn expect(&mut self, e: Expectation) -> ExpectStatus {
            self.master.expect(
                Some(e),
                &mut self.registry,
                &mut self.timers,
                &mut self.reporter,
            )
        }

        fn fire_due(&mut self, at: Instant) {
            for id in self.timers.take_due(at) {
                self.master.on_timer(
                    id,
                    &mut self.registry,
                    &mut self.timers,
                    &mut self.reporter,
                );
            }
        }
    }

    fn resolved(status: &mut ExpectStatus) -> Option<Vec<Expectation>> {
        match status {
            ExpectStatus::Done(remaining) => Some(std::mem::take(remaining)),
            ExpectStatus::Wait(rx) => rx.try_recv().ok(),
        }
    }

    #[test]
    fn history_satisfies_expect_without_suspension() {
        let mut bed = Bed::new(&["ep0"]);
        bed.feed("ep0", b"Started\n");
        let mut status = bed.expect(expected("ep0", "Started", 10.0).unwrap());
        assert!(matches!(status, ExpectStatus::Done(_)));
        assert!(resolved(&mut status).unwrap().is_empty());
        assert_eq!(bed.timers.armed_count(), 0, "nothing was ever armed");
    }

    #[test]
    fn live_line_resumes_a_waiting_expect() {
        let mut bed = Bed::new(&["ep0"]);
        let mut status = bed.expect(expected("ep0", "Started", 10.0).unwrap());
        assert!(matches!(status, ExpectStatus::Wait(_)));
        assert!(resolved(&mut status).is_none());
        bed.feed("ep0", b"Started\n");
        let remaining = resolved(&mut status).expect("resumed");
        assert!(remaining.is_empty());
        assert_eq!(bed.timers.armed_count(), 0);
    }

    #[test]
    fn consumed_lines_are_not_rematched_by_a_later_expect() {
        let mut bed = Bed::new(&["ep0"]);
        bed.feed("ep0", b"Tick\n");
        let mut first = bed.expect(expected("ep0", "Tick", 10.0).unwrap());
        assert!(resolved(&mut first).unwrap().is_empty());
        // The cursor sits past the consumed line, so the same expectation
        // index must wait for a fresh one.
        let mut second = bed.expect(expected("ep0", "Tick", 10.0).unwrap());
        assert!(matches!(second, ExpectStatus::Wait(_)));
        bed.feed("ep0", b"Tick\n");
        assert!(resolved(&mut second).unwrap().is_empty());
    }

    #[test]
    fn replay_fixpoint_walks_a_sequence_through_history() {
        let mut bed = Bed::new(&["ep0"]);
        bed.feed("ep0", b"Count0\nCount1\n");
        let mut status = bed.expect(sequence(vec![
            expected("ep0", "Count0", 10.0).unwrap(),
            expected("ep0", "Count1", 10.0).unwrap(),
        ]));
        assert!(resolved(&mut status).unwrap().is_empty());
    }

    #[test]
    fn out_of_order_history_cannot_satisfy_a_sequence() {
        let mut bed = Bed::new(&["ep0"]);
        bed.feed("ep0", b"Count1\nCount0\n");
        let status = bed.expect(sequence(vec![
            expected("ep0", "Count0", 10.0).unwrap(),
            expected("ep0", "Count1", 10.0).unwrap(),
        ]));
        // Count0 matches from history but the cursor is then past the
        // earlier Count1, which stays unconsumable.
        assert!(matches!(status, ExpectStatus::Wait(_)));
    }

    #[test]
    fn staged_roots_advance_concurrently_with_stable_indices() {
        let mut bed = Bed::new(&["ep0", "ep1"]);
        bed.master.add_expected(expected("ep0", "A", 10.0).unwrap());
        bed.master.add_expected(expected("ep1", "B", 10.0).unwrap());
        bed.master.start_next();
        let mut status = bed.master.expect(
            None,
            &mut bed.registry,
            &mut bed.timers,
            &mut bed.reporter,
        );
        assert!(matches!(status, ExpectStatus::Wait(_)));
        // Completing the first root must not disturb the second root's
        // cursor index.
        bed.feed("ep0", b"A\n");
        assert!(resolved(&mut status).is_none());
        bed.feed("ep1", b"B\n");
        assert!(resolved(&mut status).unwrap().is_empty());
    }

    #[test]
    fn fatal_timeout_cancels_everything_and_resumes_with_remainder() {
        let mut bed = Bed::new(&["ep0", "ep1"]);
        let mut status = bed.expect(all_of(vec![
            expected("ep0", "Next", 1.0).unwrap(),
            expected("ep1", "Next", 30.0).unwrap(),
        ]));
        assert_eq!(bed.timers.armed_count(), 2);
        bed.fire_due(Instant::now() + Duration::from_secs(2));
        let remaining = resolved(&mut status).expect("resumed by timeout");
        assert_eq!(remaining.len(), 1, "the unsatisfied root comes back");
        assert_eq!(bed.reporter.counts(), (1, 0));
        assert!(bed.reporter.stop_requested());
        assert_eq!(bed.timers.armed_count(), 0, "ep1's timer was cancelled");
    }

    #[test]
    fn none_of_timeout_resolves_the_wait_without_error() {
        let mut bed = Bed::new(&["ep0"]);
        let mut status = bed.expect(none_of(vec![
            expected("ep0", "lost lock", 1.0).unwrap(),
        ]));
        assert!(matches!(status, ExpectStatus::Wait(_)));
        bed.fire_due(Instant::now() + Duration::from_secs(2));
        let remaining = resolved(&mut status).expect("resumed");
        assert!(remaining.is_empty());
        assert_eq!(bed.reporter.counts(), (0, 0));
    }

    #[test]
    fn no_timer_outlives_a_resumed_wait() {
        let mut bed = Bed::new(&["ep0"]);
        let mut status = bed.expect(all_of(vec![
            expected("ep0", "Started", 10.0).unwrap(),
            expected("ep0", "Next", 10.0).unwrap(),
        ]));
        bed.feed("ep0", b"Started\nNext\n");
        assert!(resolved(&mut status).unwrap().is_empty());
        assert_eq!(bed.timers.armed_count(), 0);
        // Firing long past the old deadlines reaches no leaf.
        bed.fire_due(Instant::now() + Duration::from_secs(60));
        assert_eq!(bed.reporter.counts(), (0, 0));
    }

    #[test]
    fn lines_for_unknown_processes_are_ignored() {
        let mut bed = Bed::new(&["ep0"]);
        let mut status = bed.expect(expected("ep0", "Started", 10.0).unwrap());
        // A leaf may name a process that never launched; lines from other
        // processes simply don't match it.
        bed.master.receive(
            &mut bed.registry,
            &mut bed.timers,
            &mut bed.reporter,
            "ghost",
            "Started\n",
        );
        assert!(resolved(&mut status).is_none());
    }
}
