// Copyright 2023-2025 Martin Pool

//! Expectation trees: what child-process output constitutes success.
//!
//! An expectation is either a leaf ([Expected]: one process, one pattern,
//! one optional deadline) or a combinator over child expectations. Feeding a
//! line into the tree shrinks the residual set of unsatisfied children; the
//! tree is satisfied when its residual is empty. Expectations are consumed
//! by evaluation and never shared between two live waits.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use itertools::Itertools;
use regex::Regex;
use tracing::{debug, info};

use crate::logging::Reporter;
use crate::timer::{TimerId, TimerService};
use crate::Result;

/// What one evaluation pass reported: the three signals are orthogonal.
///
/// Leaves currently report `started` and `completed` together; `Sequence`
/// surfaces `started` alone when its head matched but later elements remain.
/// The three-flag shape is kept so provisional-match leaves stay possible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: bool,
    pub started: bool,
    pub timed_out: bool,
}

/// What a leaf does when its deadline passes without a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// The pattern was required: report an error and collapse the wait.
    Fail,
    /// The pattern was required to *not* appear: the timeout is success.
    Pass,
    /// Log and keep going; the timeout resolves the leaf but is not fatal.
    Ignore,
}

impl fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutPolicy::Fail => "fail",
            TimeoutPolicy::Pass => "pass",
            TimeoutPolicy::Ignore => "ignore",
        })
    }
}

/// An optional acceptance gate on a leaf: a textual match only counts if the
/// gate agrees at the moment the line arrives.
type CompletionCheck = Box<dyn Fn() -> bool>;

/// Leaf expectation: a regex searched against one process's lines.
pub struct Expected {
    process: String,
    pattern: String,
    regex: Regex,
    /// Zero means no deadline.
    timeout_secs: f64,
    policy: TimeoutPolicy,
    critical: bool,
    check: Option<CompletionCheck>,
    timer: Option<TimerId>,
    timed_out: bool,
}

impl Expected {
    /// A line from `process` matching `pattern` (unanchored search) within
    /// `timeout_secs` seconds of the timer being armed. A zero timeout
    /// means the leaf waits forever.
    pub fn new(process: &str, pattern: &str, timeout_secs: f64) -> Result<Expected> {
        let regex = Regex::new(pattern)?;
        Ok(Expected {
            process: process.to_owned(),
            pattern: pattern.to_owned(),
            regex,
            timeout_secs,
            policy: TimeoutPolicy::Fail,
            critical: true,
            check: None,
            timer: None,
            timed_out: false,
        })
    }

    pub fn policy(mut self, policy: TimeoutPolicy) -> Expected {
        self.policy = policy;
        self
    }

    /// Whether a timeout failure stops the whole scheduler. Defaults to true.
    pub fn critical(mut self, critical: bool) -> Expected {
        self.critical = critical;
        self
    }

    /// Gate matches on a predicate evaluated when the line arrives.
    pub fn check(mut self, check: impl Fn() -> bool + 'static) -> Expected {
        self.check = Some(Box::new(check));
        self
    }

    fn completes(&mut self, process: &str, line: &str, timers: &mut TimerService) -> Progress {
        if self.timed_out {
            return Progress {
                timed_out: true,
                ..Progress::default()
            };
        }
        if process != self.process || !self.regex.is_match(line) {
            return Progress::default();
        }
        if let Some(check) = &self.check {
            if !check() {
                return Progress::default();
            }
        }
        self.cancel_timeouts(timers);
        info!("Success: seen match for {}: {}", self.process, self.pattern);
        Progress {
            completed: true,
            started: true,
            timed_out: false,
        }
    }

    fn register_timeouts(&mut self, timers: &mut TimerService) {
        if self.timeout_secs > 0.0 && self.timer.is_none() {
            debug!(
                "Register timeout {}: {} {:.1}",
                self.process, self.pattern, self.timeout_secs
            );
            self.timer = Some(timers.schedule(Duration::from_secs_f64(self.timeout_secs)));
        }
    }

    fn cancel_timeouts(&mut self, timers: &mut TimerService) {
        if let Some(id) = self.timer.take() {
            debug!("Cancel timeout {}: {}", self.process, self.pattern);
            timers.cancel(id);
        }
    }

    /// Run the timeout policy; the return value says whether the whole
    /// current wait should collapse.
    fn timer_fired(&mut self, id: TimerId, reporter: &mut Reporter) -> Option<bool> {
        if self.timer != Some(id) {
            return None;
        }
        self.timer = None;
        self.timed_out = true;
        let done = match self.policy {
            TimeoutPolicy::Fail => {
                reporter.error(
                    &format!(
                        "timeout after waiting {:.1} for {}: '{}'",
                        self.timeout_secs, self.process, self.pattern
                    ),
                    self.critical,
                );
                true
            }
            TimeoutPolicy::Pass => {
                info!(
                    "Success: {}: {} not seen in {:.1} seconds",
                    self.process, self.pattern, self.timeout_secs
                );
                false
            }
            TimeoutPolicy::Ignore => {
                info!(
                    "Ignoring: {}: {} not seen in {:.1} seconds",
                    self.process, self.pattern, self.timeout_secs
                );
                false
            }
        };
        Some(done)
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: '{}' {:.0}({}) {}",
            self.process, self.pattern, self.timeout_secs, self.timed_out, self.policy
        )
    }
}

/// A tree of combinators whose leaves are timed pattern matches.
pub enum Expectation {
    Expected(Expected),
    AllOf(AllOf),
    OneOf(OneOf),
    NoneOf(NoneOf),
    Sequence(Sequence),
}

/// All children must complete, in any order.
pub struct AllOf {
    children: Vec<Expectation>,
}

/// Exactly one child completes; the first to start claims the slot and the
/// alternatives are cancelled.
pub struct OneOf {
    children: Vec<Expectation>,
}

/// No child may match; every child timing out is the success case.
pub struct NoneOf {
    children: Vec<Expectation>,
    critical: bool,
}

/// Children must complete left to right; only the head is live.
pub struct Sequence {
    children: Vec<Expectation>,
    registered: bool,
}

impl AllOf {
    pub fn new(children: Vec<Expectation>) -> AllOf {
        AllOf { children }
    }

    fn completes(
        &mut self,
        process: &str,
        line: &str,
        timers: &mut TimerService,
        reporter: &mut Reporter,
    ) -> Progress {
        let mut started = false;
        let mut timed_out = false;
        let mut remove = None;
        for (idx, child) in self.children.iter_mut().enumerate() {
            let p = child.completes(process, line, timers, reporter);
            started |= p.started;
            timed_out |= p.timed_out;
            if p.completed || p.timed_out {
                remove = Some(idx);
            }
            // One line feeds at most one child per pass: N copies of the
            // same expected line require N distinct lines.
            if p.completed || p.started || p.timed_out {
                break;
            }
        }
        if let Some(idx) = remove {
            self.children.remove(idx);
        }
        Progress {
            completed: self.children.is_empty(),
            started,
            timed_out,
        }
    }
}

impl OneOf {
    pub fn new(children: Vec<Expectation>) -> OneOf {
        OneOf { children }
    }

    fn completes(
        &mut self,
        process: &str,
        line: &str,
        timers: &mut TimerService,
        reporter: &mut Reporter,
    ) -> Progress {
        enum Resolution {
            Clear,
            Commit(usize),
        }
        let mut started = false;
        let mut timed_out = false;
        let mut resolution = None;
        for (idx, child) in self.children.iter_mut().enumerate() {
            let p = child.completes(process, line, timers, reporter);
            started |= p.started;
            timed_out |= p.timed_out;
            if p.completed || p.timed_out {
                resolution = Some(Resolution::Clear);
                break;
            }
            if p.started {
                resolution = Some(Resolution::Commit(idx));
                break;
            }
        }
        match resolution {
            Some(Resolution::Clear) => {
                for mut child in self.children.drain(..) {
                    child.cancel_timeouts(timers);
                }
            }
            Some(Resolution::Commit(keep)) => {
                // The started child claims the slot; the alternatives are
                // removed and their timers cancelled.
                let children = std::mem::take(&mut self.children);
                for (idx, mut child) in children.into_iter().enumerate() {
                    if idx == keep {
                        self.children.push(child);
                    } else {
                        child.cancel_timeouts(timers);
                    }
                }
            }
            None => {}
        }
        Progress {
            completed: self.children.is_empty(),
            started,
            timed_out,
        }
    }
}

impl NoneOf {
    /// Children's timeout policies are rewritten so that timing out without
    /// a match is the desired outcome.
    pub fn new(mut children: Vec<Expectation>) -> NoneOf {
        for child in &mut children {
            child.set_timeout_policy(TimeoutPolicy::Pass);
        }
        NoneOf {
            children,
            critical: false,
        }
    }

    /// Whether a forbidden match stops the whole scheduler. Defaults to false.
    pub fn critical(mut self, critical: bool) -> NoneOf {
        self.critical = critical;
        self
    }

    fn completes(
        &mut self,
        process: &str,
        line: &str,
        timers: &mut TimerService,
        reporter: &mut Reporter,
    ) -> Progress {
        let mut timed_out_children = Vec::new();
        let mut seen = None;
        for (idx, child) in self.children.iter_mut().enumerate() {
            let p = child.completes(process, line, timers, reporter);
            if p.completed || p.started {
                seen = Some(match child {
                    Expectation::Expected(e) => (e.process.clone(), e.pattern.clone()),
                    other => (other.to_string(), String::new()),
                });
                break;
            }
            if p.timed_out {
                timed_out_children.push(idx);
            }
        }
        if let Some((seen_process, seen_pattern)) = seen {
            reporter.error(
                &format!(
                    "Seen NoneOf event {}:\n   Pattern: {}\n   Actual: {}",
                    seen_process, seen_pattern, line
                ),
                self.critical,
            );
            self.cancel_timeouts(timers);
            self.children.clear();
        } else {
            for idx in timed_out_children.into_iter().rev() {
                let mut child = self.children.remove(idx);
                child.cancel_timeouts(timers);
            }
        }
        let completed = self.children.is_empty();
        Progress {
            completed,
            started: completed,
            timed_out: false,
        }
    }

    fn cancel_timeouts(&mut self, timers: &mut TimerService) {
        for child in &mut self.children {
            child.cancel_timeouts(timers);
        }
    }
}

impl Sequence {
    pub fn new(children: Vec<Expectation>) -> Sequence {
        Sequence {
            children,
            registered: false,
        }
    }

    fn completes(
        &mut self,
        process: &str,
        line: &str,
        timers: &mut TimerService,
        reporter: &mut Reporter,
    ) -> Progress {
        let Some(head) = self.children.first_mut() else {
            return Progress {
                completed: true,
                ..Progress::default()
            };
        };
        let p = head.completes(process, line, timers, reporter);
        if p.completed {
            head.cancel_timeouts(timers);
        }
        if p.completed || p.timed_out {
            self.children.remove(0);
            if self.registered {
                if let Some(next) = self.children.first_mut() {
                    next.register_timeouts(timers);
                }
            }
        }
        let completed = self.children.is_empty();
        Progress {
            completed,
            started: p.started,
            // The sequence only timed out if a timeout emptied it.
            timed_out: if completed { p.timed_out } else { false },
        }
    }
}

impl Expectation {
    /// An already-satisfied expectation, used by the master to keep the
    /// indices of other outstanding expectations stable.
    pub(crate) fn empty() -> Expectation {
        Expectation::AllOf(AllOf::new(Vec::new()))
    }

    /// Union of process names referenced by leaves beneath this node.
    /// Processes may or may not exist yet; leaves hold names only.
    pub fn get_processes(&self) -> BTreeSet<String> {
        match self {
            Expectation::Expected(e) => [e.process.clone()].into(),
            Expectation::AllOf(AllOf { children })
            | Expectation::OneOf(OneOf { children })
            | Expectation::NoneOf(NoneOf { children, .. })
            | Expectation::Sequence(Sequence { children, .. }) => children
                .iter()
                .flat_map(|child| child.get_processes())
                .collect(),
        }
    }

    /// Arm the timers this node owns. A sequence arms only its head.
    pub fn register_timeouts(&mut self, timers: &mut TimerService) {
        match self {
            Expectation::Expected(e) => e.register_timeouts(timers),
            Expectation::AllOf(AllOf { children })
            | Expectation::OneOf(OneOf { children })
            | Expectation::NoneOf(NoneOf { children, .. }) => {
                for child in children {
                    child.register_timeouts(timers);
                }
            }
            Expectation::Sequence(seq) => {
                seq.registered = true;
                if let Some(head) = seq.children.first_mut() {
                    head.register_timeouts(timers);
                }
            }
        }
    }

    /// Idempotently disarm timers owned by this node's residual.
    pub fn cancel_timeouts(&mut self, timers: &mut TimerService) {
        match self {
            Expectation::Expected(e) => e.cancel_timeouts(timers),
            Expectation::AllOf(AllOf { children })
            | Expectation::OneOf(OneOf { children })
            | Expectation::NoneOf(NoneOf { children, .. }) => {
                for child in children {
                    child.cancel_timeouts(timers);
                }
            }
            Expectation::Sequence(seq) => {
                if let Some(head) = seq.children.first_mut() {
                    head.cancel_timeouts(timers);
                }
            }
        }
    }

    /// Evaluate one line against this node, shrinking its residual.
    pub fn completes(
        &mut self,
        process: &str,
        line: &str,
        timers: &mut TimerService,
        reporter: &mut Reporter,
    ) -> Progress {
        match self {
            Expectation::Expected(e) => e.completes(process, line, timers),
            Expectation::AllOf(n) => n.completes(process, line, timers, reporter),
            Expectation::OneOf(n) => n.completes(process, line, timers, reporter),
            Expectation::NoneOf(n) => n.completes(process, line, timers, reporter),
            Expectation::Sequence(n) => n.completes(process, line, timers, reporter),
        }
    }

    /// Route a fired timer to the leaf that owns it. Returns the policy's
    /// verdict on whether the whole wait should collapse, or None when no
    /// leaf beneath this node owns the timer.
    pub fn timer_fired(&mut self, id: TimerId, reporter: &mut Reporter) -> Option<bool> {
        match self {
            Expectation::Expected(e) => e.timer_fired(id, reporter),
            Expectation::AllOf(AllOf { children })
            | Expectation::OneOf(OneOf { children })
            | Expectation::NoneOf(NoneOf { children, .. })
            | Expectation::Sequence(Sequence { children, .. }) => children
                .iter_mut()
                .find_map(|child| child.timer_fired(id, reporter)),
        }
    }

    fn set_timeout_policy(&mut self, policy: TimeoutPolicy) {
        match self {
            Expectation::Expected(e) => e.policy = policy,
            Expectation::AllOf(AllOf { children })
            | Expectation::OneOf(OneOf { children })
            | Expectation::NoneOf(NoneOf { children, .. })
            | Expectation::Sequence(Sequence { children, .. }) => {
                for child in children {
                    child.set_timeout_policy(policy);
                }
            }
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Expected(e) => e.fmt(f),
            Expectation::AllOf(AllOf { children }) => {
                write!(f, "AllOf({})", children.iter().join(", "))
            }
            Expectation::OneOf(OneOf { children }) => {
                write!(f, "OneOf({})", children.iter().join(", "))
            }
            Expectation::NoneOf(NoneOf { children, .. }) => {
                write!(f, "NoneOf({})", children.iter().join(", "))
            }
            Expectation::Sequence(Sequence { children, .. }) => {
                write!(f, "Sequence({})", children.iter().join(" -> "))
            }
        }
    }
}

impl From<Expected> for Expectation {
    fn from(e: Expected) -> Expectation {
        Expectation::Expected(e)
    }
}

impl From<AllOf> for Expectation {
    fn from(n: AllOf) -> Expectation {
        Expectation::AllOf(n)
    }
}

impl From<OneOf> for Expectation {
    fn from(n: OneOf) -> Expectation {
        Expectation::OneOf(n)
    }
}

impl From<NoneOf> for Expectation {
    fn from(n: NoneOf) -> Expectation {
        Expectation::NoneOf(n)
    }
}

impl From<Sequence> for Expectation {
    fn from(n: Sequence) -> Expectation {
        Expectation::Sequence(n)
    }
}

/// Shorthand for a leaf with the default (fail, critical) timeout policy.
pub fn expected(process: &str, pattern: &str, timeout_secs: f64) -> Result<Expectation> {
    Ok(Expected::new(process, pattern, timeout_secs)?.into())
}

pub fn all_of(children: Vec<Expectation>) -> Expectation {
    AllOf::new(children).into()
}

pub fn one_of(children: Vec<Expectation>) -> Expectation {
    OneOf::new(children).into()
}

pub fn none_of(children: Vec<Expectation>) -> Expectation {
    NoneOf::new(children).into()
}

pub fn sequence(children: Vec<Expectation>) -> Expectation {
    Sequence::new(children).into()
}

#[cfg(test)]
mod test {
    use super::*;

    fn env() -> (TimerService, Reporter) {
        (TimerService::new(), Reporter::new(true))
    }

    fn feed(
        e: &mut Expectation,
        process: &str,
        line: &str,
        timers: &mut TimerService,
        reporter: &mut Reporter,
    ) -> Progress {
        e.completes(process, line, timers, reporter)
    }

    #[test]
    fn leaf_matches_only_its_process() {
        let (mut timers, mut reporter) = env();
        let mut e = expected("ep0", "Started", 0.0).unwrap();
        let p = feed(&mut e, "ep1", "Started\n", &mut timers, &mut reporter);
        assert_eq!(p, Progress::default());
        let p = feed(&mut e, "ep0", "Started\n", &mut timers, &mut reporter);
        assert!(p.completed && p.started && !p.timed_out);
    }

    #[test]
    fn leaf_pattern_is_searched_not_anchored() {
        let (mut timers, mut reporter) = env();
        let mut e = expected("ep0", "Count[01]", 0.0).unwrap();
        let p = feed(&mut e, "ep0", "saw Count1 today\n", &mut timers, &mut reporter);
        assert!(p.completed);
    }

    #[test]
    fn bad_regex_is_rejected_at_construction() {
        assert!(expected("ep0", "(unclosed", 1.0).is_err());
    }

    #[test]
    fn completion_check_gates_the_match() {
        let (mut timers, mut reporter) = env();
        let mut e: Expectation = Expected::new("ep0", "Started", 0.0)
            .unwrap()
            .check(|| false)
            .into();
        let p = feed(&mut e, "ep0", "Started\n", &mut timers, &mut reporter);
        assert_eq!(p, Progress::default());
    }

    #[test]
    fn all_of_consumes_one_child_per_line() {
        let (mut timers, mut reporter) = env();
        let mut e = all_of(vec![
            expected("ep0", "Tick", 0.0).unwrap(),
            expected("ep0", "Tick", 0.0).unwrap(),
            expected("ep0", "Tick", 0.0).unwrap(),
        ]);
        // Three identical children need three distinct lines.
        assert!(!feed(&mut e, "ep0", "Tick\n", &mut timers, &mut reporter).completed);
        assert!(!feed(&mut e, "ep0", "Tick\n", &mut timers, &mut reporter).completed);
        assert!(feed(&mut e, "ep0", "Tick\n", &mut timers, &mut reporter).completed);
    }

    #[test]
    fn all_of_completes_in_any_order() {
        let (mut timers, mut reporter) = env();
        let mut e = all_of(vec![
            expected("ep0", "A", 0.0).unwrap(),
            expected("ep1", "B", 0.0).unwrap(),
        ]);
        assert!(!feed(&mut e, "ep1", "B\n", &mut timers, &mut reporter).completed);
        assert!(feed(&mut e, "ep0", "A\n", &mut timers, &mut reporter).completed);
    }

    #[test]
    fn one_of_first_completion_cancels_alternatives() {
        let (mut timers, mut reporter) = env();
        let mut e = one_of(vec![
            expected("ep0", "win", 5.0).unwrap(),
            expected("ep1", "win", 5.0).unwrap(),
        ]);
        e.register_timeouts(&mut timers);
        assert_eq!(timers.armed_count(), 2);
        let p = feed(&mut e, "ep1", "win\n", &mut timers, &mut reporter);
        assert!(p.completed);
        assert_eq!(timers.armed_count(), 0, "losing alternative is disarmed");
    }

    #[test]
    fn one_of_commits_to_the_started_alternative() {
        let (mut timers, mut reporter) = env();
        let mut e = one_of(vec![
            sequence(vec![
                expected("ep0", "Role: Slave", 5.0).unwrap(),
                expected("ep0", "sync locked", 1.0).unwrap(),
            ]),
            sequence(vec![
                expected("ep1", "Role: Slave", 5.0).unwrap(),
                expected("ep1", "sync locked", 1.0).unwrap(),
            ]),
        ]);
        e.register_timeouts(&mut timers);
        let p = feed(&mut e, "ep0", "Role: Slave\n", &mut timers, &mut reporter);
        assert!(p.started && !p.completed);
        // ep1's alternative is gone along with its timer; only ep0's
        // follow-up is still owed.
        let p = feed(&mut e, "ep1", "sync locked\n", &mut timers, &mut reporter);
        assert!(!p.completed);
        let p = feed(&mut e, "ep0", "sync locked\n", &mut timers, &mut reporter);
        assert!(p.completed);
    }

    #[test]
    fn none_of_match_is_an_error() {
        let (mut timers, mut reporter) = env();
        let mut e = none_of(vec![expected("ep0", "lost lock", 5.0).unwrap()]);
        e.register_timeouts(&mut timers);
        let p = feed(&mut e, "ep0", "lost lock detected\n", &mut timers, &mut reporter);
        assert!(p.completed);
        assert_eq!(reporter.counts(), (1, 0));
        assert!(!reporter.stop_requested(), "NoneOf defaults to non-critical");
        assert_eq!(timers.armed_count(), 0);
    }

    #[test]
    fn none_of_timeout_is_success() {
        let (mut timers, mut reporter) = env();
        let mut e = none_of(vec![expected("ep0", "lost lock", 5.0).unwrap()]);
        e.register_timeouts(&mut timers);
        let due = timers.take_due(tokio::time::Instant::now() + Duration::from_secs(6));
        assert_eq!(due.len(), 1);
        let done = e.timer_fired(due[0], &mut reporter);
        assert_eq!(done, Some(false), "rewritten policy is not fatal");
        // The timed-out child is cleaned out on the next evaluation pass.
        let p = feed(&mut e, "<invalid>", "<invalid>", &mut timers, &mut reporter);
        assert!(p.completed);
        assert_eq!(reporter.counts(), (0, 0));
    }

    #[test]
    fn sequence_requires_left_to_right_order() {
        let (mut timers, mut reporter) = env();
        let mut e = sequence(vec![
            expected("ep0", "Count0", 0.0).unwrap(),
            expected("ep0", "Count1", 0.0).unwrap(),
        ]);
        // The tail pattern is ignored while the head is unsatisfied.
        assert_eq!(
            feed(&mut e, "ep0", "Count1\n", &mut timers, &mut reporter),
            Progress::default()
        );
        let p = feed(&mut e, "ep0", "Count0\n", &mut timers, &mut reporter);
        assert!(p.started && !p.completed);
        assert!(feed(&mut e, "ep0", "Count1\n", &mut timers, &mut reporter).completed);
    }

    #[test]
    fn sequence_arms_only_the_head_timer() {
        let (mut timers, mut reporter) = env();
        let mut e = sequence(vec![
            expected("ep0", "first", 5.0).unwrap(),
            expected("ep0", "second", 5.0).unwrap(),
        ]);
        e.register_timeouts(&mut timers);
        assert_eq!(timers.armed_count(), 1);
        feed(&mut e, "ep0", "first\n", &mut timers, &mut reporter);
        assert_eq!(timers.armed_count(), 1, "head completion arms the next");
        feed(&mut e, "ep0", "second\n", &mut timers, &mut reporter);
        assert_eq!(timers.armed_count(), 0);
    }

    #[test]
    fn fatal_timeout_reports_and_collapses() {
        let (mut timers, mut reporter) = env();
        let mut e = expected("ep0", "Started", 10.0).unwrap();
        e.register_timeouts(&mut timers);
        let due = timers.take_due(tokio::time::Instant::now() + Duration::from_secs(11));
        let done = e.timer_fired(due[0], &mut reporter);
        assert_eq!(done, Some(true));
        assert_eq!(reporter.counts(), (1, 0));
        assert!(reporter.stop_requested());
        // Once timed out the leaf only ever reports that.
        let p = feed(&mut e, "ep0", "Started\n", &mut timers, &mut reporter);
        assert_eq!(
            p,
            Progress {
                timed_out: true,
                ..Progress::default()
            }
        );
    }

    #[test]
    fn ignore_policy_timeout_is_not_fatal() {
        let (mut timers, mut reporter) = env();
        let mut e: Expectation = Expected::new("ep0", "Started", 1.0)
            .unwrap()
            .policy(TimeoutPolicy::Ignore)
            .into();
        e.register_timeouts(&mut timers);
        let due = timers.take_due(tokio::time::Instant::now() + Duration::from_secs(2));
        assert_eq!(e.timer_fired(due[0], &mut reporter), Some(false));
        assert_eq!(reporter.counts(), (0, 0));
    }

    #[test]
    fn noncritical_timeout_counts_but_does_not_stop() {
        let (mut timers, mut reporter) = env();
        let mut e: Expectation = Expected::new("ep0", "Started", 1.0)
            .unwrap()
            .critical(false)
            .into();
        e.register_timeouts(&mut timers);
        let due = timers.take_due(tokio::time::Instant::now() + Duration::from_secs(2));
        assert_eq!(e.timer_fired(due[0], &mut reporter), Some(true));
        assert_eq!(reporter.counts(), (1, 0));
        assert!(!reporter.stop_requested());
    }

    #[test]
    fn get_processes_unions_leaves() {
        let e = all_of(vec![
            sequence(vec![
                expected("ep0", "a", 0.0).unwrap(),
                expected("ep1", "b", 0.0).unwrap(),
            ]),
            expected("ep0", "c", 0.0).unwrap(),
        ]);
        let procs: Vec<String> = e.get_processes().into_iter().collect();
        assert_eq!(procs, ["ep0", "ep1"]);
    }

    #[test]
    fn display_mirrors_structure() {
        let e = sequence(vec![
            expected("ep0", "a", 10.0).unwrap(),
            expected("ep0", "b", 0.0).unwrap(),
        ]);
        assert_eq!(
            e.to_string(),
            "Sequence(ep0: 'a' 10(false) fail -> ep0: 'b' 0(false) fail)"
        );
    }
}
