// Copyright 2023-2025 Martin Pool

//! The cooperative scheduler that drives one test run.
//!
//! Everything happens on a single-threaded runtime: per-child pump tasks
//! forward raw output bytes into one event channel, the event loop
//! demultiplexes them into lines and routes each through the master, and
//! the user's test routine runs as a task that suspends on `expect`. No two
//! evaluation passes ever overlap, so no state here is locked.
//!
//! Child processes are spawned into their own process groups and interrupted
//! (then killed) when the run ends; their exit codes are logged but never
//! asserted.

use std::cell::RefCell;
use std::future::Future;
use std::process::Stdio;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::LocalSet;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::exit_code;
use crate::expect::Expectation;
use crate::logging::{self, summary_line, Reporter};
use crate::master::{ExpectStatus, Master};
use crate::options::Options;
use crate::process::{Process, ProcessRegistry, ProcessSpec};
use crate::timer::TimerService;
use crate::Result;

/// Sleep horizon when no timer is armed; the loop just re-checks.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Grace period between interrupting a child and killing it outright.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

enum Event {
    /// A chunk of stdout or stderr bytes from one child.
    Output { process: String, chunk: Vec<u8> },
    /// Timers or the stop flag changed outside the event loop; re-evaluate
    /// the sleep deadline.
    Wake,
    /// The user's test routine returned.
    TestFinished,
}

/// All mutable state of one run, owned by the scheduler thread.
struct World {
    registry: ProcessRegistry,
    master: Master,
    timers: TimerService,
    reporter: Reporter,
    children: Vec<(String, Child)>,
}

impl World {
    fn new(options: &Options) -> World {
        World {
            registry: ProcessRegistry::new(),
            master: Master::new(),
            timers: TimerService::new(),
            reporter: Reporter::new(options.default_critical),
            children: Vec::new(),
        }
    }

    /// Demultiplex a chunk into lines; error patterns run on each line
    /// before the master sees it, since the master may change the active
    /// patterns when it resumes the test.
    fn receive_chunk(&mut self, process: &str, chunk: &[u8]) {
        let Some(record) = self.registry.get_mut(process) else {
            return;
        };
        for line in record.push_bytes(chunk) {
            if let Some(record) = self.registry.get(process) {
                record.check_error_patterns(&line, &mut self.reporter);
            }
            self.master.receive(
                &mut self.registry,
                &mut self.timers,
                &mut self.reporter,
                process,
                &line,
            );
        }
    }

    fn fire_due_timers(&mut self) {
        for id in self.timers.take_due(Instant::now()) {
            self.master.on_timer(
                id,
                &mut self.registry,
                &mut self.timers,
                &mut self.reporter,
            );
        }
    }
}

/// The handle a test routine drives the run through.
///
/// Cloneable; all clones share the one run.
#[derive(Clone)]
pub struct Tester {
    world: Rc<RefCell<World>>,
    events: UnboundedSender<Event>,
}

impl Tester {
    /// Wait until `expectation` is satisfied by process output, or a fatal
    /// timeout collapses it. Returns whatever was left outstanding (empty
    /// on success). Output already in history counts; if it already
    /// satisfies the expectation this returns without suspending.
    pub async fn expect(&self, expectation: Expectation) -> Vec<Expectation> {
        let status = {
            let mut world = self.world.borrow_mut();
            let World {
                registry,
                master,
                timers,
                reporter,
                ..
            } = &mut *world;
            master.expect(Some(expectation), registry, timers, reporter)
        };
        match status {
            ExpectStatus::Done(remaining) => remaining,
            ExpectStatus::Wait(rx) => {
                // The loop may be sleeping towards a stale deadline; the
                // timers just armed have to be picked up.
                let _ = self.events.send(Event::Wake);
                rx.await.unwrap_or_default()
            }
        }
    }

    /// Stage an expectation for the next [Tester::expect_staged] wait.
    pub fn add_expected(&self, expectation: Expectation) {
        self.world.borrow_mut().master.add_expected(expectation);
    }

    /// Wait on every staged expectation at once; they advance independently
    /// over the same histories.
    pub async fn expect_staged(&self) -> Vec<Expectation> {
        let status = {
            let mut world = self.world.borrow_mut();
            let World {
                registry,
                master,
                timers,
                reporter,
                ..
            } = &mut *world;
            master.start_next();
            master.expect(None, registry, timers, reporter)
        };
        match status {
            ExpectStatus::Done(remaining) => remaining,
            ExpectStatus::Wait(rx) => {
                let _ = self.events.send(Event::Wake);
                rx.await.unwrap_or_default()
            }
        }
    }

    /// Suspend the test routine for a wall-clock interval.
    pub async fn sleep(&self, seconds: f64) {
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }

    /// Write `command` plus CRLF to the child's stdin. Fire-and-forget with
    /// respect to matching.
    pub fn send_line(&self, process: &str, command: &str) -> Result<()> {
        let world = self.world.borrow();
        let record = world
            .registry
            .get(process)
            .with_context(|| format!("unknown process {process:?}"))?;
        record.send_line(command)
    }

    /// Launch another child mid-test.
    pub fn spawn(&self, spec: ProcessSpec) -> Result<()> {
        spawn_process(&self.world, &self.events, &spec)
    }

    pub fn register_error_pattern(
        &self,
        process: &str,
        pattern: &str,
        critical: bool,
    ) -> Result<()> {
        let mut world = self.world.borrow_mut();
        world
            .registry
            .get_mut(process)
            .with_context(|| format!("unknown process {process:?}"))?
            .register_error_pattern(pattern, critical)
    }

    pub fn unregister_error_pattern(&self, process: &str, pattern: &str) {
        if let Some(record) = self.world.borrow_mut().registry.get_mut(process) {
            record.unregister_error_pattern(pattern);
        }
    }

    /// Forget everything a process has printed so far.
    pub fn clear_expect_history(&self, process: &str) {
        if let Some(record) = self.world.borrow_mut().registry.get_mut(process) {
            record.clear_expect_history();
        }
    }

    /// Names of every process launched so far.
    pub fn processes(&self) -> Vec<String> {
        self.world.borrow().registry.names()
    }

    /// Record a test-authored failure with the run's default criticality.
    pub fn error(&self, reason: &str) {
        {
            let mut world = self.world.borrow_mut();
            let critical = world.reporter.default_critical;
            world.reporter.error(reason, critical);
        }
        let _ = self.events.send(Event::Wake);
    }

    pub fn warning(&self, reason: &str) {
        self.world.borrow_mut().reporter.warning(reason);
    }
}

/// Final accounting for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestSummary {
    pub errors: u32,
    pub warnings: u32,
}

impl TestSummary {
    pub fn passed(&self) -> bool {
        self.errors == 0
    }

    /// Non-zero exactly when errors were detected.
    pub fn exit_code(&self) -> i32 {
        if self.errors > 0 {
            exit_code::FAILED
        } else {
            exit_code::SUCCESS
        }
    }
}

/// Configures and runs one test: child processes plus a test routine.
pub struct Harness {
    options: Options,
    specs: Vec<ProcessSpec>,
}

impl Harness {
    pub fn new(options: Options) -> Result<Harness> {
        logging::configure(&options)?;
        Ok(Harness {
            options,
            specs: Vec::new(),
        })
    }

    /// Add a child process to launch at the start of the run.
    pub fn process(mut self, spec: ProcessSpec) -> Harness {
        self.specs.push(spec);
        self
    }

    /// Launch the children, run `test` to completion (or to a critical
    /// failure), shut everything down, and print the summary line.
    pub fn run<F, Fut>(self, test: F) -> Result<TestSummary>
    where
        F: FnOnce(Tester) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build runtime")?;
        let local = LocalSet::new();
        local.block_on(&runtime, async move {
            let (events_tx, mut events_rx) = mpsc::unbounded_channel();
            let world = Rc::new(RefCell::new(World::new(&self.options)));
            for spec in &self.specs {
                spawn_process(&world, &events_tx, spec)?;
            }
            let tester = Tester {
                world: Rc::clone(&world),
                events: events_tx.clone(),
            };
            let on_failure = tester.clone();
            let finished_tx = events_tx.clone();
            tokio::task::spawn_local(async move {
                if let Err(err) = test(tester).await {
                    // An uncaught failure in the test routine is critical.
                    let mut world = on_failure.world.borrow_mut();
                    world.reporter.error(&format!("test routine failed: {err:#}"), true);
                }
                let _ = finished_tx.send(Event::TestFinished);
            });
            event_loop(&world, &mut events_rx).await;
            shutdown(&world).await;
            let (errors, warnings) = world.borrow().reporter.counts();
            println!("{}", summary_line(errors, warnings));
            Ok(TestSummary { errors, warnings })
        })
    }
}

/// Line deliveries already queued are handled before a timer with an
/// earlier deadline fires; `biased` keeps that ordering deterministic.
async fn event_loop(world: &Rc<RefCell<World>>, events: &mut UnboundedReceiver<Event>) {
    loop {
        if world.borrow().reporter.stop_requested() {
            debug!("stopping: critical failure reported");
            break;
        }
        let deadline = world
            .borrow_mut()
            .timers
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_TICK);
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(Event::Output { process, chunk }) => {
                    world.borrow_mut().receive_chunk(&process, &chunk);
                }
                Some(Event::Wake) => {}
                Some(Event::TestFinished) | None => break,
            },
            _ = sleep_until(deadline) => {
                world.borrow_mut().fire_due_timers();
            }
        }
    }
}

fn spawn_process(
    world: &Rc<RefCell<World>>,
    events: &UnboundedSender<Event>,
    spec: &ProcessSpec,
) -> Result<()> {
    let mut record = Process::from_spec(spec)?;
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    #[cfg(unix)]
    command.process_group(0);
    let mut child = command
        .spawn()
        .with_context(|| format!("spawn {} ({})", spec.name, spec.program))?;
    debug!("{}: connection made (pid {:?})", spec.name, child.id());
    let stdout = child.stdout.take().context("child stdout is piped")?;
    let stderr = child.stderr.take().context("child stderr is piped")?;
    let stdin = child.stdin.take().context("child stdin is piped")?;
    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
    record.attach_stdin(stdin_tx);
    tokio::task::spawn_local(pump_stdin(spec.name.clone(), stdin, stdin_rx));
    tokio::task::spawn_local(pump_output(spec.name.clone(), stdout, events.clone()));
    tokio::task::spawn_local(pump_output(spec.name.clone(), stderr, events.clone()));
    let mut world = world.borrow_mut();
    world.registry.insert(record)?;
    world.children.push((spec.name.clone(), child));
    Ok(())
}

/// Forward raw bytes from one child stream into the event channel,
/// preserving chunk boundaries as the OS delivered them.
async fn pump_output(
    process: String,
    mut stream: impl AsyncRead + Unpin,
    events: UnboundedSender<Event>,
) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                if events
                    .send(Event::Output {
                        process: process.clone(),
                        chunk,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                debug!("{process}: read failed: {err}");
                break;
            }
        }
    }
    debug!("{process}: output stream closed");
}

async fn pump_stdin(process: String, mut stdin: ChildStdin, mut rx: UnboundedReceiver<String>) {
    while let Some(command) = rx.recv().await {
        if let Err(err) = stdin.write_all(command.as_bytes()).await {
            debug!("{process}: stdin write failed: {err}");
            break;
        }
        let _ = stdin.flush().await;
    }
    debug!("{process}: stdin closed");
}

/// Interrupt every still-running child, then kill whatever ignores it.
async fn shutdown(world: &Rc<RefCell<World>>) {
    let children = std::mem::take(&mut world.borrow_mut().children);
    for (name, mut child) in children {
        if let Ok(Some(status)) = child.try_wait() {
            debug!("{name}: process already ended, status {:?}", status.code());
            continue;
        }
        interrupt_child(&name, &child);
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("{name}: process ended, status {:?}", status.code()),
            Ok(Err(err)) => debug!("{name}: wait failed: {err}"),
            Err(_) => {
                debug!("{name}: did not exit after interrupt, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

/// Signal the child's whole process group so grandchildren go too.
#[cfg(unix)]
fn interrupt_child(name: &str, child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    debug!("{name}: interrupting process group {pid}");
    match killpg(Pid::from_raw(pid as i32), Signal::SIGINT) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => debug!("{name}: failed to interrupt: {errno}"),
    }
}

#[cfg(not(unix))]
fn interrupt_child(_name: &str, _child: &Child) {
    // No process groups; the shutdown path falls through to a kill.
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_code_reflects_errors_only() {
        let passed = TestSummary {
            errors: 0,
            warnings: 3,
        };
        assert!(passed.passed());
        assert_eq!(passed.exit_code(), exit_code::SUCCESS);
        let failed = TestSummary {
            errors: 1,
            warnings: 0,
        };
        assert!(!failed.passed());
        assert_eq!(failed.exit_code(), exit_code::FAILED);
    }
}
