// Copyright 2023-2025 Martin Pool

//! Per-process state: line reassembly, output history, error patterns.
//!
//! Each child process has a record here holding everything observed from it:
//! an append-only history of complete lines, the partial-line byte buffer,
//! the registered error patterns, and the per-expectation cursors into the
//! history. The record outlives the OS process; leaves of an expectation
//! tree refer to processes by name and may be built before the process
//! exists.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::logging::Reporter;
use crate::Result;

/// How to launch one child process.
///
/// The name must be unique within a harness; expectations refer to the
/// process by it. The working directory defaults to the test's own.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub(crate) name: String,
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) cwd: Option<Utf8PathBuf>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) output_file: Option<Utf8PathBuf>,
    pub(crate) error_patterns: Vec<(String, bool)>,
}

impl ProcessSpec {
    pub fn new(name: &str, program: &str) -> ProcessSpec {
        ProcessSpec {
            name: name.to_owned(),
            program: program.to_owned(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            output_file: None,
            error_patterns: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: &str) -> ProcessSpec {
        self.args.push(arg.to_owned());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: AsRef<str>>(mut self, args: I) -> ProcessSpec {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<Utf8PathBuf>) -> ProcessSpec {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> ProcessSpec {
        self.env.push((key.to_owned(), value.to_owned()));
        self
    }

    /// Capture every received line, flushed per line, to this file.
    pub fn output_file(mut self, path: impl Into<Utf8PathBuf>) -> ProcessSpec {
        self.output_file = Some(path.into());
        self
    }

    /// Register an error pattern before the first byte arrives.
    pub fn error_pattern(mut self, pattern: &str, critical: bool) -> ProcessSpec {
        self.error_patterns.push((pattern.to_owned(), critical));
        self
    }
}

struct ErrorPattern {
    pattern: String,
    regex: Regex,
    critical: bool,
}

/// Everything known about one child process.
pub(crate) struct Process {
    name: String,
    /// Complete `\n`-terminated lines, append-only between history clears.
    history: Vec<String>,
    /// Bytes received since the last `\n`.
    partial: Vec<u8>,
    /// Expectation index -> first history index not yet consumed by it.
    cursors: HashMap<usize, usize>,
    error_patterns: Vec<ErrorPattern>,
    stdin: Option<UnboundedSender<String>>,
    output_file: Option<File>,
}

impl Process {
    pub fn new(name: &str) -> Process {
        Process {
            name: name.to_owned(),
            history: Vec::new(),
            partial: Vec::new(),
            cursors: HashMap::new(),
            error_patterns: Vec::new(),
            stdin: None,
            output_file: None,
        }
    }

    pub fn from_spec(spec: &ProcessSpec) -> Result<Process> {
        let mut process = Process::new(&spec.name);
        if let Some(path) = &spec.output_file {
            let file =
                File::create(path).with_context(|| format!("create output file {path}"))?;
            process.output_file = Some(file);
        }
        for (pattern, critical) in &spec.error_patterns {
            process.register_error_pattern(pattern, *critical)?;
        }
        Ok(process)
    }

    pub fn attach_stdin(&mut self, stdin: UnboundedSender<String>) {
        self.stdin = Some(stdin);
    }

    /// Fold a chunk of child output into the partial-line buffer and return
    /// the complete lines it finished.
    ///
    /// Every returned line ends with exactly one `\n` (a preceding `\r` is
    /// stripped) and has already been appended to the history; partial
    /// writes never cause duplicate delivery.
    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.partial.drain(..=pos).collect();
            if raw.len() >= 2 && raw[raw.len() - 2] == b'\r' {
                raw.remove(raw.len() - 2);
            }
            let line = String::from_utf8_lossy(&raw).into_owned();
            self.log_line(&line);
            self.history.push(line.clone());
            lines.push(line);
        }
        lines
    }

    fn log_line(&mut self, line: &str) {
        debug!("{}: {}", self.name, line.trim_end());
        if let Some(file) = &mut self.output_file {
            // Flush per line so a crash leaves a usable capture.
            let _ = file.write_all(line.as_bytes());
            let _ = file.flush();
        }
    }

    /// Scan one complete line against the registered error patterns.
    pub fn check_error_patterns(&self, line: &str, reporter: &mut Reporter) {
        for ep in &self.error_patterns {
            if ep.regex.is_match(line) {
                reporter.error(
                    &format!("found {}: {}", self.name, line.trim_end()),
                    ep.critical,
                );
            }
        }
    }

    /// Registration is idempotent on the pattern string: a second
    /// registration replaces the first.
    pub fn register_error_pattern(&mut self, pattern: &str, critical: bool) -> Result<()> {
        let regex = Regex::new(pattern)
            .with_context(|| format!("compile error pattern '{pattern}'"))?;
        debug!("{}: registering error pattern '{}'", self.name, pattern);
        self.error_patterns.retain(|ep| ep.pattern != pattern);
        self.error_patterns.push(ErrorPattern {
            pattern: pattern.to_owned(),
            regex,
            critical,
        });
        Ok(())
    }

    pub fn unregister_error_pattern(&mut self, pattern: &str) {
        debug!("{}: unregistering error pattern '{}'", self.name, pattern);
        self.error_patterns.retain(|ep| ep.pattern != pattern);
    }

    pub fn cursor(&self, expect_index: usize) -> usize {
        self.cursors.get(&expect_index).copied().unwrap_or(0)
    }

    /// Snapshot of the history from the cursor for `expect_index` onward.
    pub fn history_from_cursor(&self, expect_index: usize) -> Vec<String> {
        self.history[self.cursor(expect_index).min(self.history.len())..].to_vec()
    }

    /// Advance the cursor for `expect_index` past the first occurrence of
    /// `line` at or after it, or to the end of history when not found.
    pub fn move_cursor(&mut self, expect_index: usize, line: &str) {
        let cursor = self.cursor(expect_index);
        let new = match self.history[cursor.min(self.history.len())..]
            .iter()
            .position(|h| h == line)
        {
            Some(offset) => cursor + offset + 1,
            None => self.history.len(),
        };
        self.cursors.insert(expect_index, new);
    }

    /// Forget every line seen so far and reset all cursors to zero. The
    /// only operation allowed to shrink the history.
    pub fn clear_expect_history(&mut self) {
        if let Some(file) = &mut self.output_file {
            let _ = file.write_all(b"CLEAR HISTORY\n");
            let _ = file.flush();
        }
        self.history.clear();
        self.cursors.clear();
    }

    pub fn send_line(&self, command: &str) -> Result<()> {
        info!("{}: send: '{}'", self.name, command);
        let Some(stdin) = &self.stdin else {
            bail!("{}: no stdin attached", self.name);
        };
        stdin
            .send(format!("{command}\r\n"))
            .with_context(|| format!("{}: stdin closed", self.name))?;
        Ok(())
    }

    #[cfg(test)]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// All process records for one harness, keyed by unique name.
#[derive(Default)]
pub(crate) struct ProcessRegistry {
    processes: HashMap<String, Process>,
}

impl ProcessRegistry {
    pub fn new() -> ProcessRegistry {
        ProcessRegistry::default()
    }

    pub fn insert(&mut self, process: Process) -> Result<()> {
        if self.processes.contains_key(&process.name) {
            bail!("process name {:?} is already in use", process.name);
        }
        self.processes.insert(process.name.clone(), process);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Process> {
        self.processes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Process> {
        self.processes.get_mut(name)
    }

    /// Cursor movement for a process that doesn't exist is a no-op: leaves
    /// may name processes that were never launched.
    pub fn move_cursor(&mut self, name: &str, expect_index: usize, line: &str) {
        if let Some(process) = self.processes.get_mut(name) {
            process.move_cursor(expect_index, line);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.processes.keys().cloned().collect()
    }
}
