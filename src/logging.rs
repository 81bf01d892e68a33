// Copyright 2023-2025 Martin Pool

//! Logging configuration and error/warning accounting.
//!
//! Console output is plain messages so that driver scripts can diff captured
//! stdout against a known-good transcript; errors and warnings carry their
//! own prefixes. A debug-level copy goes to `--logfile` and an info-level
//! copy to `--summaryfile` when configured.

use std::fs::File;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use crate::options::Options;
use crate::Result;

/// Install the tracing subscriber described by `options`.
///
/// Harmless to call more than once in a process (later calls keep the first
/// subscriber), which matters when several harnesses run in one test binary.
pub fn configure(options: &Options) -> Result<()> {
    let console_level = if options.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let console_layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_level(false)
        .with_target(false)
        .with_writer(std::io::stdout)
        .with_filter(console_level);
    let file_layer = match &options.logfile {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("create log file {path}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_level(false)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };
    let summary_layer = match &options.summaryfile {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("create summary file {path}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_level(false)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(LevelFilter::INFO),
            )
        }
        None => None,
    };
    let _ = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(summary_layer)
        .try_init();
    Ok(())
}

/// Accumulates errors and warnings for the life of one test run.
///
/// A critical error asks the scheduler to stop; everything else is counted
/// and the run continues.
#[derive(Debug)]
pub struct Reporter {
    errors: u32,
    warnings: u32,
    stop: bool,
    /// Criticality applied when a failure doesn't specify its own.
    pub default_critical: bool,
}

impl Reporter {
    pub fn new(default_critical: bool) -> Reporter {
        Reporter {
            errors: 0,
            warnings: 0,
            stop: false,
            default_critical,
        }
    }

    pub fn error(&mut self, reason: &str, critical: bool) {
        error!("ERROR: {reason}");
        self.errors += 1;
        if critical {
            self.stop = true;
        }
    }

    pub fn warning(&mut self, reason: &str) {
        warn!("WARNING: {reason}");
        self.warnings += 1;
    }

    pub fn counts(&self) -> (u32, u32) {
        (self.errors, self.warnings)
    }

    /// True once a critical failure has asked the scheduler to stop.
    pub fn stop_requested(&self) -> bool {
        self.stop
    }
}

/// The end-of-run status line: part of the output contract.
pub fn summary_line(errors: u32, warnings: u32) -> String {
    if errors > 0 || warnings > 0 {
        format!(
            "{} ERROR{} and {} WARNING{} detected",
            errors,
            if errors == 1 { "" } else { "S" },
            warnings,
            if warnings == 1 { "" } else { "S" },
        )
    } else {
        "Test passed".into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn summary_line_pluralizes() {
        assert_eq!(summary_line(0, 0), "Test passed");
        assert_eq!(summary_line(1, 0), "1 ERROR and 0 WARNINGS detected");
        assert_eq!(summary_line(0, 1), "0 ERRORS and 1 WARNING detected");
        assert_eq!(summary_line(2, 3), "2 ERRORS and 3 WARNINGS detected");
    }

    #[test]
    fn critical_error_requests_stop() {
        let mut reporter = Reporter::new(true);
        reporter.error("benign", false);
        assert!(!reporter.stop_requested());
        reporter.error("fatal", true);
        assert!(reporter.stop_requested());
        assert_eq!(reporter.counts(), (2, 0));
    }

    #[test]
    fn warnings_never_stop() {
        let mut reporter = Reporter::new(false);
        reporter.warning("odd");
        reporter.warning("odder");
        assert_eq!(reporter.counts(), (0, 2));
        assert!(!reporter.stop_requested());
    }
}
