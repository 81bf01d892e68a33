// Copyright 2023-2025 Martin Pool

//! Harness configuration, mostly derived from command-line arguments.

use camino::Utf8PathBuf;
use clap::Args;

/// The arguments every test executable shares.
///
/// Embed with `#[command(flatten)]` and add test-specific arguments (a
/// positional seed, say) alongside.
#[derive(Debug, Args)]
pub struct BaseArgs {
    /// write a debug-level log to this file.
    #[arg(long, default_value = "run.log")]
    pub logfile: Utf8PathBuf,

    /// also write test-level messages to this file.
    #[arg(long)]
    pub summaryfile: Option<Utf8PathBuf>,

    /// enable verbose console output.
    #[arg(long)]
    pub verbose: bool,
}

/// In-process options for one harness run.
#[derive(Debug, Default, Clone)]
pub struct Options {
    /// Debug-level log destination; None for console-only logging.
    pub logfile: Option<Utf8PathBuf>,
    /// Info-level copy, for drivers that diff a summary transcript.
    pub summaryfile: Option<Utf8PathBuf>,
    pub verbose: bool,
    /// Criticality applied to failures that don't specify their own.
    pub default_critical: bool,
}

impl From<&BaseArgs> for Options {
    fn from(args: &BaseArgs) -> Options {
        Options {
            logfile: Some(args.logfile.clone()),
            summaryfile: args.summaryfile.clone(),
            verbose: args.verbose,
            default_critical: false,
        }
    }
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestArgs {
        #[command(flatten)]
        base: BaseArgs,

        #[arg(default_value_t = 1)]
        seed: u64,
    }

    #[test]
    fn defaults() {
        let args = TestArgs::parse_from(["self"]);
        assert_eq!(args.base.logfile, "run.log");
        assert_eq!(args.base.summaryfile, None);
        assert!(!args.base.verbose);
        assert_eq!(args.seed, 1);
    }

    #[test]
    fn base_args_flatten_beside_test_arguments() {
        let args = TestArgs::parse_from([
            "self",
            "--logfile",
            "other.log",
            "--summaryfile",
            "summary.log",
            "--verbose",
            "7",
        ]);
        let options = Options::from(&args.base);
        assert_eq!(options.logfile.unwrap(), "other.log");
        assert_eq!(options.summaryfile.unwrap(), "summary.log");
        assert!(options.verbose);
        assert_eq!(args.seed, 7);
    }
}
