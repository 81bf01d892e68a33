// Copyright 2023-2025 Martin Pool

//! Black-box integration testing for multi-process systems.
//!
//! A test launches one or more child processes, watches their line-oriented
//! stdout/stderr, and succeeds when the observed output satisfies a
//! declarative expectation tree: combinators ([all_of], [one_of], [none_of],
//! [sequence]) over timed pattern matches ([expected]). A seeded
//! [generator] produces deterministic command streams for feeding the
//! processes under test.
//!
//! ```no_run
//! use ringmaster::{all_of, expected, Harness, Options, ProcessSpec};
//!
//! fn main() -> ringmaster::Result<()> {
//!     let harness = Harness::new(Options::default())?
//!         .process(ProcessSpec::new("ep0", "sh").args(["-c", "echo Started"]))
//!         .process(ProcessSpec::new("ep1", "sh").args(["-c", "echo Started"]));
//!     let summary = harness.run(|t| async move {
//!         t.expect(all_of(vec![
//!             expected("ep0", "Started", 10.0)?,
//!             expected("ep1", "Started", 10.0)?,
//!         ]))
//!         .await;
//!         Ok(())
//!     })?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod exit_code;
pub mod expect;
pub mod generator;
mod harness;
pub mod logging;
mod master;
mod options;
mod process;
pub mod timer;

pub use expect::{
    all_of, expected, none_of, one_of, sequence, AllOf, Expectation, Expected, NoneOf, OneOf,
    Progress, Sequence, TimeoutPolicy,
};
pub use harness::{Harness, Tester, TestSummary};
pub use logging::{summary_line, Reporter};
pub use options::{BaseArgs, Options};
pub use process::ProcessSpec;

pub type Result<T> = anyhow::Result<T>;
