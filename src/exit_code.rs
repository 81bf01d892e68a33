// Copyright 2023-2025 Martin Pool

//! Exit codes from test executables.
//!
//! Assigned so that driver scripts can distinguish the cases they care
//! about; the only hard contract is non-zero when errors were detected.

/// The test ran and every expectation was satisfied.
pub const SUCCESS: i32 = 0;

/// The wrong arguments, etc.
///
/// (1 is also the value returned by Clap.)
pub const USAGE: i32 = 1;

/// One or more errors were detected during the run.
pub const FAILED: i32 = 2;
