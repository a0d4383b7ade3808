//! Command-line interface for hdl-forge.
//!
//! Provides commands for listing, diffing, validating, grading and exporting
//! registry problems.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
