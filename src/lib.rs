//! hdl-forge: validation and grading harness for branch-triad Verilog tasks.
//!
//! Every problem lives in one source repository as three branches: an
//! unsolved baseline, the baseline plus hidden tests, and the baseline plus a
//! reference solution. The harness derives patches from those branches,
//! proves each problem well-formed with six checks run in fresh environments,
//! and grades agent solutions against the hidden tests.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod export;
pub mod git;
pub mod grading;
pub mod patch;
pub mod registry;
pub mod scheduler;
pub mod validation;

pub use error::{ErrorKind, HarnessError, RegistryError};
