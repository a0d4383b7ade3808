//! Concurrent validation of many problems.
//!
//! The [`Scheduler`] runs the validator over every problem of a registry with
//! at most `concurrency` problems in flight:
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │ ProblemRegistry  │
//!                 └────────┬─────────┘
//!                          │ dispatch (semaphore permit per problem)
//!         ┌────────────────┼────────────────┐
//!         ▼                ▼                ▼
//!    ┌─────────┐      ┌─────────┐      ┌─────────┐
//!    │ task 1  │      │ task 2  │      │ task N  │   six checks each,
//!    └────┬────┘      └────┬────┘      └────┬────┘   one environment per check
//!         └────────────────┼────────────────┘
//!                          ▼
//!                 id -> ValidationReport
//! ```
//!
//! # Fault isolation
//!
//! Each problem runs in its own task. A harness error becomes data in that
//! problem's report, and a panic is caught and turned into an `internal`
//! error report. Neither reaches sibling problems.
//!
//! # Cancellation
//!
//! When the [`Cancellation`](crate::cancel::Cancellation) fires, dispatch
//! stops, in-flight validations tear down their environments and return, and
//! [`Scheduler::validate_all`] waits for all of them before returning.
//! Reports completed before the signal are kept.

pub mod worker_pool;

pub use worker_pool::{ProblemValidator, Scheduler, SchedulerOutcome};

use thiserror::Error;

/// Faults that abort a whole scheduling run.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Concurrency must be at least 1.
    #[error("Invalid concurrency {0}: at least one worker is required")]
    InvalidConcurrency(usize),

    /// The concurrency limiter was closed while problems were pending.
    #[error("Concurrency limiter closed")]
    LimiterClosed,

    /// A validation task could not be joined.
    #[error("Validation task for '{problem_id}' failed: {reason}")]
    Join { problem_id: String, reason: String },
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of problems validated at once.
    pub concurrency: usize,
    /// Attempts per problem when its report carries an infrastructure error.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.concurrency == 0 {
            return Err(SchedulerError::InvalidConcurrency(self.concurrency));
        }
        Ok(())
    }
}
