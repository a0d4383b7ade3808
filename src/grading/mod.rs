//! Grading runner: patches, then tests, inside one environment.
//!
//! A run walks a small state machine:
//!
//! ```text
//! NotStarted -> Patching -> PatchFailed
//!                        -> Testing -> TestsPassed | TestsFailed | TestError
//! ```
//!
//! Patch application is fail-fast and nothing is retried inside a run.

pub mod grader;
pub mod results;
pub mod toolchain;

pub use grader::{Grade, GradeMetadata, Grader};
pub use results::{FileSummary, TestCaseResult, TestOutcome, TestResults};
pub use toolchain::{CommandToolchain, CompileOutcome, TestRun, Toolchain};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::error::HarnessError;
use crate::git::truncate;
use crate::patch::Patch;

use results::normalize_path;

/// States of a grading run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Patching,
    PatchFailed,
    Testing,
    TestsPassed,
    TestsFailed,
    TestError,
}

impl RunState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Patching)
                | (Self::Patching, Self::PatchFailed)
                | (Self::Patching, Self::Testing)
                | (Self::Testing, Self::TestsPassed)
                | (Self::Testing, Self::TestsFailed)
                | (Self::Testing, Self::TestError)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::PatchFailed | Self::TestsPassed | Self::TestsFailed | Self::TestError
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Patching => write!(f, "patching"),
            Self::PatchFailed => write!(f, "patch_failed"),
            Self::Testing => write!(f, "testing"),
            Self::TestsPassed => write!(f, "tests_passed"),
            Self::TestsFailed => write!(f, "tests_failed"),
            Self::TestError => write!(f, "test_error"),
        }
    }
}

/// Terminal result of a grading run.
#[derive(Debug)]
pub enum RunOutcome {
    PatchFailed(HarnessError),
    TestsPassed(TestRun),
    TestsFailed(TestRun),
    TestError(HarnessError),
}

impl RunOutcome {
    pub fn state(&self) -> RunState {
        match self {
            Self::PatchFailed(_) => RunState::PatchFailed,
            Self::TestsPassed(_) => RunState::TestsPassed,
            Self::TestsFailed(_) => RunState::TestsFailed,
            Self::TestError(_) => RunState::TestError,
        }
    }

    pub fn test_run(&self) -> Option<&TestRun> {
        match self {
            Self::TestsPassed(run) | Self::TestsFailed(run) => Some(run),
            _ => None,
        }
    }
}

/// Tracks a run's state and logs every transition.
struct RunTracker<'a> {
    label: &'a str,
    state: RunState,
}

impl<'a> RunTracker<'a> {
    fn new(label: &'a str) -> Self {
        Self {
            label,
            state: RunState::NotStarted,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal run transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(run = self.label, from = %self.state, to = %next, "Run state");
        self.state = next;
    }
}

/// Applies patches and runs tests in an environment.
#[derive(Clone)]
pub struct GradingRunner {
    toolchain: Arc<dyn Toolchain>,
    patch_timeout: Duration,
}

impl GradingRunner {
    pub fn new(toolchain: Arc<dyn Toolchain>) -> Self {
        Self {
            toolchain,
            patch_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_patch_timeout(mut self, timeout: Duration) -> Self {
        self.patch_timeout = timeout;
        self
    }

    pub fn toolchain(&self) -> &dyn Toolchain {
        self.toolchain.as_ref()
    }

    /// Apply one patch to the workspace with `git apply`.
    pub async fn apply_patch(&self, env: &Environment, patch: &Patch) -> Result<(), HarnessError> {
        if patch.is_empty() {
            tracing::debug!(patch = %patch.label(), "Skipping empty patch");
            return Ok(());
        }
        let out = env
            .exec_with_input(
                "git apply --whitespace=nowarn -",
                patch.text().as_bytes(),
                self.patch_timeout,
            )
            .await;
        if out.success() {
            tracing::debug!(patch = %patch.label(), environment = env.name(), "Patch applied");
            return Ok(());
        }
        Err(HarnessError::PatchApplicationFailed {
            patch: patch.label(),
            reason: truncate(out.combined().trim(), 1000),
        })
    }

    /// Apply `patches` in order, stopping at the first failure.
    pub async fn apply_patches(
        &self,
        env: &Environment,
        patches: &[&Patch],
    ) -> Result<(), HarnessError> {
        for patch in patches {
            self.apply_patch(env, patch).await?;
        }
        Ok(())
    }

    /// Apply `patches`, then run exactly `test_files`.
    pub async fn run(
        &self,
        env: &Environment,
        patches: &[&Patch],
        test_files: &[String],
    ) -> RunOutcome {
        let label = env.name().to_string();
        let mut tracker = RunTracker::new(&label);

        tracker.advance(RunState::Patching);
        if let Err(e) = self.apply_patches(env, patches).await {
            tracker.advance(RunState::PatchFailed);
            return RunOutcome::PatchFailed(e);
        }

        tracker.advance(RunState::Testing);
        let outcome = match self.test(env, test_files).await {
            Ok(run) if run.results.failures() > 0 => RunOutcome::TestsFailed(run),
            Ok(run) => RunOutcome::TestsPassed(run),
            Err(e) => RunOutcome::TestError(e),
        };
        tracker.advance(outcome.state());
        outcome
    }

    /// Run `test_files` in the current workspace state and sanity-check the
    /// result stream.
    pub async fn test(&self, env: &Environment, test_files: &[String]) -> Result<TestRun, HarnessError> {
        if test_files.is_empty() {
            return Err(HarnessError::InvalidInput("no test files to run".to_string()));
        }
        for file in test_files {
            if !env.file_exists(file).await {
                return Err(HarnessError::MissingTestFile(file.clone()));
            }
        }

        let run = self.toolchain.run_tests(env, test_files).await?;

        if run.results.executed() == 0 {
            return Err(HarnessError::NoTestsExecuted {
                files: test_files.join(" "),
            });
        }

        let by_file = run.results.by_file();
        let silent: Vec<&str> = test_files
            .iter()
            .map(String::as_str)
            .filter(|f| {
                by_file
                    .get(&normalize_path(f))
                    .map_or(true, |s| s.executed() == 0)
            })
            .collect();
        if !silent.is_empty() {
            return Err(HarnessError::NoTestsExecuted {
                files: silent.join(" "),
            });
        }

        if run.exit_code != 0 && run.results.failures() == 0 {
            return Err(HarnessError::ToolchainFailed(format!(
                "test runner exited with {} but reported no failures: {}",
                run.exit_code,
                truncate(run.log.trim(), 500)
            )));
        }

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(RunState::NotStarted.can_transition_to(RunState::Patching));
        assert!(RunState::Patching.can_transition_to(RunState::PatchFailed));
        assert!(RunState::Patching.can_transition_to(RunState::Testing));
        assert!(RunState::Testing.can_transition_to(RunState::TestError));
        assert!(!RunState::NotStarted.can_transition_to(RunState::Testing));
        assert!(!RunState::PatchFailed.can_transition_to(RunState::Testing));
        assert!(!RunState::TestsPassed.can_transition_to(RunState::Patching));
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::PatchFailed.is_terminal());
        assert!(RunState::TestsFailed.is_terminal());
        assert!(!RunState::Testing.is_terminal());
        assert_eq!(RunState::TestsPassed.to_string(), "tests_passed");
    }

    #[test]
    fn test_outcome_state() {
        let outcome = RunOutcome::PatchFailed(HarnessError::PatchApplicationFailed {
            patch: "a..b".to_string(),
            reason: "conflict".to_string(),
        });
        assert_eq!(outcome.state(), RunState::PatchFailed);
        assert!(outcome.test_run().is_none());
    }
}
