//! Six-check validation of a problem's branch triad.
//!
//! The [`Validator`] proves, for one problem, that:
//!
//! 1. the baseline builds (and its visible tests pass),
//! 2. the test patch applies to the baseline,
//! 3. the hidden tests fail on the baseline,
//! 4. the golden patch applies to the baseline,
//! 5. the golden patch builds,
//! 6. the hidden tests pass with the golden patch.
//!
//! Every check runs in its own freshly built environment, and all six always
//! run: a failing check never skips a later one. Harness errors become
//! `error` outcomes instead of propagating, so a broken task definition shows
//! up as data in its [`ValidationReport`].

pub mod check;
pub mod junit;
pub mod report;

pub use check::{CheckAction, CheckKind, CheckOutcome, CheckPlan, CheckResult, Expectation};
pub use report::{ValidationReport, ValidationSummary, Verdict};

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::cancel::Cancellation;
use crate::environment::{Environment, EnvironmentBuilder, EnvironmentRequest, EnvironmentTracker};
use crate::error::HarnessError;
use crate::grading::{GradingRunner, RunOutcome};
use crate::patch::generator::ProblemPatches;
use crate::patch::{Patch, PatchGenerator, PatchRole};
use crate::registry::ProblemSpec;

/// Shared state a validation runs under.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Accounts for every environment the validation builds.
    pub tracker: EnvironmentTracker,
    /// Stops the validation between or during checks.
    pub cancel: Cancellation,
}

impl ValidationContext {
    pub fn new(tracker: EnvironmentTracker, cancel: Cancellation) -> Self {
        Self { tracker, cancel }
    }
}

/// Runs the six checks for one problem.
#[derive(Clone)]
pub struct Validator {
    builder: Arc<dyn EnvironmentBuilder>,
    generator: PatchGenerator,
    runner: GradingRunner,
}

impl Validator {
    pub fn new(
        builder: Arc<dyn EnvironmentBuilder>,
        generator: PatchGenerator,
        runner: GradingRunner,
    ) -> Self {
        Self {
            builder,
            generator,
            runner,
        }
    }

    pub fn builder(&self) -> &dyn EnvironmentBuilder {
        self.builder.as_ref()
    }

    pub fn generator(&self) -> &PatchGenerator {
        &self.generator
    }

    /// Validate a problem to completion.
    pub async fn validate(&self, problem: &ProblemSpec) -> Result<ValidationReport, HarnessError> {
        self.validate_with(problem, &ValidationContext::default())
            .await
    }

    /// Validate a problem under `ctx`.
    ///
    /// Check failures and harness errors are recorded in the report. The only
    /// error returned is [`HarnessError::Cancelled`], after every environment
    /// this call built has been torn down.
    pub async fn validate_with(
        &self,
        problem: &ProblemSpec,
        ctx: &ValidationContext,
    ) -> Result<ValidationReport, HarnessError> {
        if ctx.cancel.is_cancelled() {
            return Err(HarnessError::Cancelled);
        }
        let started_at = Utc::now();
        let patches = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(HarnessError::Cancelled),
            patches = self.generator.for_problem(problem) => patches,
        };
        self.validate_with_patches(problem, &patches, ctx, started_at)
            .await
    }

    /// Validate with already generated patches.
    pub async fn validate_with_patches(
        &self,
        problem: &ProblemSpec,
        patches: &ProblemPatches,
        ctx: &ValidationContext,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<ValidationReport, HarnessError> {
        let mut checks = Vec::with_capacity(CheckKind::ALL.len());
        for kind in CheckKind::ALL {
            if ctx.cancel.is_cancelled() {
                return Err(HarnessError::Cancelled);
            }
            let result = self.run_check(kind, problem, patches, ctx).await?;
            tracing::info!(
                problem_id = %problem.id,
                check = %kind,
                outcome = %result.outcome.label(),
                duration_ms = result.duration.as_millis() as u64,
                "Check finished"
            );
            if let Some(reason) = result.outcome.reason() {
                tracing::debug!(problem_id = %problem.id, check = %kind, reason, "Check detail");
            }
            checks.push(result);
        }

        let report = ValidationReport::new(&problem.id, checks, started_at)?;
        tracing::info!(
            problem_id = %problem.id,
            verdict = %report.verdict(),
            "Validation finished"
        );
        Ok(report)
    }

    async fn run_check(
        &self,
        kind: CheckKind,
        problem: &ProblemSpec,
        patches: &ProblemPatches,
        ctx: &ValidationContext,
    ) -> Result<CheckResult, HarnessError> {
        let started = Instant::now();
        let plan = kind.plan();
        let errored = |err: &HarnessError| {
            CheckResult::new(kind, CheckOutcome::error(err)).with_duration(started.elapsed())
        };

        let mut ordered: Vec<&Patch> = Vec::with_capacity(plan.patches.len());
        for role in plan.patches {
            let patch = match role {
                PatchRole::Test => &patches.test,
                PatchRole::Golden => &patches.golden,
                PatchRole::Agent => {
                    return Ok(errored(&HarnessError::InvalidInput(
                        "validation checks do not take agent patches".to_string(),
                    )))
                }
            };
            match patch {
                Ok(patch) => ordered.push(patch),
                Err(e) => return Ok(errored(e)),
            }
        }

        let request = EnvironmentRequest::new(&problem.id, &problem.baseline, kind.as_str());
        let built = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(HarnessError::Cancelled),
            built = Environment::materialize(self.builder.as_ref(), &ctx.tracker, &request) => built,
        };
        let env = match built {
            Ok(env) => env,
            Err(e) => return Ok(errored(&e)),
        };
        let environment = env.name().to_string();

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            outcome = self.execute(plan, &env, &ordered, problem) => Some(outcome),
        };
        env.teardown().await;

        match outcome {
            Some(outcome) => Ok(CheckResult::new(kind, outcome)
                .with_duration(started.elapsed())
                .with_environment(environment)),
            None => Err(HarnessError::Cancelled),
        }
    }

    async fn execute(
        &self,
        plan: CheckPlan,
        env: &Environment,
        patches: &[&Patch],
        problem: &ProblemSpec,
    ) -> CheckOutcome {
        match plan.action {
            CheckAction::ApplyOnly => match self.runner.apply_patches(env, patches).await {
                Ok(()) => CheckOutcome::Pass,
                Err(e) => CheckOutcome::error(&e),
            },
            CheckAction::Compile => {
                if let Err(e) = self.runner.apply_patches(env, patches).await {
                    return CheckOutcome::error(&e);
                }
                self.compile(env).await
            }
            CheckAction::CompileAndRunVisibleTests => {
                if let Err(e) = self.runner.apply_patches(env, patches).await {
                    return CheckOutcome::error(&e);
                }
                let compiled = self.compile(env).await;
                if !compiled.is_pass() || problem.baseline_test_files.is_empty() {
                    return compiled;
                }
                match self.runner.test(env, &problem.baseline_test_files).await {
                    Ok(run) if run.results.failures() == 0 => CheckOutcome::Pass,
                    Ok(run) => CheckOutcome::fail(format!(
                        "baseline tests failed: {}",
                        run.results.failing_ids().join(", ")
                    )),
                    Err(e) => CheckOutcome::error(&e),
                }
            }
            CheckAction::RunHiddenTests(expectation) => {
                let outcome = self.runner.run(env, patches, &problem.test_files).await;
                classify(outcome, expectation)
            }
        }
    }

    async fn compile(&self, env: &Environment) -> CheckOutcome {
        match self.runner.toolchain().compile(env).await {
            Ok(c) if c.success => CheckOutcome::Pass,
            Ok(c) => CheckOutcome::fail(format!(
                "build exited with {}: {}",
                c.exit_code,
                c.log.trim()
            )),
            Err(e) => CheckOutcome::error(&e),
        }
    }
}

/// Map a grading run onto a check outcome.
fn classify(outcome: RunOutcome, expectation: Expectation) -> CheckOutcome {
    match (outcome, expectation) {
        (RunOutcome::PatchFailed(e), _) | (RunOutcome::TestError(e), _) => CheckOutcome::error(&e),
        (RunOutcome::TestsFailed(_), Expectation::AtLeastOneFailure) => CheckOutcome::Pass,
        (RunOutcome::TestsPassed(_), Expectation::AllPass) => CheckOutcome::Pass,
        (RunOutcome::TestsPassed(run), Expectation::AtLeastOneFailure) => CheckOutcome::fail(format!(
            "all {} hidden test(s) passed without the golden patch",
            run.results.executed()
        )),
        (RunOutcome::TestsFailed(run), Expectation::AllPass) => CheckOutcome::fail(format!(
            "{} hidden test(s) failed: {}",
            run.results.failures(),
            run.results.failing_ids().join(", ")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::grading::results::{TestCaseResult, TestOutcome, TestResults};
    use crate::grading::TestRun;

    fn run(outcomes: &[TestOutcome]) -> TestRun {
        TestRun {
            results: TestResults::from_cases(
                outcomes
                    .iter()
                    .enumerate()
                    .map(|(i, &outcome)| TestCaseResult {
                        id: format!("tests/test_fifo.py::test_{i}"),
                        file: "tests/test_fifo.py".to_string(),
                        outcome,
                    })
                    .collect(),
            ),
            exit_code: 0,
            log: String::new(),
        }
    }

    #[test]
    fn test_classify_expect_failure() {
        let failed = RunOutcome::TestsFailed(run(&[TestOutcome::Passed, TestOutcome::Failed]));
        assert!(classify(failed, Expectation::AtLeastOneFailure).is_pass());

        let passed = RunOutcome::TestsPassed(run(&[TestOutcome::Passed]));
        let outcome = classify(passed, Expectation::AtLeastOneFailure);
        assert_eq!(outcome.label(), "fail");
        assert!(outcome.reason().unwrap().contains("1 hidden test(s) passed"));
    }

    #[test]
    fn test_classify_expect_pass() {
        let passed = RunOutcome::TestsPassed(run(&[TestOutcome::Passed, TestOutcome::Skipped]));
        assert!(classify(passed, Expectation::AllPass).is_pass());

        let failed = RunOutcome::TestsFailed(run(&[TestOutcome::Error]));
        let outcome = classify(failed, Expectation::AllPass);
        assert!(outcome.reason().unwrap().contains("test_fifo.py::test_0"));
    }

    #[test]
    fn test_classify_errors() {
        let patch_failed = RunOutcome::PatchFailed(HarnessError::PatchApplicationFailed {
            patch: "base..test".to_string(),
            reason: "conflict".to_string(),
        });
        assert_eq!(
            classify(patch_failed, Expectation::AllPass).error_kind(),
            Some(ErrorKind::PatchApplicationFailed)
        );

        let no_tests = RunOutcome::TestError(HarnessError::NoTestsExecuted {
            files: "tests/test_fifo.py".to_string(),
        });
        assert_eq!(
            classify(no_tests, Expectation::AtLeastOneFailure).error_kind(),
            Some(ErrorKind::NoTestsExecuted)
        );
    }
}
