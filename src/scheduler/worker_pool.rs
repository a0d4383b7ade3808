//! Bounded pool of validation tasks.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cancel::Cancellation;
use crate::environment::{EnvironmentTracker, TrackerSnapshot};
use crate::error::HarnessError;
use crate::registry::{ProblemRegistry, ProblemSpec};
use crate::validation::{ValidationContext, ValidationReport, ValidationSummary, Validator};

use super::{SchedulerConfig, SchedulerError};

/// Anything that can validate a single problem.
#[async_trait]
pub trait ProblemValidator: Send + Sync {
    /// Validate `problem`, building environments through `ctx.tracker` and
    /// returning [`HarnessError::Cancelled`] once `ctx.cancel` fires.
    async fn validate(
        &self,
        problem: &ProblemSpec,
        ctx: &ValidationContext,
    ) -> Result<ValidationReport, HarnessError>;
}

#[async_trait]
impl ProblemValidator for Validator {
    async fn validate(
        &self,
        problem: &ProblemSpec,
        ctx: &ValidationContext,
    ) -> Result<ValidationReport, HarnessError> {
        self.validate_with(problem, ctx).await
    }
}

/// Result of a scheduling run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerOutcome {
    /// Completed reports, by problem id.
    pub reports: BTreeMap<String, ValidationReport>,
    /// Problems that were cancelled before producing a report.
    pub cancelled: Vec<String>,
    /// Environment accounting at the end of the run.
    pub environments: TrackerSnapshot,
}

impl SchedulerOutcome {
    pub fn summary(&self) -> ValidationSummary {
        ValidationSummary::from_reports(self.reports.values(), self.cancelled.len())
    }

    /// Whether every problem produced a report.
    pub fn is_complete(&self) -> bool {
        self.cancelled.is_empty()
    }
}

/// Runs a [`ProblemValidator`] over many problems concurrently.
pub struct Scheduler {
    validator: Arc<dyn ProblemValidator>,
    config: SchedulerConfig,
    tracker: EnvironmentTracker,
}

impl Scheduler {
    /// Creates a scheduler.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConcurrency` if `config.concurrency`
    /// is zero.
    pub fn new(
        validator: Arc<dyn ProblemValidator>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            validator,
            config,
            tracker: EnvironmentTracker::new(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Environment accounting shared by every validation this scheduler runs.
    pub fn tracker(&self) -> &EnvironmentTracker {
        &self.tracker
    }

    /// Validates every problem in `registry`.
    ///
    /// At most `concurrency` problems are in flight. When `cancel` fires,
    /// problems not yet dispatched are reported as cancelled, in-flight ones
    /// are allowed to tear down, and the call returns once all of them have.
    ///
    /// # Errors
    ///
    /// Only scheduler faults are returned; per-problem failures are recorded
    /// in the reports.
    pub async fn validate_all(
        &self,
        registry: &ProblemRegistry,
        cancel: &Cancellation,
    ) -> Result<SchedulerOutcome, SchedulerError> {
        let total = registry.len();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let completed = Arc::new(AtomicUsize::new(0));
        let ctx = ValidationContext::new(self.tracker.clone(), cancel.clone());

        info!(
            problems = total,
            concurrency = self.config.concurrency,
            "Starting validation run"
        );

        let mut handles: Vec<(String, JoinHandle<Result<ValidationReport, HarnessError>>)> =
            Vec::with_capacity(total);
        let mut cancelled = Vec::new();
        let mut problems = registry.iter().enumerate();

        while let Some((index, problem)) = problems.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    Some(permit.map_err(|_| SchedulerError::LimiterClosed)?)
                }
            };
            let Some(permit) = permit else {
                warn!(problem_id = %problem.id, "Cancelled before dispatch");
                cancelled.push(problem.id.clone());
                cancelled.extend(problems.by_ref().map(|(_, p)| p.id.clone()));
                break;
            };

            let done = completed.load(Ordering::SeqCst);
            info!(
                problem_id = %problem.id,
                "VALIDATE {}/{} ({:.0}% completed)",
                index + 1,
                total,
                percent(done, total)
            );

            let validator = Arc::clone(&self.validator);
            let problem = problem.clone();
            let ctx = ctx.clone();
            let completed = Arc::clone(&completed);
            let max_attempts = self.config.max_attempts.max(1);
            let id = problem.id.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = validate_problem(validator.as_ref(), &problem, &ctx, max_attempts).await;
                completed.fetch_add(1, Ordering::SeqCst);
                result
            });
            handles.push((id, handle));
        }

        let mut reports = BTreeMap::new();
        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(report)) => {
                    reports.insert(id, report);
                }
                Ok(Err(HarnessError::Cancelled)) => cancelled.push(id),
                Ok(Err(e)) => {
                    reports.insert(id.clone(), ValidationReport::infrastructure_failure(&id, &e));
                }
                Err(e) if e.is_cancelled() => cancelled.push(id),
                Err(e) => {
                    return Err(SchedulerError::Join {
                        problem_id: id,
                        reason: e.to_string(),
                    })
                }
            }
        }

        let environments = self.tracker.snapshot();
        if environments.live != 0 {
            error!(live = environments.live, "Environments outlived the validation run");
        }

        let outcome = SchedulerOutcome {
            reports,
            cancelled,
            environments,
        };
        let summary = outcome.summary();
        info!(
            total = summary.total,
            valid = summary.valid,
            invalid = summary.invalid,
            cancelled = summary.cancelled,
            peak_environments = environments.peak,
            "Validation run finished"
        );
        Ok(outcome)
    }
}

/// Validate one problem, retrying infrastructure failures and containing
/// panics.
async fn validate_problem(
    validator: &dyn ProblemValidator,
    problem: &ProblemSpec,
    ctx: &ValidationContext,
    max_attempts: u32,
) -> Result<ValidationReport, HarnessError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = AssertUnwindSafe(validator.validate(problem, ctx))
            .catch_unwind()
            .await;

        let report = match result {
            Ok(Ok(report)) => report,
            Ok(Err(HarnessError::Cancelled)) => return Err(HarnessError::Cancelled),
            Ok(Err(e)) => {
                warn!(problem_id = %problem.id, error = %e, "Validation aborted");
                ValidationReport::infrastructure_failure(&problem.id, &e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(problem_id = %problem.id, panic = %message, "Validation panicked");
                ValidationReport::infrastructure_failure(
                    &problem.id,
                    &HarnessError::Internal(format!("validation panicked: {message}")),
                )
            }
        };

        if report.has_infrastructure_error() && attempt < max_attempts && !ctx.cancel.is_cancelled()
        {
            warn!(
                problem_id = %problem.id,
                attempt,
                max_attempts,
                "Infrastructure error, retrying problem"
            );
            continue;
        }
        return Ok(report.with_attempts(attempt));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{CheckKind, CheckOutcome, CheckResult};
    use std::sync::atomic::AtomicU32;

    fn problem(id: &str) -> ProblemSpec {
        ProblemSpec::new(
            id,
            "desc",
            format!("{id}_baseline"),
            format!("{id}_test"),
            format!("{id}_golden"),
            vec!["tests/test.py".to_string()],
        )
    }

    fn report_with(id: &str, outcome: CheckOutcome) -> ValidationReport {
        let checks = CheckKind::ALL
            .iter()
            .map(|&k| CheckResult::new(k, outcome.clone()))
            .collect();
        ValidationReport::new(id, checks, chrono::Utc::now()).unwrap()
    }

    /// Fails with an infrastructure error until the given attempt.
    struct Flaky {
        succeed_on: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProblemValidator for Flaky {
        async fn validate(
            &self,
            problem: &ProblemSpec,
            _ctx: &ValidationContext,
        ) -> Result<ValidationReport, HarnessError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.succeed_on {
                Err(HarnessError::EnvironmentBuildFailed("docker unavailable".to_string()))
            } else {
                Ok(report_with(&problem.id, CheckOutcome::Pass))
            }
        }
    }

    #[tokio::test]
    async fn test_infrastructure_errors_are_retried() {
        let flaky = Flaky {
            succeed_on: 2,
            calls: AtomicU32::new(0),
        };
        let ctx = ValidationContext::default();
        let report = validate_problem(&flaky, &problem("a"), &ctx, 3).await.unwrap();
        assert!(report.is_valid());
        assert_eq!(report.attempts(), 2);
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let flaky = Flaky {
            succeed_on: 10,
            calls: AtomicU32::new(0),
        };
        let ctx = ValidationContext::default();
        let report = validate_problem(&flaky, &problem("a"), &ctx, 2).await.unwrap();
        assert!(!report.is_valid());
        assert!(report.has_infrastructure_error());
        assert_eq!(report.attempts(), 2);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    struct Panicky;

    #[async_trait]
    impl ProblemValidator for Panicky {
        async fn validate(
            &self,
            _problem: &ProblemSpec,
            _ctx: &ValidationContext,
        ) -> Result<ValidationReport, HarnessError> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error_report() {
        let ctx = ValidationContext::default();
        let report = validate_problem(&Panicky, &problem("a"), &ctx, 1).await.unwrap();
        let first = &report.checks()[0].outcome;
        assert_eq!(first.label(), "error(internal)");
        assert!(first.reason().unwrap().contains("boom"));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(1, 4), 25.0);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let result = Scheduler::new(Arc::new(Panicky), SchedulerConfig::new(0));
        assert!(matches!(result, Err(SchedulerError::InvalidConcurrency(0))));
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let scheduler = Scheduler::new(Arc::new(Panicky), SchedulerConfig::new(2)).unwrap();
        let outcome = scheduler
            .validate_all(&ProblemRegistry::default(), &Cancellation::new())
            .await
            .unwrap();
        assert!(outcome.reports.is_empty());
        assert!(outcome.is_complete());
    }
}
