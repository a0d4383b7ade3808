//! Validation reports and run summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

use super::check::{CheckKind, CheckOutcome, CheckResult};

/// Overall verdict of a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Valid,
    Invalid,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid => write!(f, "valid"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// The six check results of one problem, in order, plus the verdict.
///
/// Reports are immutable: every field is fixed at construction and the
/// verdict is derived from the checks. Deserialized reports are rebuilt
/// through [`ValidationReport::new`] and must agree with their recorded
/// verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredReport")]
pub struct ValidationReport {
    problem_id: String,
    verdict: Verdict,
    checks: Vec<CheckResult>,
    attempts: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

/// Wire form of a report, checked before it becomes a [`ValidationReport`].
#[derive(Deserialize)]
struct StoredReport {
    problem_id: String,
    verdict: Verdict,
    checks: Vec<CheckResult>,
    attempts: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl TryFrom<StoredReport> for ValidationReport {
    type Error = HarnessError;

    fn try_from(stored: StoredReport) -> Result<Self, Self::Error> {
        let report = Self::new(stored.problem_id, stored.checks, stored.started_at)?;
        if report.verdict != stored.verdict {
            return Err(HarnessError::InvalidInput(format!(
                "report for '{}' records verdict {} but its checks give {}",
                report.problem_id, stored.verdict, report.verdict
            )));
        }
        Ok(Self {
            finished_at: stored.finished_at,
            ..report.with_attempts(stored.attempts)
        })
    }
}

impl ValidationReport {
    /// Build a report from exactly one result per check, in check order.
    pub fn new(
        problem_id: impl Into<String>,
        checks: Vec<CheckResult>,
        started_at: DateTime<Utc>,
    ) -> Result<Self, HarnessError> {
        let kinds: Vec<CheckKind> = checks.iter().map(|c| c.check).collect();
        if kinds != CheckKind::ALL {
            return Err(HarnessError::InvalidInput(format!(
                "a report needs the six checks in order, got {kinds:?}"
            )));
        }
        let verdict = if checks.iter().all(|c| c.outcome.is_pass()) {
            Verdict::Valid
        } else {
            Verdict::Invalid
        };
        Ok(Self {
            problem_id: problem_id.into(),
            verdict,
            checks,
            attempts: 1,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Report in which every check errored for the same reason, used when a
    /// problem's validation crashed before producing results.
    pub fn infrastructure_failure(problem_id: impl Into<String>, err: &HarnessError) -> Self {
        let now = Utc::now();
        Self {
            problem_id: problem_id.into(),
            verdict: Verdict::Invalid,
            checks: CheckKind::ALL
                .iter()
                .map(|&kind| CheckResult::new(kind, CheckOutcome::error(err)))
                .collect(),
            attempts: 1,
            started_at: now,
            finished_at: now,
        }
    }

    /// Same report, recording how many attempts produced it.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn problem_id(&self) -> &str {
        &self.problem_id
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn is_valid(&self) -> bool {
        self.verdict == Verdict::Valid
    }

    pub fn checks(&self) -> &[CheckResult] {
        &self.checks
    }

    pub fn check(&self, kind: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.check == kind)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    /// Whether any check errored for an infrastructure reason.
    pub fn has_infrastructure_error(&self) -> bool {
        self.checks.iter().any(|c| {
            c.outcome
                .error_kind()
                .is_some_and(|kind| kind.is_infrastructure())
        })
    }

    /// Checks that did not pass.
    pub fn failing_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.outcome.is_pass())
    }
}

/// Aggregate counts over a validation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub cancelled: usize,
    /// Non-passing results per check, keyed by check name.
    pub check_failures: BTreeMap<String, usize>,
    /// Error kinds seen, keyed by kind name.
    pub error_kinds: BTreeMap<String, usize>,
}

impl ValidationSummary {
    pub fn from_reports<'a>(
        reports: impl IntoIterator<Item = &'a ValidationReport>,
        cancelled: usize,
    ) -> Self {
        let mut summary = Self {
            cancelled,
            ..Default::default()
        };
        for report in reports {
            summary.total += 1;
            match report.verdict() {
                Verdict::Valid => summary.valid += 1,
                Verdict::Invalid => summary.invalid += 1,
            }
            for check in report.failing_checks() {
                *summary
                    .check_failures
                    .entry(check.check.as_str().to_string())
                    .or_default() += 1;
                if let Some(kind) = check.outcome.error_kind() {
                    *summary.error_kinds.entry(kind.as_str().to_string()).or_default() += 1;
                }
            }
        }
        summary.total += cancelled;
        summary
    }

    /// Whether every scheduled problem completed and is valid.
    pub fn all_valid(&self) -> bool {
        self.invalid == 0 && self.cancelled == 0
    }
}
