//! The six validation checks and their outcomes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, HarnessError};
use crate::patch::PatchRole;

/// A validation check, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    BaselineCompiles,
    TestPatchApplies,
    TestsFailOnBaseline,
    GoldenPatchApplies,
    GoldenCompiles,
    TestsPassOnGolden,
}

impl CheckKind {
    pub const ALL: [CheckKind; 6] = [
        Self::BaselineCompiles,
        Self::TestPatchApplies,
        Self::TestsFailOnBaseline,
        Self::GoldenPatchApplies,
        Self::GoldenCompiles,
        Self::TestsPassOnGolden,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BaselineCompiles => "baseline-compiles",
            Self::TestPatchApplies => "test-patch-applies",
            Self::TestsFailOnBaseline => "tests-fail-on-baseline",
            Self::GoldenPatchApplies => "golden-patch-applies",
            Self::GoldenCompiles => "golden-compiles",
            Self::TestsPassOnGolden => "tests-pass-on-golden",
        }
    }

    /// CamelCase name used for JUnit test cases.
    pub fn junit_name(&self) -> &'static str {
        match self {
            Self::BaselineCompiles => "testBaselineCompiles",
            Self::TestPatchApplies => "testTestPatchApplies",
            Self::TestsFailOnBaseline => "testTestsFailOnBaseline",
            Self::GoldenPatchApplies => "testGoldenPatchApplies",
            Self::GoldenCompiles => "testGoldenCompiles",
            Self::TestsPassOnGolden => "testTestsPassOnGolden",
        }
    }

    /// What the check needs and does.
    pub fn plan(&self) -> CheckPlan {
        use CheckAction::*;
        use Expectation::*;
        let (patches, action): (&'static [PatchRole], CheckAction) = match self {
            Self::BaselineCompiles => (&[], CompileAndRunVisibleTests),
            Self::TestPatchApplies => (&[PatchRole::Test], ApplyOnly),
            Self::TestsFailOnBaseline => (&[PatchRole::Test], RunHiddenTests(AtLeastOneFailure)),
            Self::GoldenPatchApplies => (&[PatchRole::Golden], ApplyOnly),
            Self::GoldenCompiles => (&[PatchRole::Golden], Compile),
            Self::TestsPassOnGolden => (
                &[PatchRole::Golden, PatchRole::Test],
                RunHiddenTests(AllPass),
            ),
        };
        CheckPlan { patches, action }
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected hidden-test verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    AtLeastOneFailure,
    AllPass,
}

/// What a check does after its patches are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckAction {
    /// Nothing: applying the patches is the check.
    ApplyOnly,
    /// Build the project.
    Compile,
    /// Build, then run the problem's non-hidden tests if it declares any.
    CompileAndRunVisibleTests,
    /// Run the hidden tests and compare with the expectation.
    RunHiddenTests(Expectation),
}

/// Declared dependencies of a check. Every check starts from a fresh
/// baseline environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckPlan {
    /// Patches applied in order.
    pub patches: &'static [PatchRole],
    pub action: CheckAction,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CheckOutcome {
    /// Executed and produced the expected verdict.
    Pass,
    /// Executed and produced the wrong verdict.
    Fail { reason: String },
    /// Could not be executed.
    Error { kind: ErrorKind, reason: String },
}

impl CheckOutcome {
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }

    pub fn error(err: &HarnessError) -> Self {
        Self::Error {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Pass => None,
            Self::Fail { reason } | Self::Error { reason, .. } => Some(reason),
        }
    }

    /// `pass`, `fail` or `error(<kind>)`.
    pub fn label(&self) -> String {
        match self {
            Self::Pass => "pass".to_string(),
            Self::Fail { .. } => "fail".to_string(),
            Self::Error { kind, .. } => format!("error({kind})"),
        }
    }
}

impl std::fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {}", self.label(), reason),
            None => f.write_str(&self.label()),
        }
    }
}

/// A recorded check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    #[serde(flatten)]
    pub outcome: CheckOutcome,
    #[serde(with = "duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    /// Environment the check ran in, if one was built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl CheckResult {
    pub fn new(check: CheckKind, outcome: CheckOutcome) -> Self {
        Self {
            check,
            outcome,
            duration: Duration::ZERO,
            environment: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_environment(mut self, name: impl Into<String>) -> Self {
        self.environment = Some(name.into());
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
