use serde::{Deserialize, Serialize};

use crate::git::{validate_file_path, validate_git_ref};

/// Difficulty of a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Medium => write!(f, "medium"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// Levels of human review a problem has gone through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewLevel {
    #[default]
    NoReview,
    CreatorReviewed,
    HudApproved,
    CustomerApproved,
}

impl ReviewLevel {
    pub const ALL: [ReviewLevel; 4] = [
        Self::NoReview,
        Self::CreatorReviewed,
        Self::HudApproved,
        Self::CustomerApproved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoReview => "no-review",
            Self::CreatorReviewed => "creator-reviewed",
            Self::HudApproved => "hud-approved",
            Self::CustomerApproved => "customer-approved",
        }
    }
}

impl std::str::FromStr for ReviewLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == s || level.as_str().replace('-', "_") == s)
            .ok_or_else(|| {
                format!(
                    "unknown review level '{}': expected one of no-review, creator-reviewed, hud-approved, customer-approved",
                    s
                )
            })
    }
}

/// Whether a hint is fair to give or leaks the solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HintType {
    Legit,
    Leaky,
}

/// A hint that can be appended to the problem statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintSpec {
    pub hint_type: HintType,
    /// Text shown to the model.
    pub text: String,
    /// Why the hint is legitimate, for human reviewers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_legitimate: Option<String>,
}

/// One task definition: a description plus a baseline/test/golden branch triad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemSpec {
    /// Unique, stable key.
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    /// Unsolved starting state.
    #[serde(alias = "base")]
    pub baseline: String,
    /// Baseline plus the hidden tests.
    pub test: String,
    /// Reference solution, without tests.
    pub golden: String,
    /// Hidden test files, relative to the repository root.
    pub test_files: Vec<String>,
    /// Non-hidden tests that already exist on the baseline branch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub baseline_test_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<HintSpec>,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub review_level: ReviewLevel,
    #[serde(default)]
    pub demo: bool,
    #[serde(default)]
    pub too_hard: bool,
}

fn default_task_type() -> String {
    "coding".to_string()
}

impl ProblemSpec {
    /// Create a problem with default metadata.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        baseline: impl Into<String>,
        test: impl Into<String>,
        golden: impl Into<String>,
        test_files: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            difficulty: Difficulty::default(),
            baseline: baseline.into(),
            test: test.into(),
            golden: golden.into(),
            test_files,
            baseline_test_files: Vec::new(),
            hints: Vec::new(),
            task_type: default_task_type(),
            review_level: ReviewLevel::default(),
            demo: false,
            too_hard: false,
        }
    }

    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_baseline_test_files(mut self, files: Vec<String>) -> Self {
        self.baseline_test_files = files;
        self
    }

    pub fn with_hints(mut self, hints: Vec<HintSpec>) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_review_level(mut self, level: ReviewLevel) -> Self {
        self.review_level = level;
        self
    }

    /// Check the structural invariants of the definition.
    ///
    /// Returns a human-readable reason for the first violation found.
    pub fn check(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("id is empty".to_string());
        }
        for (role, branch) in [
            ("baseline", &self.baseline),
            ("test", &self.test),
            ("golden", &self.golden),
        ] {
            if branch.trim().is_empty() {
                return Err(format!("{role} branch is empty"));
            }
            validate_git_ref(branch).map_err(|e| format!("{role} branch: {e}"))?;
        }
        if self.baseline == self.test || self.baseline == self.golden || self.test == self.golden
        {
            return Err(format!(
                "branch names must be distinct (baseline={}, test={}, golden={})",
                self.baseline, self.test, self.golden
            ));
        }
        if self.test_files.is_empty() {
            return Err("test_files is empty".to_string());
        }
        for path in self.test_files.iter().chain(&self.baseline_test_files) {
            validate_file_path(path).map_err(|e| format!("test file: {e}"))?;
        }
        Ok(())
    }
}
