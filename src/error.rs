//! Error types for hdl-forge operations.
//!
//! Defines the error taxonomy shared by the grading pipeline:
//! - Registry loading and invariant checks
//! - Patch generation and application
//! - Environment materialization
//! - Test execution and result parsing
//!
//! Harness errors are never allowed to abort a sibling problem. The validator
//! converts every [`HarnessError`] into a check outcome carrying an
//! [`ErrorKind`], so reports stay machine readable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while grading or validating a single problem.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Reference '{reference}' not found in repository {repo}")]
    ReferenceNotFound { reference: String, repo: String },

    #[error("Failed to generate patch {source_ref}..{target_ref}: {reason}")]
    PatchGenerationFailed {
        source_ref: String,
        target_ref: String,
        reason: String,
    },

    #[error("Patch {patch} failed to apply: {reason}")]
    PatchApplicationFailed { patch: String, reason: String },

    #[error("Failed to check out branch '{branch}': {reason}")]
    BranchCheckoutFailed { branch: String, reason: String },

    #[error("Environment could not be built: {0}")]
    EnvironmentBuildFailed(String),

    #[error("Test runner executed no tests (files: {files})")]
    NoTestsExecuted { files: String },

    #[error("Test runner output could not be parsed: {0}")]
    UnparseableTestOutput(String),

    #[error("Hidden test file '{0}' does not exist in the workspace")]
    MissingTestFile(String),

    #[error("Toolchain invocation failed: {0}")]
    ToolchainFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Stable machine-readable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ReferenceNotFound { .. } => ErrorKind::ReferenceNotFound,
            Self::PatchGenerationFailed { .. } => ErrorKind::PatchGenerationFailed,
            Self::PatchApplicationFailed { .. } => ErrorKind::PatchApplicationFailed,
            Self::BranchCheckoutFailed { .. } => ErrorKind::BranchCheckoutFailed,
            Self::EnvironmentBuildFailed(_) => ErrorKind::EnvironmentBuildFailed,
            Self::NoTestsExecuted { .. } => ErrorKind::NoTestsExecuted,
            Self::UnparseableTestOutput(_) => ErrorKind::UnparseableTestOutput,
            Self::MissingTestFile(_) => ErrorKind::MissingTestFile,
            Self::ToolchainFailed(_) => ErrorKind::ToolchainFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidInput(_) | Self::Internal(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Classification attached to `error` check outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ReferenceNotFound,
    PatchGenerationFailed,
    PatchApplicationFailed,
    BranchCheckoutFailed,
    EnvironmentBuildFailed,
    NoTestsExecuted,
    UnparseableTestOutput,
    MissingTestFile,
    ToolchainFailed,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether the error comes from the infrastructure rather than the task
    /// definition. Infrastructure errors are eligible for scheduler retries.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::BranchCheckoutFailed | Self::EnvironmentBuildFailed | Self::Internal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReferenceNotFound => "reference-not-found",
            Self::PatchGenerationFailed => "patch-generation-failed",
            Self::PatchApplicationFailed => "patch-application-failed",
            Self::BranchCheckoutFailed => "branch-checkout-failed",
            Self::EnvironmentBuildFailed => "environment-build-failed",
            Self::NoTestsExecuted => "no-tests-executed",
            Self::UnparseableTestOutput => "unparseable-test-output",
            Self::MissingTestFile => "missing-test-file",
            Self::ToolchainFailed => "toolchain-failed",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while building or loading the problem registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Problem '{0}' not found in registry")]
    ProblemNotFound(String),

    #[error("Problem '{0}' is registered more than once")]
    DuplicateProblem(String),

    #[error("Invalid problem '{id}': {reason}")]
    InvalidProblem { id: String, reason: String },

    #[error("Failed to read registry file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err = HarnessError::PatchApplicationFailed {
            patch: "base..test".to_string(),
            reason: "conflict".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::PatchApplicationFailed);
        assert_eq!(err.kind().as_str(), "patch-application-failed");

        let err = HarnessError::NoTestsExecuted {
            files: "tests/test_fifo.py".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::NoTestsExecuted);
        assert!(err.to_string().contains("tests/test_fifo.py"));
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::BranchCheckoutFailed).unwrap();
        assert_eq!(json, "\"branch-checkout-failed\"");
        let back: ErrorKind = serde_json::from_str("\"no-tests-executed\"").unwrap();
        assert_eq!(back, ErrorKind::NoTestsExecuted);
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(ErrorKind::BranchCheckoutFailed.is_infrastructure());
        assert!(ErrorKind::EnvironmentBuildFailed.is_infrastructure());
        assert!(!ErrorKind::PatchApplicationFailed.is_infrastructure());
        assert!(!ErrorKind::NoTestsExecuted.is_infrastructure());
        assert!(!ErrorKind::ReferenceNotFound.is_infrastructure());
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::DuplicateProblem("async_fifo".to_string());
        assert!(err.to_string().contains("async_fifo"));

        let err = RegistryError::InvalidProblem {
            id: "x".to_string(),
            reason: "test_files is empty".to_string(),
        };
        assert!(err.to_string().contains("test_files is empty"));
    }
}
