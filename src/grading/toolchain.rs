//! Build and test toolchain invoked inside an environment.

use std::time::Duration;

use async_trait::async_trait;

use crate::environment::Environment;
use crate::error::HarnessError;
use crate::git::{shell_quote, truncate, validate_file_path};

use super::results::TestResults;

/// Placeholder for the space-separated, quoted test file list.
pub const FILES_PLACEHOLDER: &str = "{files}";
/// Placeholder for the workspace-relative path of the JSON-lines report.
pub const REPORT_PLACEHOLDER: &str = "{report}";
/// Where `{report}` points, relative to the workspace root.
pub const REPORT_PATH: &str = ".hdlforge/results.jsonl";

pub const DEFAULT_BUILD_COMMAND: &str = "true";
pub const DEFAULT_TEST_COMMAND: &str =
    "uv run --no-sync pytest -p no:cacheprovider --report-log={report} {files}";

/// Result of a build.
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub success: bool,
    pub exit_code: i32,
    /// Combined build output, truncated.
    pub log: String,
}

/// Result of one test-runner invocation.
#[derive(Debug, Clone)]
pub struct TestRun {
    pub results: TestResults,
    pub exit_code: i32,
    /// Runner console output, truncated.
    pub log: String,
}

/// The project's build and test commands.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Build the project in the environment's workspace.
    ///
    /// A build that runs and fails is `Ok` with `success == false`; an error
    /// means the build could not be run at all.
    async fn compile(&self, env: &Environment) -> Result<CompileOutcome, HarnessError>;

    /// Run exactly `files` and return the structured results.
    async fn run_tests(&self, env: &Environment, files: &[String]) -> Result<TestRun, HarnessError>;
}

/// Toolchain driven by two shell command templates.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    build_command: String,
    test_command: String,
    build_timeout: Duration,
    test_timeout: Duration,
}

impl Default for CommandToolchain {
    fn default() -> Self {
        Self {
            build_command: DEFAULT_BUILD_COMMAND.to_string(),
            test_command: DEFAULT_TEST_COMMAND.to_string(),
            build_timeout: Duration::from_secs(1500),
            test_timeout: Duration::from_secs(1800),
        }
    }
}

impl CommandToolchain {
    pub fn new(build_command: impl Into<String>, test_command: impl Into<String>) -> Self {
        Self {
            build_command: build_command.into(),
            test_command: test_command.into(),
            ..Default::default()
        }
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    pub fn build_command(&self) -> &str {
        &self.build_command
    }

    pub fn test_command(&self) -> &str {
        &self.test_command
    }

    fn uses_report_file(&self) -> bool {
        self.test_command.contains(REPORT_PLACEHOLDER)
    }

    /// Expand the test command template for `files`.
    pub fn render_test_command(&self, files: &[String]) -> Result<String, HarnessError> {
        for file in files {
            validate_file_path(file)?;
        }
        let quoted: Vec<String> = files.iter().map(|f| shell_quote(f)).collect();
        let command = self
            .test_command
            .replace(FILES_PLACEHOLDER, &quoted.join(" "))
            .replace(REPORT_PLACEHOLDER, REPORT_PATH);
        if self.uses_report_file() {
            Ok(format!(
                "mkdir -p .hdlforge && rm -f {REPORT_PATH} && {command}"
            ))
        } else {
            Ok(command)
        }
    }
}

#[async_trait]
impl Toolchain for CommandToolchain {
    async fn compile(&self, env: &Environment) -> Result<CompileOutcome, HarnessError> {
        let out = env.exec(&self.build_command, self.build_timeout).await;
        if out.timed_out {
            return Err(HarnessError::ToolchainFailed(format!(
                "build timed out after {}s",
                self.build_timeout.as_secs()
            )));
        }
        tracing::debug!(
            environment = env.name(),
            exit_code = out.exit_code,
            "Build finished"
        );
        Ok(CompileOutcome {
            success: out.success(),
            exit_code: out.exit_code,
            log: truncate(&out.combined(), 4000),
        })
    }

    async fn run_tests(&self, env: &Environment, files: &[String]) -> Result<TestRun, HarnessError> {
        let command = self.render_test_command(files)?;
        let out = env.exec(&command, self.test_timeout).await;
        if out.timed_out {
            return Err(HarnessError::ToolchainFailed(format!(
                "test run timed out after {}s",
                self.test_timeout.as_secs()
            )));
        }
        if out.exit_code == -1 && out.stdout.is_empty() {
            return Err(HarnessError::ToolchainFailed(truncate(out.stderr.trim(), 500)));
        }

        let stream = if self.uses_report_file() {
            let report = env
                .exec(
                    &format!("cat {REPORT_PATH} 2>/dev/null || true"),
                    Duration::from_secs(60),
                )
                .await;
            report.stdout
        } else {
            out.stdout.clone()
        };

        let results = TestResults::parse(&stream)?;
        tracing::debug!(
            environment = env.name(),
            exit_code = out.exit_code,
            summary = %results.summary_line(),
            "Test run finished"
        );
        Ok(TestRun {
            results,
            exit_code: out.exit_code,
            log: truncate(&out.combined(), 4000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_test_command_with_report() {
        let toolchain = CommandToolchain::default();
        let cmd = toolchain
            .render_test_command(&["tests/test_fifo.py".to_string(), "tests/test_ptr.py".to_string()])
            .unwrap();
        assert!(cmd.starts_with("mkdir -p .hdlforge && rm -f .hdlforge/results.jsonl && "));
        assert!(cmd.contains("--report-log=.hdlforge/results.jsonl"));
        assert!(cmd.ends_with("'tests/test_fifo.py' 'tests/test_ptr.py'"));
    }

    #[test]
    fn test_render_test_command_stdout_mode() {
        let toolchain = CommandToolchain::new("make", "./run_tests.sh {files}");
        let cmd = toolchain
            .render_test_command(&["tests/a.py".to_string()])
            .unwrap();
        assert_eq!(cmd, "./run_tests.sh 'tests/a.py'");
    }

    #[test]
    fn test_render_rejects_unsafe_paths() {
        let toolchain = CommandToolchain::default();
        let err = toolchain
            .render_test_command(&["tests/$(rm).py".to_string()])
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidInput(_)));
    }

    #[test]
    fn test_defaults() {
        let toolchain = CommandToolchain::default()
            .with_build_timeout(Duration::from_secs(5))
            .with_test_timeout(Duration::from_secs(6));
        assert_eq!(toolchain.build_command(), "true");
        assert!(toolchain.test_command().contains("pytest"));
        assert_eq!(toolchain.build_timeout, Duration::from_secs(5));
        assert_eq!(toolchain.test_timeout, Duration::from_secs(6));
    }
}
