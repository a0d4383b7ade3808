//! Isolated workspaces rooted at one checked-out branch.
//!
//! An [`EnvironmentBuilder`] materializes a [`Sandbox`]: a private copy of the
//! source tree at a branch plus a way to run shell commands inside it. The
//! [`Environment`] wrapper ties a sandbox to an [`EnvironmentLease`] so the
//! owner can account for every workspace it created.
//!
//! Two backends exist:
//! - [`local::LocalEnvironmentBuilder`]: a `git clone` into a temporary
//!   directory on the host.
//! - [`docker::DockerEnvironmentBuilder`]: one container per environment.

pub mod docker;
pub mod local;
pub mod tracker;

pub use docker::{DockerEnvironmentBuilder, DockerSandbox};
pub use local::{LocalEnvironmentBuilder, LocalSandbox};
pub use tracker::{EnvironmentLease, EnvironmentTracker, TrackerSnapshot};

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::HarnessError;
use crate::git::shell_quote;

/// Shell command output from inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, or -1 when it could not be spawned or timed out.
    pub exit_code: i32,
    pub timed_out: bool,
}

impl SandboxOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, for error messages.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// A live, private workspace.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Identifier used in logs (directory or container name).
    fn name(&self) -> &str;

    /// Run `cmd` with `bash -c` from the workspace root.
    async fn exec(&self, cmd: &str, stdin: Option<&[u8]>, timeout: Duration) -> SandboxOutput;

    /// Release every resource held by the sandbox. Idempotent.
    async fn destroy(&mut self);
}

/// What to build: a problem's branch, for one purpose (usually a check).
#[derive(Debug, Clone)]
pub struct EnvironmentRequest {
    pub problem_id: String,
    pub branch: String,
    pub purpose: String,
}

impl EnvironmentRequest {
    pub fn new(
        problem_id: impl Into<String>,
        branch: impl Into<String>,
        purpose: impl Into<String>,
    ) -> Self {
        Self {
            problem_id: problem_id.into(),
            branch: branch.into(),
            purpose: purpose.into(),
        }
    }
}

/// Materializes fresh sandboxes. Each call returns a workspace that shares no
/// mutable state with any other.
#[async_trait]
pub trait EnvironmentBuilder: Send + Sync {
    /// Short backend name for logs and reports.
    fn backend(&self) -> &'static str;

    /// Build a sandbox checked out at `request.branch`.
    ///
    /// Fails with [`HarnessError::BranchCheckoutFailed`] when the branch cannot
    /// be resolved or checked out.
    async fn build(&self, request: &EnvironmentRequest) -> Result<Box<dyn Sandbox>, HarnessError>;
}

/// A sandbox owned by exactly one grading attempt.
///
/// Dropping an environment releases its sandbox through the sandbox's own
/// `Drop`; [`Environment::teardown`] does the same asynchronously.
pub struct Environment {
    branch: String,
    sandbox: Box<dyn Sandbox>,
    // Declared last so it is released after the sandbox.
    _lease: EnvironmentLease,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.sandbox.name())
            .field("branch", &self.branch)
            .finish()
    }
}

impl Environment {
    /// Build a new environment and register it with `tracker`.
    ///
    /// The environment counts as live from the moment the build starts, so a
    /// build interrupted by cancellation is accounted for as well.
    pub async fn materialize(
        builder: &dyn EnvironmentBuilder,
        tracker: &EnvironmentTracker,
        request: &EnvironmentRequest,
    ) -> Result<Self, HarnessError> {
        let lease = tracker.lease();
        let sandbox = builder.build(request).await?;
        tracing::debug!(
            problem_id = %request.problem_id,
            branch = %request.branch,
            purpose = %request.purpose,
            environment = sandbox.name(),
            backend = builder.backend(),
            "Environment ready"
        );
        Ok(Self {
            branch: request.branch.clone(),
            sandbox,
            _lease: lease,
        })
    }

    pub fn name(&self) -> &str {
        self.sandbox.name()
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub async fn exec(&self, cmd: &str, timeout: Duration) -> SandboxOutput {
        self.sandbox.exec(cmd, None, timeout).await
    }

    pub async fn exec_with_input(&self, cmd: &str, input: &[u8], timeout: Duration) -> SandboxOutput {
        self.sandbox.exec(cmd, Some(input), timeout).await
    }

    /// Whether a workspace-relative regular file exists.
    pub async fn file_exists(&self, path: &str) -> bool {
        let cmd = format!("test -f {}", shell_quote(path));
        self.exec(&cmd, Duration::from_secs(30)).await.success()
    }

    /// Destroy the sandbox and release the lease.
    pub async fn teardown(mut self) {
        self.sandbox.destroy().await;
        tracing::debug!(environment = self.sandbox.name(), "Environment torn down");
    }
}

/// Spawn `cmd`, feed it `stdin`, and collect its output within `timeout`.
///
/// The child runs in its own process group. The whole group is killed when
/// the command returns, when the timeout fires, or when the future is
/// dropped, so nothing the command forked outlives the call.
pub(crate) async fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> SandboxOutput {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let input = stdin.map(<[u8]>::to_vec);
    let run = async move {
        let mut child = cmd.spawn()?;
        let _group = ProcessGroup::of(&child);
        if let (Some(input), Some(mut pipe)) = (input, child.stdin.take()) {
            // Written concurrently so a chatty child cannot deadlock on a full
            // stdout pipe while stdin is still being fed.
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    tracing::debug!(error = %e, "Failed to write sandbox stdin");
                }
            });
        }
        child.wait_with_output().await
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) => SandboxOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
        },
        Ok(Err(e)) => SandboxOutput {
            stdout: String::new(),
            stderr: format!("Process error: {e}"),
            exit_code: -1,
            timed_out: false,
        },
        Err(_) => SandboxOutput {
            stdout: String::new(),
            stderr: format!("Command timed out after {}s", timeout.as_secs()),
            exit_code: -1,
            timed_out: true,
        },
    }
}

/// Kills a child's process group on drop.
#[cfg_attr(not(unix), allow(dead_code))]
struct ProcessGroup(Option<i32>);

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self(child.id().and_then(|pid| i32::try_from(pid).ok()))
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.0 {
            // SAFETY: kill(2) takes plain integers and touches no memory.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}

/// Lowercase alphanumeric slug for directory and container names.
pub(crate) fn slug(s: &str) -> String {
    let slug: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "env".to_string()
    } else {
        slug.chars().take(40).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeSandbox {
        destroyed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn name(&self) -> &str {
            "fake"
        }

        async fn exec(&self, cmd: &str, _stdin: Option<&[u8]>, _timeout: Duration) -> SandboxOutput {
            SandboxOutput {
                stdout: cmd.to_string(),
                exit_code: if cmd.starts_with("test -f") { 1 } else { 0 },
                ..Default::default()
            }
        }

        async fn destroy(&mut self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeBuilder {
        destroyed: Arc<AtomicBool>,
        fail: bool,
    }

    #[async_trait]
    impl EnvironmentBuilder for FakeBuilder {
        fn backend(&self) -> &'static str {
            "fake"
        }

        async fn build(&self, request: &EnvironmentRequest) -> Result<Box<dyn Sandbox>, HarnessError> {
            if self.fail {
                return Err(HarnessError::BranchCheckoutFailed {
                    branch: request.branch.clone(),
                    reason: "missing".to_string(),
                });
            }
            Ok(Box::new(FakeSandbox {
                destroyed: Arc::clone(&self.destroyed),
            }))
        }
    }

    #[tokio::test]
    async fn test_materialize_and_teardown_accounting() {
        let destroyed = Arc::new(AtomicBool::new(false));
        let builder = FakeBuilder {
            destroyed: Arc::clone(&destroyed),
            fail: false,
        };
        let tracker = EnvironmentTracker::new();
        let request = EnvironmentRequest::new("fifo", "fifo_baseline", "baseline-compiles");

        let env = Environment::materialize(&builder, &tracker, &request)
            .await
            .unwrap();
        assert_eq!(tracker.live(), 1);
        assert_eq!(env.branch(), "fifo_baseline");
        assert!(!env.file_exists("tests/test_fifo.py").await);

        env.teardown().await;
        assert!(destroyed.load(Ordering::SeqCst));
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.snapshot().torn_down, 1);
    }

    #[tokio::test]
    async fn test_failed_build_releases_lease() {
        let builder = FakeBuilder {
            destroyed: Arc::new(AtomicBool::new(false)),
            fail: true,
        };
        let tracker = EnvironmentTracker::new();
        let request = EnvironmentRequest::new("fifo", "nope", "baseline-compiles");
        let err = Environment::materialize(&builder, &tracker, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::BranchCheckoutFailed { .. }));
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.snapshot().created, 1);
    }

    #[tokio::test]
    async fn test_run_command_captures_output_and_stdin() {
        let mut cmd = Command::new("cat");
        cmd.arg("-");
        let out = run_command(cmd, Some(b"hello"), Duration::from_secs(10)).await;
        if out.exit_code == -1 {
            // cat unavailable
            return;
        }
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let out = run_command(cmd, None, Duration::from_millis(100)).await;
        assert_eq!(out.exit_code, -1);
        if out.timed_out {
            assert!(out.stderr.contains("timed out"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_timeout_kills_forked_processes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(format!(
            "(sleep 1; touch {}) & wait",
            shell_quote(&marker.to_string_lossy())
        ));
        let out = run_command(cmd, None, Duration::from_millis(200)).await;
        assert!(out.timed_out);

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!marker.exists(), "forked process outlived the timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_run_command_kills_forked_processes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(format!(
            "(sleep 1; touch {}) & wait",
            shell_quote(&marker.to_string_lossy())
        ));
        let pending = run_command(cmd, None, Duration::from_secs(30));
        let finished = tokio::time::timeout(Duration::from_millis(200), pending).await;
        assert!(finished.is_err());

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!marker.exists(), "forked process outlived the dropped command");
    }

    #[test]
    fn test_combined_output() {
        let out = SandboxOutput {
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
            exit_code: 1,
            timed_out: false,
        };
        assert_eq!(out.combined(), "out\nerr");
        assert_eq!(SandboxOutput::default().combined(), "");
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Async_FIFO v2"), "async-fifo-v2");
        assert_eq!(slug("___"), "env");
        assert_eq!(slug(&"x".repeat(100)).len(), 40);
    }
}
