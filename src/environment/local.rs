//! Host-local environments: one `git clone` per environment in a temporary
//! directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use crate::error::HarnessError;
use crate::git::{run_git, truncate, SourceRepo};

use super::{run_command, slug, EnvironmentBuilder, EnvironmentRequest, Sandbox, SandboxOutput};

/// Builds environments by cloning the source repository on the host.
///
/// Clones use `--no-hardlinks`, so nothing done in one workspace can reach the
/// source repository's object store or another workspace.
#[derive(Debug, Clone)]
pub struct LocalEnvironmentBuilder {
    repo: SourceRepo,
    scratch_dir: Option<PathBuf>,
    checkout_timeout: Duration,
}

impl LocalEnvironmentBuilder {
    pub fn new(repo: SourceRepo) -> Self {
        Self {
            repo,
            scratch_dir: None,
            checkout_timeout: Duration::from_secs(600),
        }
    }

    /// Create workspaces under `dir` instead of the system temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    fn temp_root(&self, request: &EnvironmentRequest) -> std::io::Result<TempDir> {
        let prefix = format!("hdlforge-{}-", slug(&request.problem_id));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.scratch_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }
}

#[async_trait]
impl EnvironmentBuilder for LocalEnvironmentBuilder {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn build(&self, request: &EnvironmentRequest) -> Result<Box<dyn Sandbox>, HarnessError> {
        let checkout_failed = |reason: String| HarnessError::BranchCheckoutFailed {
            branch: request.branch.clone(),
            reason,
        };

        let sha = self
            .repo
            .resolve(&request.branch)
            .await
            .map_err(|e| checkout_failed(e.to_string()))?;

        let root = self.temp_root(request).map_err(|e| {
            HarnessError::EnvironmentBuildFailed(format!("cannot create workspace directory: {e}"))
        })?;
        let workdir = root.path().join("repo");
        let source = self.repo.path().to_string_lossy().to_string();
        let dest = workdir.to_string_lossy().to_string();

        let clone = run_git(
            None,
            &["clone", "--quiet", "--no-hardlinks", "--no-checkout", &source, &dest],
            self.checkout_timeout,
        )
        .await?;
        if !clone.success() {
            return Err(HarnessError::EnvironmentBuildFailed(format!(
                "git clone of {} failed: {}",
                source,
                truncate(clone.stderr.trim(), 500)
            )));
        }

        ensure_commit(&workdir, &sha, self.checkout_timeout)
            .await
            .map_err(checkout_failed)?;

        let checkout = run_git(
            Some(&workdir),
            &["-c", "advice.detachedHead=false", "checkout", "--quiet", "--detach", &sha],
            self.checkout_timeout,
        )
        .await?;
        if !checkout.success() {
            return Err(checkout_failed(truncate(checkout.stderr.trim(), 500)));
        }

        let name = root
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dest.clone());

        Ok(Box::new(LocalSandbox {
            name,
            workdir,
            root: Some(root),
        }))
    }
}

/// Make `sha` available in the clone.
///
/// A plain clone only carries the source's local branches; commits reachable
/// only from its remote-tracking refs are fetched explicitly.
async fn ensure_commit(workdir: &Path, sha: &str, timeout: Duration) -> Result<(), String> {
    let spec = format!("{sha}^{{commit}}");
    let present = run_git(Some(workdir), &["cat-file", "-e", &spec], timeout)
        .await
        .map_err(|e| e.to_string())?;
    if present.success() {
        return Ok(());
    }

    let fetch = run_git(
        Some(workdir),
        &[
            "fetch",
            "--quiet",
            "--no-tags",
            "origin",
            "+refs/remotes/*:refs/source-remotes/*",
        ],
        timeout,
    )
    .await
    .map_err(|e| e.to_string())?;
    if !fetch.success() {
        return Err(truncate(fetch.stderr.trim(), 500));
    }

    let present = run_git(Some(workdir), &["cat-file", "-e", &spec], timeout)
        .await
        .map_err(|e| e.to_string())?;
    if present.success() {
        Ok(())
    } else {
        Err(format!("commit {sha} is not reachable from the source repository's refs"))
    }
}

/// A workspace in a host temporary directory.
#[derive(Debug)]
pub struct LocalSandbox {
    name: String,
    workdir: PathBuf,
    root: Option<TempDir>,
}

impl LocalSandbox {
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exec(&self, cmd: &str, stdin: Option<&[u8]>, timeout: Duration) -> SandboxOutput {
        if self.root.is_none() {
            return SandboxOutput {
                stderr: format!("Sandbox '{}' has been destroyed", self.name),
                exit_code: -1,
                ..Default::default()
            };
        }
        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0");
        run_command(command, stdin, timeout).await
    }

    async fn destroy(&mut self) {
        let Some(root) = self.root.take() else {
            return;
        };
        let name = self.name.clone();
        match tokio::task::spawn_blocking(move || root.close()).await {
            Ok(Ok(())) => tracing::debug!(environment = %name, "Local sandbox removed"),
            Ok(Err(e)) => {
                tracing::warn!(environment = %name, error = %e, "Failed to remove local sandbox")
            }
            Err(e) => {
                tracing::warn!(environment = %name, error = %e, "Local sandbox cleanup task failed")
            }
        }
    }
}
