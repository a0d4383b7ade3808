//! Docker-backed environments.
//!
//! Each environment is an ephemeral container started from the problem
//! toolchain image with networking disabled. The source repository is mounted
//! read-only at `/source` and cloned into `/repo` inside the container, where
//! all patch application and test execution happen.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::HarnessError;
use crate::git::{shell_quote, truncate, validate_git_ref, SourceRepo};

use super::{run_command, slug, EnvironmentBuilder, EnvironmentRequest, Sandbox, SandboxOutput};

/// Workspace root inside the container.
pub const CONTAINER_WORKDIR: &str = "/repo";
const CONTAINER_SOURCE: &str = "/source";

/// Builds one container per environment.
#[derive(Debug, Clone)]
pub struct DockerEnvironmentBuilder {
    repo: SourceRepo,
    image: String,
    memory: Option<String>,
    checkout_timeout: Duration,
}

impl DockerEnvironmentBuilder {
    pub fn new(repo: SourceRepo, image: impl Into<String>) -> Self {
        Self {
            repo,
            image: image.into(),
            memory: None,
            checkout_timeout: Duration::from_secs(600),
        }
    }

    /// Memory limit passed to `docker run --memory`.
    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }
}

#[async_trait]
impl EnvironmentBuilder for DockerEnvironmentBuilder {
    fn backend(&self) -> &'static str {
        "docker"
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
        validate_git_ref(&sha)?;

        let source = std::fs::canonicalize(self.repo.path()).map_err(|e| {
            HarnessError::EnvironmentBuildFailed(format!(
                "cannot resolve source repository {}: {e}",
                self.repo.path().display()
            ))
        })?;

        let container_name = format!(
            "hdlforge-{}-{}-{}",
            slug(&request.problem_id),
            slug(&request.purpose),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut sandbox = DockerSandbox::start(
            container_name,
            &self.image,
            &source,
            self.memory.as_deref(),
        )
        .await?;

        let checkout = sandbox
            .exec(&clone_script(&sha), None, self.checkout_timeout)
            .await;
        if !checkout.success() {
            sandbox.destroy().await;
            return Err(checkout_failed(truncate(checkout.combined().trim(), 500)));
        }

        tracing::debug!(
            container = %sandbox.container_name,
            image = %self.image,
            branch = %request.branch,
            "Docker sandbox ready"
        );
        Ok(Box::new(sandbox))
    }
}

/// Clone the mounted source into the workspace and detach at `sha`.
fn clone_script(sha: &str) -> String {
    let spec = shell_quote(&format!("{sha}^{{commit}}"));
    let sha = shell_quote(sha);
    format!(
        "set -e\n\
         git config --global --add safe.directory '*'\n\
         git clone --quiet --no-checkout {CONTAINER_SOURCE} {CONTAINER_WORKDIR} 2>&1\n\
         cd {CONTAINER_WORKDIR}\n\
         git cat-file -e {spec} 2>/dev/null || \
         git fetch --quiet --no-tags origin '+refs/remotes/*:refs/source-remotes/*' 2>&1\n\
         git -c advice.detachedHead=false checkout --quiet --detach {sha} 2>&1\n"
    )
}

/// An ephemeral container holding one workspace.
#[derive(Debug)]
pub struct DockerSandbox {
    container_name: String,
    destroyed: bool,
}

impl DockerSandbox {
    async fn start(
        container_name: String,
        image: &str,
        source: &Path,
        memory: Option<&str>,
    ) -> Result<Self, HarnessError> {
        let mount = format!("{}:{}:ro", source.display(), CONTAINER_SOURCE);
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            container_name.clone(),
            "--network=none".into(),
            "-v".into(),
            mount,
            "-w".into(),
            CONTAINER_WORKDIR.into(),
        ];
        if let Some(memory) = memory {
            args.push(format!("--memory={memory}"));
        }
        args.extend([image.to_string(), "sleep".into(), "7200".into()]);

        // `docker run` is driven to completion even if the caller goes away.
        // An abandoned sandbox is dropped inside the task and removes its
        // container there.
        let image = image.to_string();
        tokio::spawn(Self::launch(container_name, image, args))
            .await
            .map_err(|e| {
                HarnessError::EnvironmentBuildFailed(format!("container start task failed: {e}"))
            })?
    }

    async fn launch(
        container_name: String,
        image: String,
        args: Vec<String>,
    ) -> Result<Self, HarnessError> {
        // The container may exist even when `docker run` failed.
        let sandbox = Self {
            container_name,
            destroyed: false,
        };

        let run_output = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                HarnessError::EnvironmentBuildFailed(format!("failed to invoke docker: {e}"))
            })?;

        if !run_output.status.success() {
            return Err(HarnessError::EnvironmentBuildFailed(format!(
                "failed to start container '{}' from image '{}': {}",
                sandbox.container_name,
                image,
                truncate(String::from_utf8_lossy(&run_output.stderr).trim(), 500)
            )));
        }
        Ok(sandbox)
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &str {
        &self.container_name
    }

    async fn exec(&self, cmd: &str, stdin: Option<&[u8]>, timeout: Duration) -> SandboxOutput {
        let mut command = Command::new("docker");
        command.arg("exec");
        if stdin.is_some() {
            command.arg("-i");
        }
        command.args(["-w", CONTAINER_WORKDIR, &self.container_name, "bash", "-c", cmd]);
        run_command(command, stdin, timeout).await
    }

    async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Err(e) = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            tracing::warn!(container = %self.container_name, error = %e, "Failed to destroy container");
            return;
        }
        tracing::debug!(container = %self.container_name, "Docker sandbox destroyed");
    }
}

/// Remove the container if it was never destroyed explicitly.
impl Drop for DockerSandbox {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let name = std::mem::take(&mut self.container_name);
        let remove = move || {
            let _ = std::process::Command::new("docker")
                .args(["rm", "-f", &name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_script_quotes_commit() {
        let script = clone_script("0123abcd");
        assert!(script.contains("checkout --quiet --detach '0123abcd'"));
        assert!(script.contains("cat-file -e '0123abcd^{commit}'"));
        assert!(script.contains("git clone --quiet --no-checkout /source /repo"));
        assert!(script.starts_with("set -e"));
    }

    #[test]
    fn test_builder_options() {
        let builder = DockerEnvironmentBuilder::new(SourceRepo::new("/src"), "verilog-runner:latest")
            .with_memory("4g")
            .with_checkout_timeout(Duration::from_secs(30));
        assert_eq!(builder.image(), "verilog-runner:latest");
        assert_eq!(builder.memory.as_deref(), Some("4g"));
        assert_eq!(builder.backend(), "docker");
    }

    #[tokio::test]
    async fn test_start_with_bad_image_is_build_failure() {
        let err = DockerSandbox::start(
            "hdlforge-unit-bad-image".to_string(),
            "Not A Valid//Image",
            Path::new("/tmp"),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::EnvironmentBuildFailed(_)));
    }

    #[tokio::test]
    async fn test_drop_inside_runtime_does_not_block() {
        let sandbox = DockerSandbox {
            container_name: "hdlforge-unit-never-started".to_string(),
            destroyed: false,
        };
        let started = std::time::Instant::now();
        drop(sandbox);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_build_with_missing_repo_is_checkout_failure() {
        let builder = DockerEnvironmentBuilder::new(
            SourceRepo::new("/nonexistent/hdl-forge-source"),
            "verilog-runner:latest",
        );
        let request = EnvironmentRequest::new("fifo", "fifo_baseline", "unit");
        match builder.build(&request).await {
            Ok(_) => panic!("expected failure"),
            Err(e) => assert!(matches!(
                e,
                HarnessError::BranchCheckoutFailed { .. } | HarnessError::Io(_)
            )),
        }
    }
}
