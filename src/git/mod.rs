//! Read-only access to the source repository.
//!
//! Every git invocation goes through [`SourceRepo`], which shells out to the
//! `git` binary with `tokio::process`. Nothing in this module mutates the
//! repository: refs are resolved with `rev-parse` and diffs are computed
//! between commits, never through the working tree.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::HarnessError;

/// Default timeout for a single git invocation on the host.
const GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Validate a git ref (commit SHA, branch name) before handing it to git.
///
/// Refs only ever travel as argv elements, so the rules are git's own
/// `check-ref-format` rules plus two of ours: no leading `-` (it would parse
/// as a flag) and no `..` (it would parse as a range).
pub fn validate_git_ref(s: &str) -> Result<(), HarnessError> {
    let invalid = |reason: String| HarnessError::InvalidInput(reason);
    if s.is_empty() {
        return Err(invalid("git ref is empty".to_string()));
    }
    if s.len() > 256 {
        return Err(invalid(format!(
            "git ref too long ({} chars, max 256)",
            s.len()
        )));
    }
    if s.starts_with('-') {
        return Err(invalid(format!(
            "git ref '{}' must not start with '-' (could be interpreted as a flag)",
            s
        )));
    }
    if s.contains("..") {
        return Err(invalid(format!("git ref '{}' must not contain '..'", s)));
    }
    if s == "@" || s.contains("@{") {
        return Err(invalid(format!("git ref '{}' must not contain '@{{'", s)));
    }
    for ch in s.chars() {
        if ch.is_ascii_control() || matches!(ch, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
            return Err(invalid(format!(
                "invalid character {:?} in git ref '{}'",
                ch, s
            )));
        }
    }
    if s.ends_with('/') || s.ends_with('.') || s.ends_with(".lock") {
        return Err(invalid(format!(
            "git ref '{}' must not end with '/', '.' or '.lock'",
            s
        )));
    }
    if s
        .split('/')
        .any(|part| part.is_empty() || part.starts_with('.') || part.ends_with(".lock"))
    {
        return Err(invalid(format!(
            "git ref '{}' has an empty, hidden or '.lock' path component",
            s
        )));
    }
    Ok(())
}

/// Validate a workspace-relative file path that will be interpolated into
/// shell commands.
///
/// Rejects quotes, shell metacharacters, null bytes, absolute paths and `..`
/// traversal.
pub fn validate_file_path(path: &str) -> Result<(), HarnessError> {
    let invalid = |reason: String| HarnessError::InvalidInput(reason);
    if path.is_empty() {
        return Err(invalid("file path is empty".to_string()));
    }
    if path.len() > 4096 {
        return Err(invalid(format!(
            "file path too long ({} chars, max 4096)",
            path.len()
        )));
    }
    if path.contains('\0') {
        return Err(invalid("file path contains null byte".to_string()));
    }
    if path.split('/').any(|part| part == "..") {
        return Err(invalid(format!(
            "file path '{}' contains '..' (path traversal not allowed)",
            path
        )));
    }
    if path.starts_with('/') {
        return Err(invalid(format!(
            "file path '{}' must be relative (no leading '/')",
            path
        )));
    }
    for ch in path.chars() {
        if matches!(
            ch,
            '\'' | '"' | '`' | '$' | '!' | '&' | '|' | ';' | '(' | ')' | '<' | '>' | '\\' | '\n'
                | '\r'
                | '*'
                | '?'
        ) {
            return Err(invalid(format!(
                "invalid character '{}' in file path '{}'",
                ch, path
            )));
        }
    }
    Ok(())
}

/// Quote a value for safe interpolation into a `bash -c` command line.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Output of a git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Handle on the repository that holds every problem's branch triad.
#[derive(Debug, Clone)]
pub struct SourceRepo {
    path: PathBuf,
}

impl SourceRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `git -C <repo> <args>` and capture its output.
    pub async fn git(&self, args: &[&str]) -> Result<GitOutput, HarnessError> {
        run_git(Some(&self.path), args, GIT_TIMEOUT).await
    }

    /// Resolve a branch name to a commit SHA.
    ///
    /// Local branches win; remote-tracking `origin/<branch>` refs are the
    /// fallback, since problem branches are usually fetched rather than
    /// checked out.
    pub async fn resolve(&self, branch: &str) -> Result<String, HarnessError> {
        validate_git_ref(branch)?;

        let candidates = [
            format!("refs/heads/{branch}^{{commit}}"),
            format!("refs/remotes/origin/{branch}^{{commit}}"),
            format!("{branch}^{{commit}}"),
        ];
        for candidate in &candidates {
            let out = self
                .git(&["rev-parse", "--verify", "--quiet", candidate])
                .await?;
            if out.success() {
                let sha = out.stdout.trim().to_string();
                if !sha.is_empty() {
                    tracing::debug!(branch, sha = %sha, "Resolved reference");
                    return Ok(sha);
                }
            }
        }

        Err(HarnessError::ReferenceNotFound {
            reference: branch.to_string(),
            repo: self.path.display().to_string(),
        })
    }

    /// Tree object id of a commit, used to compare workspace states.
    pub async fn tree_of(&self, commit: &str) -> Result<String, HarnessError> {
        let spec = format!("{commit}^{{tree}}");
        let out = self.git(&["rev-parse", "--verify", &spec]).await?;
        if !out.success() {
            return Err(HarnessError::ReferenceNotFound {
                reference: commit.to_string(),
                repo: self.path.display().to_string(),
            });
        }
        Ok(out.stdout.trim().to_string())
    }
}

/// Run git with an optional working directory and a timeout.
pub(crate) async fn run_git(
    cwd: Option<&Path>,
    args: &[&str],
    timeout: Duration,
) -> Result<GitOutput, HarnessError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Ok(GitOutput {
                stdout: String::new(),
                stderr: format!("git timed out after {}s", timeout.as_secs()),
                exit_code: -1,
            })
        }
    };

    Ok(GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Truncate a string at a char boundary, marking the cut.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}
