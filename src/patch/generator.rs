//! Patch generation from the source repository's history.

use crate::error::HarnessError;
use crate::git::{truncate, SourceRepo};
use crate::registry::ProblemSpec;

use super::Patch;

/// Computes diffs between branches of the source repository.
///
/// Diffs are taken between resolved commits, so the working tree and index of
/// the source repository are never read or modified.
#[derive(Debug, Clone)]
pub struct PatchGenerator {
    repo: SourceRepo,
}

/// The two patches derived from a problem's branch triad.
#[derive(Debug)]
pub struct ProblemPatches {
    /// baseline → test.
    pub test: Result<Patch, HarnessError>,
    /// baseline → golden.
    pub golden: Result<Patch, HarnessError>,
}

impl PatchGenerator {
    pub fn new(repo: SourceRepo) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &SourceRepo {
        &self.repo
    }

    /// Diff `from` → `to`.
    ///
    /// The result applies with `git apply` on a checkout of `from` and yields
    /// the tracked content of `to`, binary files included.
    pub async fn diff(&self, from: &str, to: &str) -> Result<Patch, HarnessError> {
        let from_sha = self.repo.resolve(from).await?;
        let to_sha = self.repo.resolve(to).await?;

        // Pin the settings that change the diff format so user config cannot
        // produce something `git apply` rejects.
        let out = self
            .repo
            .git(&[
                "-c",
                "diff.noprefix=false",
                "-c",
                "diff.mnemonicPrefix=false",
                "-c",
                "core.quotePath=false",
                "diff",
                "--binary",
                "--full-index",
                "--no-color",
                "--no-ext-diff",
                "--no-textconv",
                &from_sha,
                &to_sha,
            ])
            .await?;

        if !out.success() {
            return Err(HarnessError::PatchGenerationFailed {
                source_ref: from.to_string(),
                target_ref: to.to_string(),
                reason: format!(
                    "git diff exited with {}: {}",
                    out.exit_code,
                    truncate(out.stderr.trim(), 500)
                ),
            });
        }

        let patch = Patch::new(from, to, out.stdout);
        let stats = patch.stats();
        tracing::debug!(
            from,
            to,
            files = stats.files.len(),
            added = stats.added_lines,
            removed = stats.removed_lines,
            "Generated patch"
        );
        Ok(patch)
    }

    /// Generate the test and golden patches of a problem.
    ///
    /// Each patch fails independently: a missing golden branch does not
    /// prevent the test patch from being produced.
    pub async fn for_problem(&self, problem: &ProblemSpec) -> ProblemPatches {
        let test = self.diff(&problem.baseline, &problem.test).await;
        let golden = self.diff(&problem.baseline, &problem.golden).await;
        if let Err(e) = &test {
            tracing::warn!(problem_id = %problem.id, error = %e, "Test patch generation failed");
        }
        if let Err(e) = &golden {
            tracing::warn!(problem_id = %problem.id, error = %e, "Golden patch generation failed");
        }
        ProblemPatches { test, golden }
    }
}
