//! Stopping a validation in the middle of a check with the local backend.

#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hdl_forge::cancel::Cancellation;
use hdl_forge::environment::{EnvironmentTracker, LocalEnvironmentBuilder};
use hdl_forge::error::{ErrorKind, HarnessError};
use hdl_forge::git::SourceRepo;
use hdl_forge::grading::{CommandToolchain, GradingRunner};
use hdl_forge::patch::PatchGenerator;
use hdl_forge::validation::{CheckKind, ValidationContext, Validator};

/// Test runner that marks its start, then forks a subshell which writes a
/// second marker two seconds later unless it is killed first.
fn slow_test_command(started: &Path, survived: &Path) -> String {
    format!(
        "touch '{}'; (sleep 2; touch '{}') & wait; {}",
        started.display(),
        survived.display(),
        common::TEST_COMMAND
    )
}

fn validator(repo: &Path, scratch: &Path, toolchain: CommandToolchain) -> Validator {
    let source = SourceRepo::new(repo);
    Validator::new(
        Arc::new(LocalEnvironmentBuilder::new(source.clone()).with_scratch_dir(scratch)),
        PatchGenerator::new(source),
        GradingRunner::new(Arc::new(toolchain)),
    )
}

struct Markers {
    _dir: tempfile::TempDir,
    started: PathBuf,
    survived: PathBuf,
}

fn markers() -> Markers {
    let dir = tempfile::tempdir().unwrap();
    Markers {
        started: dir.path().join("started"),
        survived: dir.path().join("survived"),
        _dir: dir,
    }
}

fn scratch_entries(scratch: &Path) -> usize {
    std::fs::read_dir(scratch).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_cancel_during_hidden_test_run() {
    if !common::git_available() {
        return;
    }
    let repo = common::source_repo();
    let scratch = tempfile::tempdir().unwrap();
    let marks = markers();
    let toolchain = CommandToolchain::new(
        common::BUILD_COMMAND,
        slow_test_command(&marks.started, &marks.survived),
    );
    let validator = validator(repo.path(), scratch.path(), toolchain);

    let tracker = EnvironmentTracker::new();
    let cancel = Cancellation::new();
    let ctx = ValidationContext::new(tracker.clone(), cancel.clone());

    let started = marks.started.clone();
    tokio::spawn(async move {
        for _ in 0..600 {
            if started.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(60),
        validator.validate_with(&common::counter_problem("counter"), &ctx),
    )
    .await
    .expect("validation stops promptly after cancellation");

    assert!(marks.started.exists(), "hidden tests never started");
    assert!(matches!(result, Err(HarnessError::Cancelled)));
    assert_eq!(tracker.live(), 0);
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.created, snapshot.torn_down);
    assert_eq!(scratch_entries(scratch.path()), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(
        !marks.survived.exists(),
        "test runner process outlived the cancelled check"
    );
}

#[tokio::test]
async fn test_timed_out_test_run_leaves_no_processes() {
    if !common::git_available() {
        return;
    }
    let repo = common::source_repo();
    let scratch = tempfile::tempdir().unwrap();
    let marks = markers();
    let toolchain = CommandToolchain::new(
        common::BUILD_COMMAND,
        slow_test_command(&marks.started, &marks.survived),
    )
    .with_test_timeout(Duration::from_millis(500));
    let validator = validator(repo.path(), scratch.path(), toolchain);

    let report = validator
        .validate(&common::counter_problem("counter"))
        .await
        .unwrap();

    for kind in [CheckKind::TestsFailOnBaseline, CheckKind::TestsPassOnGolden] {
        assert_eq!(
            report.check(kind).unwrap().outcome.error_kind(),
            Some(ErrorKind::ToolchainFailed),
            "{kind}"
        );
    }
    assert_eq!(scratch_entries(scratch.path()), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(
        !marks.survived.exists(),
        "test runner process outlived its timeout"
    );
}
