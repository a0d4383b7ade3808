//! Shared fixtures: a scratch source repository holding small Verilog problems.

#![allow(dead_code)]

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use hdl_forge::environment::LocalEnvironmentBuilder;
use hdl_forge::git::SourceRepo;
use hdl_forge::grading::{CommandToolchain, Grader, GradingRunner};
use hdl_forge::patch::PatchGenerator;
use hdl_forge::registry::ProblemSpec;
use hdl_forge::validation::Validator;
use tempfile::TempDir;

/// Build succeeds while the counter source exists.
pub const BUILD_COMMAND: &str = "test -f rtl/counter.v";
/// Every hidden test file is a script printing one JSON record per test.
pub const TEST_COMMAND: &str = "for f in {files}; do bash \"$f\"; done";

const SETUP: &str = r##"
set -e
git init -q -b main .
git config user.email harness@example.com
git config user.name harness
git config commit.gpgsign false

mkdir -p rtl
cat > rtl/counter.v <<'EOF'
module counter(input [3:0] count, output [3:0] next);
  assign next = count;
endmodule
EOF
git add .
git commit -qm baseline
git branch counter_baseline

git checkout -qb counter_test counter_baseline
mkdir -p tests
cat > tests/test_counter.sh <<'EOF'
if grep -q 'count + 1' rtl/counter.v; then o=passed; else o=failed; fi
echo "{\"test\": \"tests/test_counter.sh::test_increments\", \"outcome\": \"$o\"}"
echo '{"test": "tests/test_counter.sh::test_declared", "outcome": "passed"}'
EOF
git add .
git commit -qm "hidden tests"

git checkout -qb counter_golden counter_baseline
cat > rtl/counter.v <<'EOF'
module counter(input [3:0] count, output [3:0] next);
  assign next = count + 1;
endmodule
EOF
printf '\000\001\002\377' > rtl/rom.bin
git add .
git commit -qm golden

git checkout -qb counter_wrong counter_baseline
echo '// still incomplete' >> rtl/counter.v
git commit -qam "wrong fix"

git checkout -qb counter_deleted counter_baseline
git rm -q rtl/counter.v
git commit -qm "delete counter"

git checkout -qb counter_renamed counter_baseline
git mv rtl/counter.v rtl/up_counter.v
git commit -qm "rename counter"

# A problem whose baseline is already solved.
git checkout -qb solved_test counter_golden
git checkout counter_test -- tests
git commit -qm "hidden tests"
git checkout -qb solved_golden counter_golden
echo '// tidy' >> rtl/counter.v
git commit -qam "golden"

git checkout -q main
"##;

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn sh(dir: &Path, script: &str) {
    let out = Command::new("bash")
        .arg("-c")
        .arg(script)
        .current_dir(dir)
        .output()
        .expect("bash should run");
    assert!(
        out.status.success(),
        "script failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Scratch source repository with the `counter_*` branches.
pub fn source_repo() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    sh(dir.path(), SETUP);
    dir
}

pub fn counter_problem(id: &str) -> ProblemSpec {
    ProblemSpec::new(
        id,
        "Make the counter increment.",
        "counter_baseline",
        "counter_test",
        "counter_golden",
        vec!["tests/test_counter.sh".to_string()],
    )
}

pub fn runner() -> GradingRunner {
    GradingRunner::new(Arc::new(CommandToolchain::new(BUILD_COMMAND, TEST_COMMAND)))
}

pub fn validator(repo: &Path) -> Validator {
    let source = SourceRepo::new(repo);
    Validator::new(
        Arc::new(LocalEnvironmentBuilder::new(source.clone())),
        PatchGenerator::new(source),
        runner(),
    )
}

pub fn grader(repo: &Path) -> Grader {
    let source = SourceRepo::new(repo);
    Grader::new(
        Arc::new(LocalEnvironmentBuilder::new(source.clone())),
        PatchGenerator::new(source),
        runner(),
    )
}
