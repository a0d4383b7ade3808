//! Structured test-runner results.
//!
//! The test runner reports one JSON object per line. Two record shapes are
//! understood:
//!
//! ```text
//! {"test": "tests/test_fifo.py::test_full", "outcome": "passed"}
//! {"$report_type": "TestReport", "nodeid": "tests/test_fifo.py::test_full", "when": "call", "outcome": "failed"}
//! ```
//!
//! The second is what `pytest --report-log` writes; its setup/call/teardown
//! phases are folded into one outcome per test.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HarnessError;
use crate::git::truncate;

/// Outcome of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl TestOutcome {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "passed" | "pass" | "ok" | "success" => Some(Self::Passed),
            "failed" | "fail" | "failure" => Some(Self::Failed),
            "error" | "errored" => Some(Self::Error),
            "skipped" | "skip" | "xfailed" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Whether the test ran and did not pass.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }
}

impl std::fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// One test and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseResult {
    /// Runner-specific id, e.g. `tests/test_fifo.py::test_full`.
    pub id: String,
    /// Workspace-relative file the test lives in.
    pub file: String,
    pub outcome: TestOutcome,
}

/// Per-file tallies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl FileSummary {
    pub fn executed(&self) -> usize {
        self.passed + self.failed + self.errors
    }
}

/// Parsed result stream of one test-runner invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    cases: Vec<TestCaseResult>,
}

impl TestResults {
    pub fn from_cases(cases: Vec<TestCaseResult>) -> Self {
        Self { cases }
    }

    /// Parse a JSON-lines result stream.
    ///
    /// Lines that are not recognized records are ignored as long as at least
    /// one line is. An empty stream parses to no results; a non-empty stream
    /// without a single recognized line is [`HarnessError::UnparseableTestOutput`].
    pub fn parse(stream: &str) -> Result<Self, HarnessError> {
        let mut parser = Parser::default();
        let mut recognized = false;
        let mut non_blank = false;

        for line in stream.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            non_blank = true;
            let Ok(Value::Object(record)) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if parser.record(&record)? {
                recognized = true;
            }
        }

        if non_blank && !recognized {
            return Err(HarnessError::UnparseableTestOutput(format!(
                "no result records found in: {}",
                truncate(stream.trim(), 300)
            )));
        }
        Ok(parser.finish())
    }

    pub fn cases(&self) -> &[TestCaseResult] {
        &self.cases
    }

    fn count(&self, pred: impl Fn(TestOutcome) -> bool) -> usize {
        self.cases.iter().filter(|c| pred(c.outcome)).count()
    }

    /// Tests that actually ran (skips excluded).
    pub fn executed(&self) -> usize {
        self.count(|o| o != TestOutcome::Skipped)
    }

    pub fn passed(&self) -> usize {
        self.count(|o| o == TestOutcome::Passed)
    }

    /// Failed or errored tests.
    pub fn failures(&self) -> usize {
        self.count(|o| o.is_failure())
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| o == TestOutcome::Skipped)
    }

    pub fn all_passed(&self) -> bool {
        self.executed() > 0 && self.failures() == 0
    }

    pub fn by_file(&self) -> BTreeMap<String, FileSummary> {
        let mut files: BTreeMap<String, FileSummary> = BTreeMap::new();
        for case in &self.cases {
            let summary = files.entry(case.file.clone()).or_default();
            match case.outcome {
                TestOutcome::Passed => summary.passed += 1,
                TestOutcome::Failed => summary.failed += 1,
                TestOutcome::Error => summary.errors += 1,
                TestOutcome::Skipped => summary.skipped += 1,
            }
        }
        files
    }

    /// Ids of failed or errored tests.
    pub fn failing_ids(&self) -> Vec<&str> {
        self.cases
            .iter()
            .filter(|c| c.outcome.is_failure())
            .map(|c| c.id.as_str())
            .collect()
    }

    /// One-line summary, e.g. `3 passed, 1 failed, 0 skipped`.
    pub fn summary_line(&self) -> String {
        format!(
            "{} passed, {} failed, {} skipped",
            self.passed(),
            self.failures(),
            self.skipped()
        )
    }
}

/// File part of a test id (`file::name` or a bare path).
pub fn file_of(test_id: &str) -> String {
    let file = test_id.split("::").next().unwrap_or(test_id);
    normalize_path(file)
}

/// Strip leading `./` so declared paths and runner ids compare equal.
pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.to_string()
}

#[derive(Default)]
struct Parser {
    order: Vec<String>,
    outcomes: HashMap<String, TestOutcome>,
}

impl Parser {
    fn set(&mut self, id: &str, outcome: TestOutcome) {
        if !self.outcomes.contains_key(id) {
            self.order.push(id.to_string());
        }
        self.outcomes.insert(id.to_string(), outcome);
    }

    /// Fold one JSON object in. Returns whether it was a recognized record.
    fn record(&mut self, record: &serde_json::Map<String, Value>) -> Result<bool, HarnessError> {
        let outcome_of = |s: &str| {
            TestOutcome::parse(s).ok_or_else(|| {
                HarnessError::UnparseableTestOutput(format!("unknown test outcome '{s}'"))
            })
        };

        if let Some(report_type) = record.get("$report_type").and_then(Value::as_str) {
            match report_type {
                "TestReport" => {
                    let (Some(nodeid), Some(when), Some(outcome)) = (
                        record.get("nodeid").and_then(Value::as_str),
                        record.get("when").and_then(Value::as_str),
                        record.get("outcome").and_then(Value::as_str),
                    ) else {
                        return Ok(false);
                    };
                    let outcome = outcome_of(outcome)?;
                    self.phase(nodeid, when, outcome);
                }
                "CollectReport" => {
                    // A file that fails to collect never produces TestReports.
                    let failed = record.get("outcome").and_then(Value::as_str) == Some("failed");
                    if let Some(nodeid) = record.get("nodeid").and_then(Value::as_str) {
                        if failed && !nodeid.is_empty() {
                            self.set(nodeid, TestOutcome::Error);
                        }
                    }
                }
                _ => {}
            }
            return Ok(true);
        }

        if let (Some(test), Some(outcome)) = (
            record.get("test").and_then(Value::as_str),
            record.get("outcome").and_then(Value::as_str),
        ) {
            let outcome = outcome_of(outcome)?;
            self.set(test, outcome);
            return Ok(true);
        }

        Ok(false)
    }

    fn phase(&mut self, nodeid: &str, when: &str, outcome: TestOutcome) {
        let current = self.outcomes.get(nodeid).copied();
        let next = match (when, outcome) {
            ("setup", TestOutcome::Failed) => TestOutcome::Error,
            ("setup", TestOutcome::Skipped) => TestOutcome::Skipped,
            ("setup", _) => current.unwrap_or(TestOutcome::Passed),
            ("call", o) => o,
            ("teardown", TestOutcome::Failed) if current == Some(TestOutcome::Passed) => {
                TestOutcome::Error
            }
            (_, _) => match current {
                Some(c) => c,
                None => return,
            },
        };
        self.set(nodeid, next);
    }

    fn finish(self) -> TestResults {
        let Parser { order, outcomes } = self;
        let cases = order
            .into_iter()
            .filter_map(|id| {
                outcomes.get(&id).map(|&outcome| TestCaseResult {
                    file: file_of(&id),
                    id,
                    outcome,
                })
            })
            .collect();
        TestResults { cases }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generic_records() {
        let stream = r#"
{"test": "tests/test_fifo.py::test_empty", "outcome": "passed"}
{"test": "tests/test_fifo.py::test_full", "outcome": "failed"}
{"test": "tests/test_ptr.py::test_wrap", "outcome": "skipped"}
"#;
        let results = TestResults::parse(stream).unwrap();
        assert_eq!(results.cases().len(), 3);
        assert_eq!(results.executed(), 2);
        assert_eq!(results.passed(), 1);
        assert_eq!(results.failures(), 1);
        assert!(!results.all_passed());
        assert_eq!(results.failing_ids(), vec!["tests/test_fifo.py::test_full"]);

        let files = results.by_file();
        assert_eq!(files["tests/test_fifo.py"].executed(), 2);
        assert_eq!(files["tests/test_ptr.py"].skipped, 1);
    }

    #[test]
    fn test_parse_reportlog_phases() {
        let stream = r#"{"pytest_version": "8.0.0", "$report_type": "SessionStart"}
{"nodeid": "tests/test_fifo.py::test_a", "when": "setup", "outcome": "passed", "$report_type": "TestReport"}
{"nodeid": "tests/test_fifo.py::test_a", "when": "call", "outcome": "passed", "$report_type": "TestReport"}
{"nodeid": "tests/test_fifo.py::test_a", "when": "teardown", "outcome": "passed", "$report_type": "TestReport"}
{"nodeid": "tests/test_fifo.py::test_b", "when": "setup", "outcome": "failed", "$report_type": "TestReport"}
{"nodeid": "tests/test_fifo.py::test_b", "when": "teardown", "outcome": "passed", "$report_type": "TestReport"}
{"nodeid": "tests/test_fifo.py::test_c", "when": "call", "outcome": "passed", "$report_type": "TestReport"}
{"nodeid": "tests/test_fifo.py::test_c", "when": "teardown", "outcome": "failed", "$report_type": "TestReport"}
{"exitstatus": 1, "$report_type": "SessionFinish"}
"#;
        let results = TestResults::parse(stream).unwrap();
        let outcomes: Vec<TestOutcome> = results.cases().iter().map(|c| c.outcome).collect();
        assert_eq!(
            outcomes,
            vec![TestOutcome::Passed, TestOutcome::Error, TestOutcome::Error]
        );
    }

    #[test]
    fn test_parse_collect_error_counts_as_failure() {
        let stream = r#"{"$report_type": "CollectReport", "nodeid": "", "outcome": "passed"}
{"$report_type": "CollectReport", "nodeid": "tests/test_fifo.py", "outcome": "failed"}
"#;
        let results = TestResults::parse(stream).unwrap();
        assert_eq!(results.failures(), 1);
        assert_eq!(results.cases()[0].file, "tests/test_fifo.py");
    }

    #[test]
    fn test_parse_ignores_noise_when_records_present() {
        let stream = "collecting ...\n{\"test\": \"t.py::x\", \"outcome\": \"ok\"}\n1 passed\n";
        let results = TestResults::parse(stream).unwrap();
        assert_eq!(results.passed(), 1);
        assert!(results.all_passed());
    }

    #[test]
    fn test_parse_plain_text_is_unparseable() {
        let err = TestResults::parse("===== 3 passed in 0.1s =====\n").unwrap_err();
        assert!(matches!(err, HarnessError::UnparseableTestOutput(_)));
    }

    #[test]
    fn test_parse_unknown_outcome_is_unparseable() {
        let err = TestResults::parse(r#"{"test": "t.py::x", "outcome": "maybe"}"#).unwrap_err();
        assert!(matches!(err, HarnessError::UnparseableTestOutput(_)));
    }

    #[test]
    fn test_parse_empty_stream() {
        let results = TestResults::parse("  \n\n").unwrap();
        assert_eq!(results.executed(), 0);
        assert!(!results.all_passed());
    }

    #[test]
    fn test_file_of_and_normalize() {
        assert_eq!(file_of("./tests/test_fifo.py::test_a[1]"), "tests/test_fifo.py");
        assert_eq!(file_of("tests/test_fifo.py"), "tests/test_fifo.py");
        assert_eq!(normalize_path("././a/b.py"), "a/b.py");
    }

    #[test]
    fn test_summary_line() {
        let results = TestResults::from_cases(vec![TestCaseResult {
            id: "a.py::x".to_string(),
            file: "a.py".to_string(),
            outcome: TestOutcome::Passed,
        }]);
        assert_eq!(results.summary_line(), "1 passed, 0 failed, 0 skipped");
    }
}
