//! JUnit XML rendering of validation reports.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::check::CheckOutcome;
use super::report::ValidationReport;

/// Render one report as a JUnit document with one test case per check.
pub fn render(report: &ValidationReport) -> String {
    let failures = report
        .checks()
        .iter()
        .filter(|c| matches!(c.outcome, CheckOutcome::Fail { .. }))
        .count();
    let errors = report
        .checks()
        .iter()
        .filter(|c| matches!(c.outcome, CheckOutcome::Error { .. }))
        .count();
    let total_secs: f64 = report
        .checks()
        .iter()
        .map(|c| c.duration.as_secs_f64())
        .sum();
    let suite = escape(report.problem_id());

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuites>\n");
    let _ = writeln!(
        xml,
        "  <testsuite name=\"{suite}\" tests=\"{}\" failures=\"{failures}\" errors=\"{errors}\" skipped=\"0\" time=\"{total_secs:.3}\">",
        report.checks().len()
    );
    for check in report.checks() {
        let _ = write!(
            xml,
            "    <testcase classname=\"{suite}\" name=\"{}\" time=\"{:.3}\"",
            check.check.junit_name(),
            check.duration.as_secs_f64()
        );
        match &check.outcome {
            CheckOutcome::Pass => xml.push_str("/>\n"),
            CheckOutcome::Fail { reason } => {
                let _ = writeln!(
                    xml,
                    ">\n      <failure type=\"{}\" message=\"{}\">{}</failure>\n    </testcase>",
                    check.check.as_str(),
                    escape(first_line(reason)),
                    escape(reason)
                );
            }
            CheckOutcome::Error { kind, reason } => {
                let _ = writeln!(
                    xml,
                    ">\n      <error type=\"{kind}\" message=\"{}\">{}</error>\n    </testcase>",
                    escape(first_line(reason)),
                    escape(reason)
                );
            }
        }
    }
    xml.push_str("  </testsuite>\n</testsuites>\n");
    xml
}

/// Write `<dir>/<problem_id>.xml` for a report.
pub fn write(report: &ValidationReport, dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.xml", report.problem_id()));
    std::fs::write(&path, render(report))?;
    Ok(path)
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

/// Escape text for use in XML attributes and character data.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Not representable in XML 1.0.
            c if (c as u32) < 0x20 && !matches!(c, '\t' | '\n' | '\r') => {}
            c => out.push(c),
        }
    }
    out
}
