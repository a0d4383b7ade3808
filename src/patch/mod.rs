//! Patches between branch states.
//!
//! A [`Patch`] is the textual diff between two refs of the source repository,
//! identified by its `(source, target)` pair. Patches are immutable once
//! generated. Two patches generated from unchanged branches have the same
//! [`Patch::fingerprint`], which ignores the timestamps some diff producers
//! embed in `---`/`+++` headers.

pub mod generator;

pub use generator::PatchGenerator;

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What a patch carries relative to the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchRole {
    /// baseline → test: adds the hidden tests.
    Test,
    /// baseline → golden: the reference solution.
    Golden,
    /// An agent-produced solution being graded.
    Agent,
}

impl std::fmt::Display for PatchRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::Golden => write!(f, "golden"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// Line and file counts of a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchStats {
    /// Paths touched, in patch order (post-image path for renames).
    pub files: Vec<String>,
    pub added_lines: usize,
    pub removed_lines: usize,
}

/// Immutable textual diff between two branch states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    source_ref: String,
    target_ref: String,
    text: String,
}

impl Patch {
    pub fn new(
        source_ref: impl Into<String>,
        target_ref: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            source_ref: source_ref.into(),
            target_ref: target_ref.into(),
            text: text.into(),
        }
    }

    pub fn source_ref(&self) -> &str {
        &self.source_ref
    }

    pub fn target_ref(&self) -> &str {
        &self.target_ref
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// `source..target`, used in logs and error messages.
    pub fn label(&self) -> String {
        format!("{}..{}", self.source_ref, self.target_ref)
    }

    /// Whether applying the patch would change nothing.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Content hash that is stable across regenerations.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for line in self.text.lines() {
            hasher.update(normalize_header(line).as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Whether two patches describe the same change.
    pub fn is_equivalent(&self, other: &Patch) -> bool {
        self.fingerprint() == other.fingerprint()
    }

    pub fn stats(&self) -> PatchStats {
        let mut stats = PatchStats::default();
        for line in self.text.lines() {
            if let Some(rest) = line.strip_prefix("diff --git ") {
                if let Some(path) = post_image_path(rest) {
                    stats.files.push(path);
                }
            } else if line.starts_with("+++") || line.starts_with("---") {
                continue;
            } else if line.starts_with('+') {
                stats.added_lines += 1;
            } else if line.starts_with('-') {
                stats.removed_lines += 1;
            }
        }
        stats
    }

    /// Whether the patch touches `path`.
    pub fn touches(&self, path: &str) -> bool {
        self.stats().files.iter().any(|f| f == path)
    }
}

fn header_timestamp() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^((?:---|\+\+\+) [^\t]+)\t.*$").ok())
        .as_ref()
}

fn normalize_header(line: &str) -> std::borrow::Cow<'_, str> {
    match header_timestamp() {
        Some(re) => re.replace(line, "$1"),
        None => std::borrow::Cow::Borrowed(line),
    }
}

/// Extract `b/<path>` from the remainder of a `diff --git a/x b/y` line.
fn post_image_path(rest: &str) -> Option<String> {
    rest.rfind(" b/")
        .map(|idx| rest[idx + 3..].trim().to_string())
        .filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
diff --git a/rtl/fifo.v b/rtl/fifo.v
index 1111111..2222222 100644
--- a/rtl/fifo.v
+++ b/rtl/fifo.v
@@ -1,3 +1,4 @@
 module fifo;
-  // TODO
+  reg [3:0] wptr;
+  reg [3:0] rptr;
 endmodule
diff --git a/tests/test_fifo.py b/tests/test_fifo.py
new file mode 100644
index 0000000..3333333
--- /dev/null
+++ b/tests/test_fifo.py
@@ -0,0 +1 @@
+def test_fifo(): pass
";

    #[test]
    fn test_stats_counts_lines_and_files() {
        let patch = Patch::new("base", "test", SAMPLE);
        let stats = patch.stats();
        assert_eq!(stats.files, vec!["rtl/fifo.v", "tests/test_fifo.py"]);
        assert_eq!(stats.added_lines, 3);
        assert_eq!(stats.removed_lines, 1);
        assert!(patch.touches("tests/test_fifo.py"));
        assert!(!patch.touches("rtl/other.v"));
    }

    #[test]
    fn test_fingerprint_ignores_header_timestamps() {
        let plain = "--- a/x.v\n+++ b/x.v\n@@ -1 +1 @@\n-a\n+b\n";
        let stamped =
            "--- a/x.v\t2024-01-01 10:00:00.000 +0000\n+++ b/x.v\t2024-06-01 11:00:00.000 +0000\n@@ -1 +1 @@\n-a\n+b\n";
        let a = Patch::new("base", "golden", plain);
        let b = Patch::new("base", "golden", stamped);
        assert!(a.is_equivalent(&b));
    }

    #[test]
    fn test_fingerprint_detects_content_change() {
        let a = Patch::new("base", "golden", "+a\n");
        let b = Patch::new("base", "golden", "+b\n");
        assert!(!a.is_equivalent(&b));
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_empty_patch() {
        assert!(Patch::new("a", "b", "").is_empty());
        assert!(Patch::new("a", "b", "\n  \n").is_empty());
        assert!(!Patch::new("a", "b", SAMPLE).is_empty());
    }

    #[test]
    fn test_label_and_role_display() {
        let patch = Patch::new("fifo_baseline", "fifo_test", SAMPLE);
        assert_eq!(patch.label(), "fifo_baseline..fifo_test");
        assert_eq!(PatchRole::Golden.to_string(), "golden");
    }
}
