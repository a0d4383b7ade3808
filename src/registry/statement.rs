//! Problem statement rendering.

use serde::{Deserialize, Serialize};

use super::entry::ProblemSpec;

/// Placeholder replaced by the problem statement in a prompt template.
pub const STATEMENT_PLACEHOLDER: &str = "<STATEMENT>";

/// Default prompt template wrapped around every problem description.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "\
You will be working on a Verilog hardware design task.
The repository has already been cloned in the environment in /home/ubuntu/example-verilog-codebase.

Use the tools provided to complete the following task:

<STATEMENT>
";

/// Which hints are appended to the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HintMode {
    #[default]
    None,
    All,
}

impl std::str::FromStr for HintMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "all" => Ok(Self::All),
            other => Err(format!("unknown hint mode '{other}': expected none or all")),
        }
    }
}

impl std::fmt::Display for HintMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::All => write!(f, "all"),
        }
    }
}

impl ProblemSpec {
    /// Render the prompt given to the agent for this problem.
    pub fn statement(&self, template: &str, hints: HintMode) -> String {
        let mut statement = self.description.clone();
        if hints == HintMode::All && !self.hints.is_empty() {
            let hint_text: String = self
                .hints
                .iter()
                .map(|hint| format!("\n - {}\n", hint.text))
                .collect();
            statement.push_str(&format!("\n\n<HINTS>{hint_text}</HINTS>"));
        }
        template.replace(STATEMENT_PLACEHOLDER, &statement)
    }
}
