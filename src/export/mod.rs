//! Evaluation task export.
//!
//! Turns registry problems into the JSON task entries consumed by evaluation
//! runs. Each entry names the MCP tools that set up and grade the problem, the
//! tools the agent may use, and how to reach the problem's image.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::registry::ProblemSpec;

/// Remote MCP endpoint used when tasks do not run a local container.
pub const REMOTE_MCP_URL: &str = "https://mcp.hud.so/v3/mcp";

/// Agent provider a task file targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Claude,
    OpenAi,
}

impl Provider {
    pub fn allowed_tools(self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["bash", "str_replace_based_edit_tool"],
            Self::OpenAi => &["shell", "apply_patch"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenAi => "openai",
        }
    }
}

/// How an evaluation run reaches the problem image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `docker run --rm -i <image>` on the evaluating host.
    Local,
    /// Remote MCP server, image passed in a header.
    Remote,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Configuration for task export.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    /// Prefix of every problem image; the problem id is appended.
    pub image_base: String,
    /// Prompt written into each entry. Empty lets the setup tool supply it.
    pub prompt: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            image_base: "hdl-forge:".to_string(),
            prompt: String::new(),
        }
    }
}

impl ExportConfig {
    pub fn image_for(&self, problem_id: &str) -> String {
        format!("{}{}", self.image_base, problem_id)
    }
}

/// Options for one task file.
#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    pub transport: Transport,
    pub provider: Provider,
}

impl ExportOptions {
    /// Every transport and provider combination, in file order.
    pub const ALL: [ExportOptions; 4] = [
        ExportOptions {
            transport: Transport::Local,
            provider: Provider::Claude,
        },
        ExportOptions {
            transport: Transport::Local,
            provider: Provider::OpenAi,
        },
        ExportOptions {
            transport: Transport::Remote,
            provider: Provider::Claude,
        },
        ExportOptions {
            transport: Transport::Remote,
            provider: Provider::OpenAi,
        },
    ];

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-hud.json",
            self.transport.as_str(),
            self.provider.as_str()
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentConfig {
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum McpServer {
    Local { command: String, args: Vec<String> },
    Hud {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

/// One evaluation task.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskEntry {
    pub id: String,
    pub prompt: String,
    pub setup_tool: ToolCall,
    pub evaluate_tool: ToolCall,
    pub agent_config: AgentConfig,
    pub mcp_config: McpServer,
}

fn problem_arguments(problem_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("problem_id".to_string(), problem_id.to_string())])
}

/// Task entry for a single problem.
pub fn task_entry(problem: &ProblemSpec, config: &ExportConfig, options: ExportOptions) -> TaskEntry {
    let image = config.image_for(&problem.id);
    let mcp_config = match options.transport {
        Transport::Local => McpServer::Local {
            command: "docker".to_string(),
            args: ["run", "--rm", "-i"]
                .iter()
                .map(|s| s.to_string())
                .chain(std::iter::once(image))
                .collect(),
        },
        Transport::Remote => McpServer::Hud {
            url: REMOTE_MCP_URL.to_string(),
            headers: BTreeMap::from([
                (
                    "Authorization".to_string(),
                    "Bearer ${HUD_API_KEY}".to_string(),
                ),
                ("Mcp-Image".to_string(), image),
            ]),
        },
    };

    TaskEntry {
        id: problem.id.clone(),
        prompt: config.prompt.clone(),
        setup_tool: ToolCall {
            name: "setup_problem".to_string(),
            arguments: problem_arguments(&problem.id),
        },
        evaluate_tool: ToolCall {
            name: "grade_problem".to_string(),
            arguments: problem_arguments(&problem.id),
        },
        agent_config: AgentConfig {
            allowed_tools: options
                .provider
                .allowed_tools()
                .iter()
                .map(|t| t.to_string())
                .collect(),
        },
        mcp_config,
    }
}

/// Task entries for `problems`, in order.
pub fn task_entries<'a>(
    problems: impl IntoIterator<Item = &'a ProblemSpec>,
    config: &ExportConfig,
    options: ExportOptions,
) -> Vec<TaskEntry> {
    problems
        .into_iter()
        .map(|p| task_entry(p, config, options))
        .collect()
}

/// Write one task file per [`ExportOptions::ALL`] combination into
/// `config.output_dir`, returning the written paths.
pub fn write_all(problems: &[&ProblemSpec], config: &ExportConfig) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(&config.output_dir)?;
    let mut written = Vec::with_capacity(ExportOptions::ALL.len());
    for options in ExportOptions::ALL {
        let entries = task_entries(problems.iter().copied(), config, options);
        let path = config.output_dir.join(options.file_name());
        write_json(&path, &entries)?;
        tracing::info!(
            path = %path.display(),
            tasks = entries.len(),
            "Wrote task file"
        );
        written.push(path);
    }
    Ok(written)
}

fn write_json(path: &Path, entries: &[TaskEntry]) -> anyhow::Result<()> {
    let mut json = serde_json::to_string_pretty(entries)?;
    json.push('\n');
    std::fs::write(path, json)?;
    Ok(())
}
