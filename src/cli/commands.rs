//! CLI command definitions for hdl-forge.
//!
//! Configuration is resolved in three layers: built-in defaults, `HDLFORGE_*`
//! environment variables, then the flags below.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::Cancellation;
use crate::config::{Backend, HarnessConfig};
use crate::export::{self, ExportConfig};
use crate::patch::Patch;
use crate::registry::{HintMode, ProblemRegistry, ReviewLevel, DEFAULT_PROMPT_TEMPLATE};
use crate::registry::RegistryFilter;
use crate::scheduler::Scheduler;
use crate::validation::junit;

/// Validate and grade Verilog coding tasks defined as branch triads.
#[derive(Parser)]
#[command(name = "hdl-forge")]
#[command(about = "Validate and grade branch-triad Verilog tasks")]
#[command(version)]
#[command(
    long_about = "hdl-forge checks that every problem in a registry is a well-formed task \
(baseline builds, hidden tests fail on the baseline and pass with the golden patch) \
and grades agent solutions against the hidden tests.\n\nExample usage:\n  \
hdl-forge --source-repo ../verilog-tasks validate --jobs 4 --junit-dir ./junit"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Repository holding the problem branches (overrides HDLFORGE_SOURCE_REPO).
    #[arg(long, global = true)]
    pub source_repo: Option<PathBuf>,

    /// Problem registry YAML file (overrides HDLFORGE_REGISTRY).
    #[arg(short, long, global = true)]
    pub registry: Option<PathBuf>,

    /// Environment backend: local or docker (overrides HDLFORGE_BACKEND).
    #[arg(long, global = true)]
    pub backend: Option<Backend>,

    /// Image for the docker backend (overrides HDLFORGE_DOCKER_IMAGE).
    #[arg(long, global = true)]
    pub docker_image: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// List registry problems.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Print the test or golden patch of a problem.
    Diff(DiffArgs),

    /// Run the six validation checks over the registry.
    Validate(ValidateArgs),

    /// Grade an agent solution against a problem's hidden tests.
    Grade(GradeArgs),

    /// Write evaluation task files for the registry.
    Export(ExportArgs),
}

/// Problem selection shared by several commands.
#[derive(clap::Args, Debug, Default)]
pub struct FilterArgs {
    /// Comma-separated problem ids.
    #[arg(long, value_delimiter = ',')]
    pub ids: Vec<String>,

    /// File with one problem id per line (`-` reads stdin).
    #[arg(long)]
    pub ids_file: Option<String>,

    /// Only problems at this review level (repeatable).
    #[arg(long = "review-level")]
    pub review_levels: Vec<ReviewLevel>,

    /// Include problems marked too hard.
    #[arg(long)]
    pub include_too_hard: bool,

    /// Include demo problems.
    #[arg(long)]
    pub include_demo: bool,
}

impl FilterArgs {
    fn to_filter(&self) -> anyhow::Result<RegistryFilter> {
        let mut filter = RegistryFilter::new()
            .with_ids(self.ids.iter().cloned())
            .with_review_levels(self.review_levels.clone())
            .include_too_hard(self.include_too_hard)
            .include_demo(self.include_demo);
        if let Some(path) = &self.ids_file {
            filter = filter.with_ids_file(path)?;
        }
        Ok(filter)
    }
}

/// Arguments for `hdl-forge list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub filter: FilterArgs,

    /// Include the rendered prompt of each problem.
    #[arg(long)]
    pub prompts: bool,

    /// Append hints to rendered prompts: none or all.
    #[arg(long, default_value = "none")]
    pub hints: HintMode,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Which generated patch to print.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Test,
    Golden,
}

/// Arguments for `hdl-forge diff`.
#[derive(Parser, Debug)]
pub struct DiffArgs {
    /// Problem id.
    pub id: String,

    /// Patch to print.
    #[arg(short, long, value_enum, default_value = "golden")]
    pub kind: PatchKind,

    /// Print patch statistics instead of the patch.
    #[arg(long)]
    pub stat: bool,
}

/// Arguments for `hdl-forge validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub filter: FilterArgs,

    /// Problems validated at once (overrides HDLFORGE_CONCURRENCY).
    #[arg(short = 'J', long)]
    pub jobs: Option<usize>,

    /// Attempts per problem on infrastructure errors (overrides HDLFORGE_MAX_ATTEMPTS).
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Write one JUnit XML file per problem into this directory.
    #[arg(long)]
    pub junit_dir: Option<PathBuf>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `hdl-forge grade`.
#[derive(Parser, Debug)]
pub struct GradeArgs {
    /// Problem id.
    pub id: String,

    /// Unified diff produced by the agent.
    #[arg(long, conflicts_with = "branch", required_unless_present = "branch")]
    pub patch: Option<PathBuf>,

    /// Branch of the source repository holding the agent's solution.
    #[arg(long)]
    pub branch: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `hdl-forge export`.
#[derive(Parser, Debug)]
pub struct ExportArgs {
    #[command(flatten)]
    pub filter: FilterArgs,

    /// Directory receiving the task files.
    #[arg(short = 'o', long, default_value = ".")]
    pub output: PathBuf,

    /// Image prefix; the problem id is appended.
    #[arg(long, default_value = "hdl-forge:")]
    pub image_base: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli)?;
    match cli.command {
        Commands::List(args) => run_list_command(&config, args),
        Commands::Diff(args) => run_diff_command(&config, args).await,
        Commands::Validate(args) => run_validate_command(config, args).await,
        Commands::Grade(args) => run_grade_command(&config, args).await,
        Commands::Export(args) => run_export_command(&config, args),
    }
}

fn resolve_config(cli: &Cli) -> anyhow::Result<HarnessConfig> {
    let mut config = HarnessConfig::from_env()?;
    if let Some(path) = &cli.source_repo {
        config.source_repo = path.clone();
    }
    if let Some(path) = &cli.registry {
        config.registry_path = path.clone();
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(image) = &cli.docker_image {
        config.docker_image = image.clone();
    }
    Ok(config)
}

fn load_registry(config: &HarnessConfig, filter: Option<&FilterArgs>) -> anyhow::Result<ProblemRegistry> {
    let registry = ProblemRegistry::load(&config.registry_path)?;
    match filter {
        Some(args) => Ok(registry.filter(&args.to_filter()?)),
        None => Ok(registry),
    }
}

// ============================================================================
// list
// ============================================================================

#[derive(Debug, Serialize)]
struct ListEntry<'a> {
    id: &'a str,
    difficulty: String,
    review_level: &'static str,
    baseline: &'a str,
    test: &'a str,
    golden: &'a str,
    test_files: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
}

fn run_list_command(config: &HarnessConfig, args: ListArgs) -> anyhow::Result<()> {
    let registry = load_registry(config, Some(&args.filter))?;
    let entries: Vec<ListEntry<'_>> = registry
        .iter()
        .map(|p| ListEntry {
            id: &p.id,
            difficulty: p.difficulty.to_string(),
            review_level: p.review_level.as_str(),
            baseline: &p.baseline,
            test: &p.test,
            golden: &p.golden,
            test_files: &p.test_files,
            prompt: args
                .prompts
                .then(|| p.statement(DEFAULT_PROMPT_TEMPLATE, args.hints)),
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        println!(
            "{:<32} {:<7} {:<18} {}",
            entry.id,
            entry.difficulty,
            entry.review_level,
            entry.test_files.join(", ")
        );
        if let Some(prompt) = &entry.prompt {
            println!("{}\n", prompt.trim_end());
        }
    }
    println!("{} problem(s)", entries.len());
    Ok(())
}

// ============================================================================
// diff
// ============================================================================

async fn run_diff_command(config: &HarnessConfig, args: DiffArgs) -> anyhow::Result<()> {
    let registry = load_registry(config, None)?;
    let problem = registry.get(&args.id)?;
    let target = match args.kind {
        PatchKind::Test => &problem.test,
        PatchKind::Golden => &problem.golden,
    };
    let patch = config.patch_generator().diff(&problem.baseline, target).await?;

    if args.stat {
        let stats = patch.stats();
        println!(
            "{}: {} file(s) changed, {} insertion(s), {} deletion(s)",
            patch.label(),
            stats.files.len(),
            stats.added_lines,
            stats.removed_lines
        );
    } else {
        print!("{}", patch.text());
    }
    Ok(())
}

// ============================================================================
// validate
// ============================================================================

async fn run_validate_command(mut config: HarnessConfig, args: ValidateArgs) -> anyhow::Result<()> {
    if let Some(jobs) = args.jobs {
        config.concurrency = jobs;
    }
    if let Some(attempts) = args.max_attempts {
        config.max_attempts = attempts;
    }
    config.validate()?;

    let registry = load_registry(&config, Some(&args.filter))?;
    if registry.is_empty() {
        warn!("No problems selected");
    }

    let scheduler = Scheduler::new(Arc::new(config.validator()), config.scheduler_config())?;
    let cancel = Cancellation::new();
    let signal = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling validation");
            signal.cancel();
        }
    });

    let outcome = scheduler.validate_all(&registry, &cancel).await;
    ctrl_c.abort();
    let outcome = outcome?;

    if let Some(dir) = &args.junit_dir {
        std::fs::create_dir_all(dir)?;
        for report in outcome.reports.values() {
            junit::write(report, dir)?;
        }
        info!(dir = %dir.display(), reports = outcome.reports.len(), "Wrote JUnit reports");
    }

    let summary = outcome.summary();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("\n=== Validation Results ===");
        for report in outcome.reports.values() {
            println!("  {} [{}]", report.problem_id(), report.verdict());
            for check in report.failing_checks() {
                println!(
                    "    {}: {}{}",
                    check.check,
                    check.outcome.label(),
                    check
                        .outcome
                        .reason()
                        .map(|r| format!(" ({})", first_line(r)))
                        .unwrap_or_default()
                );
            }
        }
        for id in &outcome.cancelled {
            println!("  {id} [cancelled]");
        }
        println!();
        println!("Total:     {}", summary.total);
        println!("Valid:     {}", summary.valid);
        println!("Invalid:   {}", summary.invalid);
        println!("Cancelled: {}", summary.cancelled);
    }

    if !summary.all_valid() {
        anyhow::bail!(
            "{} invalid and {} cancelled of {} problem(s)",
            summary.invalid,
            summary.cancelled,
            summary.total
        );
    }
    Ok(())
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}

// ============================================================================
// grade
// ============================================================================

async fn run_grade_command(config: &HarnessConfig, args: GradeArgs) -> anyhow::Result<()> {
    config.validate()?;
    let registry = load_registry(config, None)?;
    let problem = registry.get(&args.id)?;
    let grader = config.grader();

    let agent_patch = match (&args.patch, &args.branch) {
        (Some(path), _) => read_patch_file(path, &problem.baseline)?,
        (None, Some(branch)) => grader.patch_from_branch(problem, branch).await?,
        (None, None) => anyhow::bail!("either --patch or --branch is required"),
    };

    let grade = grader.grade(problem, &agent_patch).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&grade)?);
    } else {
        println!("{} score={:.2} outcome={}", problem.id, grade.score(), grade.metadata.outcome);
        if let Some(reason) = &grade.metadata.reason {
            println!("  reason: {reason}");
        }
    }
    Ok(())
}

fn read_patch_file(path: &Path, baseline: &str) -> anyhow::Result<Patch> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read patch {}: {}", path.display(), e))?;
    Ok(Patch::new(baseline, path.display().to_string(), text))
}

// ============================================================================
// export
// ============================================================================

fn run_export_command(config: &HarnessConfig, args: ExportArgs) -> anyhow::Result<()> {
    let registry = load_registry(config, Some(&args.filter))?;
    let problems: Vec<_> = registry.iter().collect();
    let export_config = ExportConfig {
        output_dir: args.output,
        image_base: args.image_base,
        ..Default::default()
    };
    let written = export::write_all(&problems, &export_config)?;
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_validate_command_defaults() {
        let cli = Cli::try_parse_from(["hdl-forge", "validate"]).expect("should parse");
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Validate(args) => {
                assert!(args.jobs.is_none());
                assert!(args.junit_dir.is_none());
                assert!(!args.json);
                assert!(args.filter.ids.is_empty());
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_validate_command_with_all_options() {
        let cli = Cli::try_parse_from([
            "hdl-forge",
            "--backend",
            "docker",
            "--source-repo",
            "/srv/tasks",
            "validate",
            "-J",
            "3",
            "--ids",
            "fifo,uart",
            "--review-level",
            "hud-approved",
            "--review-level",
            "customer-approved",
            "--include-too-hard",
            "--junit-dir",
            "out",
            "-j",
            "-l",
            "debug",
        ])
        .expect("should parse");
        assert_eq!(cli.backend, Some(Backend::Docker));
        assert_eq!(cli.source_repo, Some(PathBuf::from("/srv/tasks")));
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Validate(args) => {
                assert_eq!(args.jobs, Some(3));
                assert_eq!(args.filter.ids, vec!["fifo", "uart"]);
                assert_eq!(
                    args.filter.review_levels,
                    vec![ReviewLevel::HudApproved, ReviewLevel::CustomerApproved]
                );
                assert!(args.filter.include_too_hard);
                assert!(!args.filter.include_demo);
                assert_eq!(args.junit_dir, Some(PathBuf::from("out")));
                assert!(args.json);
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_grade_requires_patch_or_branch() {
        assert!(Cli::try_parse_from(["hdl-forge", "grade", "fifo"]).is_err());
        assert!(Cli::try_parse_from([
            "hdl-forge", "grade", "fifo", "--patch", "a.diff", "--branch", "x"
        ])
        .is_err());

        let cli = Cli::try_parse_from(["hdl-forge", "grade", "fifo", "--branch", "fifo_agent"])
            .expect("should parse");
        match cli.command {
            Commands::Grade(args) => {
                assert_eq!(args.id, "fifo");
                assert_eq!(args.branch.as_deref(), Some("fifo_agent"));
            }
            _ => panic!("Expected Grade command"),
        }
    }

    #[test]
    fn test_diff_kind() {
        let cli = Cli::try_parse_from(["hdl-forge", "diff", "fifo", "--kind", "test"])
            .expect("should parse");
        match cli.command {
            Commands::Diff(args) => assert_eq!(args.kind, PatchKind::Test),
            _ => panic!("Expected Diff command"),
        }
    }

    #[test]
    fn test_filter_args_to_filter() {
        let args = FilterArgs {
            ids: vec!["a".to_string()],
            include_demo: true,
            ..Default::default()
        };
        let filter = args.to_filter().unwrap();
        assert!(filter.ids.contains("a"));
        assert!(filter.include_demo);
        assert!(!filter.include_too_hard);
    }

    #[test]
    fn test_read_patch_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.diff");
        std::fs::write(&path, "diff --git a/x b/x\n").unwrap();
        let patch = read_patch_file(&path, "fifo_baseline").unwrap();
        assert_eq!(patch.source_ref(), "fifo_baseline");
        assert!(patch.text().starts_with("diff --git"));

        assert!(read_patch_file(&dir.path().join("missing.diff"), "b").is_err());
    }
}
