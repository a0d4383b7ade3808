//! Harness configuration.
//!
//! Settings come from defaults, then `HDLFORGE_*` environment variables, then
//! CLI flags. The configuration also knows how to assemble the pipeline
//! components it describes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::environment::{DockerEnvironmentBuilder, EnvironmentBuilder, LocalEnvironmentBuilder};
use crate::git::SourceRepo;
use crate::grading::toolchain::{DEFAULT_BUILD_COMMAND, DEFAULT_TEST_COMMAND};
use crate::grading::{CommandToolchain, Grader, GradingRunner};
use crate::patch::PatchGenerator;
use crate::scheduler::SchedulerConfig;
use crate::validation::Validator;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Where environments are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Temporary `git clone` on the host.
    #[default]
    Local,
    /// One container per environment.
    Docker,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "docker" => Ok(Self::Docker),
            other => Err(format!("unknown backend '{other}': expected local or docker")),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// Configuration of the grading harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    // Inputs
    /// Repository holding every problem's branches.
    pub source_repo: PathBuf,
    /// YAML problem registry.
    pub registry_path: PathBuf,

    // Environments
    pub backend: Backend,
    /// Image used by the docker backend.
    pub docker_image: String,
    /// Optional `docker run --memory` limit.
    pub docker_memory: Option<String>,
    /// Parent directory for local workspaces (system temp dir when unset).
    pub scratch_dir: Option<PathBuf>,

    // Scheduling
    pub concurrency: usize,
    pub max_attempts: u32,

    // Toolchain
    pub build_command: String,
    pub test_command: String,
    pub build_timeout: Duration,
    pub test_timeout: Duration,
    pub patch_timeout: Duration,
    pub checkout_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            source_repo: PathBuf::from("."),
            registry_path: PathBuf::from("problems.yaml"),

            backend: Backend::Local,
            docker_image: "hdl-forge-runner:latest".to_string(),
            docker_memory: None,
            scratch_dir: None,

            concurrency: 4,
            max_attempts: 1,

            build_command: DEFAULT_BUILD_COMMAND.to_string(),
            test_command: DEFAULT_TEST_COMMAND.to_string(),
            build_timeout: Duration::from_secs(1500),
            test_timeout: Duration::from_secs(1800),
            patch_timeout: Duration::from_secs(120),
            checkout_timeout: Duration::from_secs(600),
        }
    }
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `HDLFORGE_SOURCE_REPO`: Source repository path (default: .)
    /// - `HDLFORGE_REGISTRY`: Problem registry YAML (default: problems.yaml)
    /// - `HDLFORGE_BACKEND`: `local` or `docker` (default: local)
    /// - `HDLFORGE_DOCKER_IMAGE`: Image for the docker backend
    /// - `HDLFORGE_DOCKER_MEMORY`: Container memory limit, e.g. `8g`
    /// - `HDLFORGE_SCRATCH_DIR`: Parent directory of local workspaces
    /// - `HDLFORGE_CONCURRENCY`: Problems validated at once (default: 4)
    /// - `HDLFORGE_MAX_ATTEMPTS`: Attempts on infrastructure errors (default: 1)
    /// - `HDLFORGE_BUILD_COMMAND`: Build command (default: true)
    /// - `HDLFORGE_TEST_COMMAND`: Test command template with `{files}` and `{report}`
    /// - `HDLFORGE_BUILD_TIMEOUT_SECS`: Build timeout (default: 1500)
    /// - `HDLFORGE_TEST_TIMEOUT_SECS`: Test timeout (default: 1800)
    /// - `HDLFORGE_PATCH_TIMEOUT_SECS`: `git apply` timeout (default: 120)
    /// - `HDLFORGE_CHECKOUT_TIMEOUT_SECS`: Clone/checkout timeout (default: 600)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`HarnessConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = lookup("HDLFORGE_SOURCE_REPO") {
            config.source_repo = PathBuf::from(val);
        }
        if let Some(val) = lookup("HDLFORGE_REGISTRY") {
            config.registry_path = PathBuf::from(val);
        }

        if let Some(val) = lookup("HDLFORGE_BACKEND") {
            config.backend = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "HDLFORGE_BACKEND".to_string(),
                message,
            })?;
        }
        if let Some(val) = lookup("HDLFORGE_DOCKER_IMAGE") {
            config.docker_image = val;
        }
        if let Some(val) = lookup("HDLFORGE_DOCKER_MEMORY") {
            config.docker_memory = Some(val).filter(|v| !v.is_empty());
        }
        if let Some(val) = lookup("HDLFORGE_SCRATCH_DIR") {
            config.scratch_dir = Some(PathBuf::from(val));
        }

        if let Some(val) = lookup("HDLFORGE_CONCURRENCY") {
            config.concurrency = parse_env_value(&val, "HDLFORGE_CONCURRENCY")?;
        }
        if let Some(val) = lookup("HDLFORGE_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "HDLFORGE_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("HDLFORGE_BUILD_COMMAND") {
            config.build_command = val;
        }
        if let Some(val) = lookup("HDLFORGE_TEST_COMMAND") {
            config.test_command = val;
        }
        if let Some(val) = lookup("HDLFORGE_BUILD_TIMEOUT_SECS") {
            config.build_timeout = parse_secs(&val, "HDLFORGE_BUILD_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("HDLFORGE_TEST_TIMEOUT_SECS") {
            config.test_timeout = parse_secs(&val, "HDLFORGE_TEST_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("HDLFORGE_PATCH_TIMEOUT_SECS") {
            config.patch_timeout = parse_secs(&val, "HDLFORGE_PATCH_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("HDLFORGE_CHECKOUT_TIMEOUT_SECS") {
            config.checkout_timeout = parse_secs(&val, "HDLFORGE_CHECKOUT_TIMEOUT_SECS")?;
        }

        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.build_command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "build_command cannot be empty".to_string(),
            ));
        }
        if self.test_command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "test_command cannot be empty".to_string(),
            ));
        }
        for (name, timeout) in [
            ("build_timeout", self.build_timeout),
            ("test_timeout", self.test_timeout),
            ("patch_timeout", self.patch_timeout),
            ("checkout_timeout", self.checkout_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.backend == Backend::Docker && self.docker_image.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "docker_image cannot be empty with the docker backend".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_source_repo(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_repo = path.into();
        self
    }

    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = path.into();
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_docker_image(mut self, image: impl Into<String>) -> Self {
        self.docker_image = image.into();
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_build_command(mut self, command: impl Into<String>) -> Self {
        self.build_command = command.into();
        self
    }

    pub fn with_test_command(mut self, command: impl Into<String>) -> Self {
        self.test_command = command.into();
        self
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    pub fn source(&self) -> SourceRepo {
        SourceRepo::new(&self.source_repo)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(self.concurrency).with_max_attempts(self.max_attempts)
    }

    pub fn environment_builder(&self) -> Arc<dyn EnvironmentBuilder> {
        match self.backend {
            Backend::Local => {
                let mut builder = LocalEnvironmentBuilder::new(self.source())
                    .with_checkout_timeout(self.checkout_timeout);
                if let Some(dir) = &self.scratch_dir {
                    builder = builder.with_scratch_dir(dir);
                }
                Arc::new(builder)
            }
            Backend::Docker => {
                let mut builder = DockerEnvironmentBuilder::new(self.source(), &self.docker_image)
                    .with_checkout_timeout(self.checkout_timeout);
                if let Some(memory) = &self.docker_memory {
                    builder = builder.with_memory(memory);
                }
                Arc::new(builder)
            }
        }
    }

    pub fn runner(&self) -> GradingRunner {
        let toolchain = CommandToolchain::new(&self.build_command, &self.test_command)
            .with_build_timeout(self.build_timeout)
            .with_test_timeout(self.test_timeout);
        GradingRunner::new(Arc::new(toolchain)).with_patch_timeout(self.patch_timeout)
    }

    pub fn patch_generator(&self) -> PatchGenerator {
        PatchGenerator::new(self.source())
    }

    pub fn validator(&self) -> Validator {
        Validator::new(self.environment_builder(), self.patch_generator(), self.runner())
    }

    pub fn grader(&self) -> Grader {
        Grader::new(self.environment_builder(), self.patch_generator(), self.runner())
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}
