//! Problem registry.
//!
//! The registry is an immutable table of [`ProblemSpec`]s built once (from
//! code or a YAML file) and then passed by reference to everything that needs
//! it. There is no process-wide registry, so independent tables can coexist,
//! e.g. one per test.

pub mod entry;
pub mod statement;

pub use entry::{Difficulty, HintSpec, HintType, ProblemSpec, ReviewLevel};
pub use statement::{HintMode, DEFAULT_PROMPT_TEMPLATE, STATEMENT_PLACEHOLDER};

use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::RegistryError;

/// Immutable, validated table of problems, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ProblemRegistry {
    problems: Vec<ProblemSpec>,
    index: HashMap<String, usize>,
}

/// On-disk registry layout: either a bare list or a `problems:` mapping.
#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    List(Vec<ProblemSpec>),
    Document { problems: Vec<ProblemSpec> },
}

impl ProblemRegistry {
    /// Build a registry, rejecting duplicate ids and malformed definitions.
    pub fn from_specs(problems: Vec<ProblemSpec>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(problems.len());
        for (i, problem) in problems.iter().enumerate() {
            problem
                .check()
                .map_err(|reason| RegistryError::InvalidProblem {
                    id: problem.id.clone(),
                    reason,
                })?;
            if index.insert(problem.id.clone(), i).is_some() {
                return Err(RegistryError::DuplicateProblem(problem.id.clone()));
            }
        }
        Ok(Self { problems, index })
    }

    /// Parse a registry from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, RegistryError> {
        let problems = match serde_yaml::from_str::<RegistryFile>(content)? {
            RegistryFile::List(problems) => problems,
            RegistryFile::Document { problems } => problems,
        };
        Self::from_specs(problems)
    }

    /// Load a registry from a YAML file.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let registry = Self::from_yaml(&content)?;
        tracing::debug!(
            path = %path.display(),
            problems = registry.len(),
            "Loaded problem registry"
        );
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Result<&ProblemSpec, RegistryError> {
        self.index
            .get(id)
            .map(|&i| &self.problems[i])
            .ok_or_else(|| RegistryError::ProblemNotFound(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProblemSpec> {
        self.problems.iter()
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    /// A new registry holding only the problems selected by `filter`.
    pub fn filter(&self, filter: &RegistryFilter) -> Self {
        let problems: Vec<ProblemSpec> = self
            .problems
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        let index = problems
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();
        Self { problems, index }
    }
}

/// Selection criteria over a registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryFilter {
    /// Only these ids; empty selects every id.
    pub ids: BTreeSet<String>,
    /// Only these review levels; empty selects every level.
    pub review_levels: Vec<ReviewLevel>,
    pub include_too_hard: bool,
    pub include_demo: bool,
}

impl RegistryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_review_levels(mut self, levels: Vec<ReviewLevel>) -> Self {
        self.review_levels = levels;
        self
    }

    pub fn include_too_hard(mut self, include: bool) -> Self {
        self.include_too_hard = include;
        self
    }

    pub fn include_demo(mut self, include: bool) -> Self {
        self.include_demo = include;
        self
    }

    /// Add ids read from a file with one id per line (`-` reads stdin).
    pub fn with_ids_file(mut self, path: &str) -> Result<Self, RegistryError> {
        let content = if path == "-" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        } else {
            std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
                path: path.to_string(),
                source,
            })?
        };
        self.ids.extend(parse_id_lines(&content));
        Ok(self)
    }

    pub fn matches(&self, problem: &ProblemSpec) -> bool {
        if !self.review_levels.is_empty() && !self.review_levels.contains(&problem.review_level)
        {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&problem.id) {
            return false;
        }
        if problem.too_hard && !self.include_too_hard {
            return false;
        }
        if problem.demo && !self.include_demo {
            return false;
        }
        true
    }
}

fn parse_id_lines(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
}
