//! Grading of agent-produced solutions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::environment::{Environment, EnvironmentBuilder, EnvironmentRequest, EnvironmentTracker};
use crate::error::HarnessError;
use crate::patch::{Patch, PatchGenerator};
use crate::registry::ProblemSpec;

use super::{GradingRunner, RunOutcome, TestResults};

/// Subscore name of the hidden-test grader.
pub const AGENT_PATCH_GRADER: &str = "AgentPatchGrader";

/// Details attached to a [`Grade`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GradeMetadata {
    pub problem_id: String,
    pub agent_patch: String,
    /// Terminal run state, or the stage that stopped grading.
    pub outcome: String,
    pub reason: Option<String>,
    pub results: Option<TestResults>,
    pub log: Option<String>,
}

/// Weighted score of an agent solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grade {
    subscores: BTreeMap<String, f64>,
    weights: BTreeMap<String, f64>,
    pub metadata: GradeMetadata,
}

impl Grade {
    /// Build a grade, checking that subscores and weights line up, weights
    /// sum to 1 and every subscore is within `[0, 1]`.
    pub fn new(
        subscores: BTreeMap<String, f64>,
        weights: BTreeMap<String, f64>,
        metadata: GradeMetadata,
    ) -> Result<Self, HarnessError> {
        if !subscores.keys().eq(weights.keys()) {
            return Err(HarnessError::InvalidInput(
                "grade subscores and weights must have the same keys".to_string(),
            ));
        }
        let total: f64 = weights.values().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(HarnessError::InvalidInput(format!(
                "grade weights must sum to 1, got {total}"
            )));
        }
        if let Some((name, value)) = subscores.iter().find(|(_, v)| !(0.0..=1.0).contains(*v)) {
            return Err(HarnessError::InvalidInput(format!(
                "subscore '{name}' = {value} is outside [0, 1]"
            )));
        }
        Ok(Self {
            subscores,
            weights,
            metadata,
        })
    }

    /// Grade with a single full-weight subscore.
    pub fn single(name: &str, passed: bool, metadata: GradeMetadata) -> Self {
        let value = if passed { 1.0 } else { 0.0 };
        Self {
            subscores: BTreeMap::from([(name.to_string(), value)]),
            weights: BTreeMap::from([(name.to_string(), 1.0)]),
            metadata,
        }
    }

    pub fn subscores(&self) -> &BTreeMap<String, f64> {
        &self.subscores
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    /// Weighted sum of subscores, clipped to `[0, 1]`.
    pub fn score(&self) -> f64 {
        let score: f64 = self
            .subscores
            .iter()
            .map(|(name, value)| value * self.weights.get(name).copied().unwrap_or(0.0))
            .sum();
        score.clamp(0.0, 1.0)
    }
}

/// Grades agent patches against a problem's hidden tests.
#[derive(Clone)]
pub struct Grader {
    builder: Arc<dyn EnvironmentBuilder>,
    generator: PatchGenerator,
    runner: GradingRunner,
    tracker: EnvironmentTracker,
}

impl Grader {
    pub fn new(
        builder: Arc<dyn EnvironmentBuilder>,
        generator: PatchGenerator,
        runner: GradingRunner,
    ) -> Self {
        Self {
            builder,
            generator,
            runner,
            tracker: EnvironmentTracker::new(),
        }
    }

    pub fn tracker(&self) -> &EnvironmentTracker {
        &self.tracker
    }

    /// Agent patch taken from a branch of the source repository.
    pub async fn patch_from_branch(
        &self,
        problem: &ProblemSpec,
        branch: &str,
    ) -> Result<Patch, HarnessError> {
        self.generator.diff(&problem.baseline, branch).await
    }

    /// Grade `agent_patch` on a fresh baseline: agent patch, then test patch,
    /// then build, then hidden tests.
    pub async fn grade(&self, problem: &ProblemSpec, agent_patch: &Patch) -> Result<Grade, HarnessError> {
        let test_patch = self.generator.diff(&problem.baseline, &problem.test).await?;
        let request = EnvironmentRequest::new(&problem.id, &problem.baseline, "grade");
        let env = Environment::materialize(self.builder.as_ref(), &self.tracker, &request).await?;

        let result = self.grade_in(&env, problem, agent_patch, &test_patch).await;
        env.teardown().await;

        let grade = result?;
        tracing::info!(
            problem_id = %problem.id,
            score = grade.score(),
            outcome = %grade.metadata.outcome,
            "Graded agent patch"
        );
        Ok(grade)
    }

    async fn grade_in(
        &self,
        env: &Environment,
        problem: &ProblemSpec,
        agent_patch: &Patch,
        test_patch: &Patch,
    ) -> Result<Grade, HarnessError> {
        let mut metadata = GradeMetadata {
            problem_id: problem.id.clone(),
            agent_patch: agent_patch.text().to_string(),
            ..Default::default()
        };

        if let Err(e) = self.runner.apply_patches(env, &[agent_patch, test_patch]).await {
            metadata.outcome = "patch_failed".to_string();
            metadata.reason = Some(e.to_string());
            return Ok(Grade::single(AGENT_PATCH_GRADER, false, metadata));
        }

        let compile = self.runner.toolchain().compile(env).await?;
        if !compile.success {
            metadata.outcome = "agent-patch-compiles".to_string();
            metadata.reason = Some(format!("build exited with {}", compile.exit_code));
            metadata.log = Some(compile.log);
            return Ok(Grade::single(AGENT_PATCH_GRADER, false, metadata));
        }

        let outcome = self.runner.run(env, &[], &problem.test_files).await;
        metadata.outcome = outcome.state().to_string();
        let passed = matches!(outcome, RunOutcome::TestsPassed(_));
        match outcome {
            RunOutcome::TestsPassed(run) | RunOutcome::TestsFailed(run) => {
                metadata.reason = (!passed).then(|| run.results.failing_ids().join(", "));
                metadata.results = Some(run.results);
                metadata.log = Some(run.log);
            }
            RunOutcome::TestError(e) | RunOutcome::PatchFailed(e) => {
                metadata.reason = Some(format!("{}: {}", e.kind(), e));
            }
        }
        Ok(Grade::single(AGENT_PATCH_GRADER, passed, metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_grade_score() {
        let pass = Grade::single(AGENT_PATCH_GRADER, true, GradeMetadata::default());
        let fail = Grade::single(AGENT_PATCH_GRADER, false, GradeMetadata::default());
        assert_eq!(pass.score(), 1.0);
        assert_eq!(fail.score(), 0.0);
        assert_eq!(pass.weights()[AGENT_PATCH_GRADER], 1.0);
    }

    #[test]
    fn test_weighted_grade() {
        let grade = Grade::new(
            BTreeMap::from([("tests".to_string(), 1.0), ("lint".to_string(), 0.5)]),
            BTreeMap::from([("tests".to_string(), 0.8), ("lint".to_string(), 0.2)]),
            GradeMetadata::default(),
        )
        .unwrap();
        assert!((grade.score() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_grade_rejects_mismatched_keys() {
        let err = Grade::new(
            BTreeMap::from([("a".to_string(), 1.0)]),
            BTreeMap::from([("b".to_string(), 1.0)]),
            GradeMetadata::default(),
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidInput(_)));
    }

    #[test]
    fn test_grade_rejects_bad_weights_and_subscores() {
        assert!(Grade::new(
            BTreeMap::from([("a".to_string(), 1.0)]),
            BTreeMap::from([("a".to_string(), 0.5)]),
            GradeMetadata::default(),
        )
        .is_err());
        assert!(Grade::new(
            BTreeMap::from([("a".to_string(), 1.5)]),
            BTreeMap::from([("a".to_string(), 1.0)]),
            GradeMetadata::default(),
        )
        .is_err());
    }

    #[test]
    fn test_grade_serialization() {
        let grade = Grade::single(
            AGENT_PATCH_GRADER,
            true,
            GradeMetadata {
                problem_id: "fifo".to_string(),
                outcome: "tests_passed".to_string(),
                ..Default::default()
            },
        );
        let json = serde_json::to_value(&grade).unwrap();
        assert_eq!(json["subscores"][AGENT_PATCH_GRADER], 1.0);
        assert_eq!(json["metadata"]["problem_id"], "fifo");
    }
}
