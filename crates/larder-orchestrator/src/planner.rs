use async_trait::async_trait;
use larder_core::{LarderError, LarderResult, Payload};
use serde::{Deserialize, Serialize};

/// One agent invocation in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Agent name or alias.
    pub agent: String,
    /// Extra input. `text` and `previous` are filled in at dispatch.
    #[serde(default)]
    pub input: Payload,
    /// A failure of this step does not stop the plan.
    #[serde(default)]
    pub best_effort: bool,
    /// What the step is for.
    #[serde(default)]
    pub description: String,
}

impl PlanStep {
    /// Step running `agent`.
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            input: Payload::new(),
            best_effort: false,
            description: String::new(),
        }
    }

    /// Set the extra input.
    pub fn with_input(mut self, input: Payload) -> Self {
        self.input = input;
        self
    }

    /// Let the plan continue if this step fails.
    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    /// Set the description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Turns a query into an ordered list of steps.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Steps for `query`; an empty plan is an error.
    async fn plan(&self, query: &str, session_id: &str) -> LarderResult<Vec<PlanStep>>;
}

/// A single step on one fixed agent.
#[derive(Debug, Clone)]
pub struct DirectPlanner {
    agent: String,
}

impl DirectPlanner {
    /// Send every query to `agent`.
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
        }
    }

    /// The agent every query goes to.
    pub fn agent(&self) -> &str {
        &self.agent
    }
}

#[async_trait]
impl Planner for DirectPlanner {
    async fn plan(&self, _query: &str, _session_id: &str) -> LarderResult<Vec<PlanStep>> {
        Ok(vec![PlanStep::new(self.agent.clone())])
    }
}

/// The same configured steps for every query.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    steps: Vec<PlanStep>,
}

impl StaticPlanner {
    /// Fails on an empty plan.
    pub fn new(steps: Vec<PlanStep>) -> LarderResult<Self> {
        if steps.is_empty() {
            return Err(LarderError::Configuration(
                "a static plan needs at least one step".into(),
            ));
        }
        Ok(Self { steps })
    }

    /// The configured plan.
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _query: &str, _session_id: &str) -> LarderResult<Vec<PlanStep>> {
        Ok(self.steps.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_plan_is_one_step() {
        let steps = DirectPlanner::new("echo").plan("hi", "S1").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].agent, "echo");
        assert!(!steps[0].best_effort);
    }

    #[tokio::test]
    async fn test_static_plan_repeats() {
        let planner = StaticPlanner::new(vec![
            PlanStep::new("echo").describe("draft"),
            PlanStep::new("fail").best_effort(),
        ])
        .unwrap();
        let first = planner.plan("a", "S1").await.unwrap();
        let second = planner.plan("b", "S2").await.unwrap();
        assert_eq!(first, second);
        assert!(first[1].best_effort);
    }

    #[test]
    fn test_empty_static_plan_rejected() {
        assert!(StaticPlanner::new(Vec::new()).is_err());
    }

    #[test]
    fn test_step_from_config_json() {
        let step: PlanStep = serde_json::from_str(r#"{"agent": "delay", "input": {"delay_ms": 5}}"#).unwrap();
        assert_eq!(step.input["delay_ms"], 5);
        assert!(step.description.is_empty());
    }
}
