use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a query is turned into agent invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One invocation of the default agent.
    #[default]
    Direct,
    /// Ask the configured planner for an ordered list of steps.
    Planner,
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Direct or planner dispatch.
    pub mode: DispatchMode,
    /// Overrides the registry's default agent.
    pub default_agent: Option<String>,
    /// A queued job is waited on for `timeout * factor + grace`.
    pub queue_wait_factor: u32,
    /// Added to every queue wait.
    pub queue_wait_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Direct,
            default_agent: None,
            queue_wait_factor: 2,
            queue_wait_grace: Duration::from_secs(5),
        }
    }
}

impl OrchestratorConfig {
    /// How long to wait on a queued job whose agent times out after `timeout`.
    pub fn queue_wait(&self, timeout: Duration) -> Duration {
        timeout.saturating_mul(self.queue_wait_factor.max(1)) + self.queue_wait_grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_wait() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.queue_wait(Duration::from_secs(10)), Duration::from_secs(25));
    }

    #[test]
    fn test_mode_spelling() {
        let mode: DispatchMode = serde_json::from_str("\"planner\"").unwrap_or_default();
        assert_eq!(mode, DispatchMode::Planner);
    }
}
