//! Wires configuration into a running stack.

use crate::config::LarderConfig;
use larder_agents::AgentRegistry;
use larder_core::{LarderError, LarderResult, SessionBus};
use larder_gateway::AppState;
use larder_orchestrator::{DispatchMode, Orchestrator, StaticPlanner};
use larder_pool::ConnectionPool;
use larder_queue::{InProcessQueue, LazyBackend, TaskQueueAdapter};
use std::sync::Arc;
use tracing::info;

/// Validate everything `serve` would build, without binding or spawning.
pub fn check(config: &LarderConfig) -> LarderResult<Arc<AgentRegistry>> {
    let registry = Arc::new(config.build_registry()?);
    if config.orchestrator.mode == DispatchMode::Planner {
        if config.orchestrator.steps.is_empty() {
            return Err(LarderError::Configuration(
                "planner mode needs at least one [[orchestrator.steps]] entry".into(),
            ));
        }
        for step in &config.orchestrator.steps {
            registry.resolve(&step.agent).map_err(|_| {
                LarderError::Configuration(format!("plan step names unknown agent '{}'", step.agent))
            })?;
        }
    }
    let bus: Arc<dyn SessionBus> = Arc::new(ConnectionPool::new(config.pool.to_pool_config()));
    Orchestrator::new(registry.clone(), bus, config.orchestrator.to_config())?;
    Ok(registry)
}

/// Build the pool, queue, orchestrator and gateway state. The queue's
/// workers start on the first long-running job. Must run inside a tokio
/// runtime.
pub fn build_state(config: &LarderConfig) -> LarderResult<Arc<AppState>> {
    let registry = check(config)?;
    let pool = Arc::new(ConnectionPool::new(config.pool.to_pool_config()));
    let bus: Arc<dyn SessionBus> = pool.clone();

    let mut orchestrator = Orchestrator::new(registry.clone(), bus, config.orchestrator.to_config())?;
    if config.orchestrator.mode == DispatchMode::Planner {
        let planner = StaticPlanner::new(config.orchestrator.steps.clone())?;
        orchestrator = orchestrator.with_planner(Arc::new(planner));
    }
    if config.queue.enabled {
        let workers = config.queue.to_inprocess_config();
        let adapter = TaskQueueAdapter::start(config.queue.to_adapter_config(), move |reports| {
            LazyBackend::new(move || {
                Ok(InProcessQueue::new(registry.clone(), workers.clone(), reports.clone()))
            })
        });
        orchestrator = orchestrator.with_queue(Arc::new(adapter));
        info!(workers = config.queue.workers, "Task queue attached");
    }

    Ok(AppState::new(
        pool,
        Arc::new(orchestrator),
        config.metrics.to_config(),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use larder_core::{ErrorKind, InvocationStatus};

    #[tokio::test]
    async fn test_built_stack_answers_queries() {
        let config = LarderConfig::parse("[orchestrator]\ndefault_agent = \"sleep\"\n").unwrap();
        let state = build_state(&config).unwrap();

        let result = state.orchestrator.process_query("hello", "S1").await.unwrap();
        assert_eq!(result.status, InvocationStatus::Succeeded);
        assert_eq!(state.orchestrator.queue().unwrap().stats().succeeded, 1);
        assert!(state.pool.session("S1").is_some());
    }

    #[tokio::test]
    async fn test_planner_mode_runs_steps() {
        let config = LarderConfig::parse(
            "[orchestrator]\nmode = \"planner\"\n[[orchestrator.steps]]\nagent = \"echo\"\n[[orchestrator.steps]]\nagent = \"boom\"\nbest_effort = true\n",
        )
        .unwrap();
        let state = build_state(&config).unwrap();
        let result = state.orchestrator.process_query("hi", "S1").await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.steps.len(), 2);
    }

    #[test]
    fn test_check_rejects_bad_plans() {
        let empty = LarderConfig::parse("[orchestrator]\nmode = \"planner\"\n").unwrap();
        assert_eq!(check(&empty).unwrap_err().kind(), ErrorKind::ConfigurationError);

        let unknown = LarderConfig::parse(
            "[orchestrator]\nmode = \"planner\"\n[[orchestrator.steps]]\nagent = \"chef\"\n",
        )
        .unwrap();
        assert_eq!(check(&unknown).unwrap_err().kind(), ErrorKind::ConfigurationError);

        let no_default = LarderConfig::parse("builtins = false\n[orchestrator]\n").unwrap();
        assert!(check(&no_default).is_err());
    }
}
