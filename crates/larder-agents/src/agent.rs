use crate::descriptor::{AgentDescriptor, AgentOverrides};
use crate::plugin::Plugin;
use async_trait::async_trait;
use larder_core::wire::check_payload;
use larder_core::{LarderError, LarderResult, Payload};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-execution context handed to an agent.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Invocation being executed.
    pub invocation_id: Uuid,
    /// Session the invocation belongs to, if any.
    pub session_id: Option<String>,
    /// The instance's resolved initial state.
    pub state: Payload,
}

impl AgentContext {
    /// Context for one invocation.
    pub fn new(invocation_id: Uuid) -> Self {
        Self {
            invocation_id,
            session_id: None,
            state: Payload::new(),
        }
    }

    /// Attach the owning session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// A unit of work selected by registry name.
#[async_trait]
pub trait Agent: Send + Sync {
    /// One-line description of what the agent does.
    fn describe(&self) -> &str;

    /// Run the agent on `input`. Business failures are [`LarderError::Agent`].
    async fn execute(&self, ctx: &AgentContext, input: Payload) -> LarderResult<Payload>;

    /// Called after the execution future has been dropped on timeout.
    async fn cancel(&self, _ctx: &AgentContext) {}
}

/// A constructed agent with its timeout, plugins and state resolved.
#[derive(Clone)]
pub struct AgentInstance {
    name: String,
    agent: Arc<dyn Agent>,
    timeout: Duration,
    plugins: Vec<Arc<dyn Plugin>>,
    state: Payload,
    long_running: bool,
}

impl AgentInstance {
    /// Build an instance from a descriptor, applying `overrides` over its defaults.
    pub fn construct(descriptor: &AgentDescriptor, overrides: AgentOverrides) -> LarderResult<Self> {
        let timeout = overrides.timeout.unwrap_or(descriptor.defaults.timeout);
        if timeout.is_zero() {
            return Err(LarderError::Configuration(format!(
                "agent '{}' cannot run with a zero timeout",
                descriptor.name
            )));
        }

        let plugins = overrides
            .plugins
            .unwrap_or_else(|| descriptor.defaults.plugins.clone());

        let mut state = descriptor.defaults.initial_state.clone();
        if let Some(extra) = overrides.initial_state {
            state.extend(extra);
        }
        descriptor.check_state_shape(&state)?;
        check_payload(&state)
            .map_err(|e| LarderError::Configuration(format!("agent '{}' state: {}", descriptor.name, e.message())))?;

        let agent = descriptor.factory.create(&state)?;
        Ok(Self {
            name: descriptor.name.clone(),
            agent,
            timeout,
            plugins,
            state,
            long_running: descriptor.defaults.long_running,
        })
    }

    /// Canonical agent name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective execution timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Merged initial state.
    pub fn state(&self) -> &Payload {
        &self.state
    }

    /// Plugins in execution order.
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Whether the agent is dispatched through the queue.
    pub fn is_long_running(&self) -> bool {
        self.long_running
    }

    /// The agent's own description.
    pub fn describe(&self) -> &str {
        self.agent.describe()
    }

    /// Run the agent under its timeout with plugins applied.
    ///
    /// On expiry the execution future is dropped, the agent's cancel hook
    /// runs, and [`LarderError::Timeout`] is returned.
    pub async fn execute(&self, ctx: AgentContext, mut input: Payload) -> LarderResult<Payload> {
        let ctx = AgentContext {
            state: self.state.clone(),
            ..ctx
        };

        for plugin in &self.plugins {
            plugin.before_execute(&mut input)?;
        }

        debug!(agent = %self.name, invocation_id = %ctx.invocation_id, "Executing agent");
        match tokio::time::timeout(self.timeout, self.agent.execute(&ctx, input)).await {
            Ok(Ok(mut output)) => {
                for plugin in &self.plugins {
                    plugin.after_execute(&mut output)?;
                }
                Ok(output)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    agent = %self.name,
                    invocation_id = %ctx.invocation_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Agent timed out, cancelling"
                );
                self.agent.cancel(&ctx).await;
                Err(LarderError::Timeout(format!(
                    "agent '{}' exceeded {}ms",
                    self.name,
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

impl std::fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentInstance")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("plugins", &self.plugins.len())
            .field("state", &self.state)
            .field("long_running", &self.long_running)
            .finish_non_exhaustive()
    }
}
