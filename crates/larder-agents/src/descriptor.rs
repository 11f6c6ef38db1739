use crate::agent::Agent;
use crate::plugin::Plugin;
use larder_core::{LarderError, LarderResult, Payload};
use std::sync::Arc;
use std::time::Duration;

/// Timeout applied when neither the descriptor nor the caller sets one.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds a fresh [`Agent`] from its resolved initial state.
pub trait AgentFactory: Send + Sync {
    /// Construct an agent with `state` as its initial state.
    fn create(&self, state: &Payload) -> LarderResult<Arc<dyn Agent>>;
}

impl<F> AgentFactory for F
where
    F: Fn(&Payload) -> LarderResult<Arc<dyn Agent>> + Send + Sync,
{
    fn create(&self, state: &Payload) -> LarderResult<Arc<dyn Agent>> {
        self(state)
    }
}

/// Construction defaults carried by a descriptor.
#[derive(Clone)]
pub struct AgentDefaults {
    /// Execution timeout.
    pub timeout: Duration,
    /// Plugins every instance starts with.
    pub plugins: Vec<Arc<dyn Plugin>>,
    /// State every instance starts with.
    pub initial_state: Payload,
    /// Declared shape of the state blob. `None` accepts any key.
    pub state_keys: Option<Vec<String>>,
    /// Dispatch through the task queue instead of inline.
    pub long_running: bool,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_AGENT_TIMEOUT,
            plugins: Vec::new(),
            initial_state: Payload::new(),
            state_keys: None,
            long_running: false,
        }
    }
}

impl std::fmt::Debug for AgentDefaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDefaults")
            .field("timeout", &self.timeout)
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("initial_state", &self.initial_state)
            .field("state_keys", &self.state_keys)
            .field("long_running", &self.long_running)
            .finish()
    }
}

/// Per-construction overrides. Every field falls back to the descriptor.
#[derive(Clone, Default)]
pub struct AgentOverrides {
    /// Replaces the default timeout.
    pub timeout: Option<Duration>,
    /// Replaces the default plugins.
    pub plugins: Option<Vec<Arc<dyn Plugin>>>,
    /// Merged key by key over the descriptor's initial state.
    pub initial_state: Option<Payload>,
}

impl AgentOverrides {
    /// Override the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the plugins.
    pub fn with_plugins(mut self, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Merge `state` over the defaults.
    pub fn with_state(mut self, state: Payload) -> Self {
        self.initial_state = Some(state);
        self
    }
}

/// Everything the registry knows about one kind of agent.
#[derive(Clone)]
pub struct AgentDescriptor {
    /// Canonical name.
    pub name: String,
    /// Alternative names.
    pub aliases: Vec<String>,
    /// Human-readable summary.
    pub description: String,
    /// Construction defaults.
    pub defaults: AgentDefaults,
    /// Builds the concrete agent.
    pub factory: Arc<dyn AgentFactory>,
}

impl AgentDescriptor {
    /// Descriptor with default settings.
    pub fn new(name: impl Into<String>, factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            description: String::new(),
            defaults: AgentDefaults::default(),
            factory,
        }
    }

    /// Add an alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout = timeout;
        self
    }

    /// Mark as dispatched through the queue.
    pub fn long_running(mut self, long_running: bool) -> Self {
        self.defaults.long_running = long_running;
        self
    }

    /// Append a default plugin.
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.defaults.plugins.push(plugin);
        self
    }

    /// Set the default state.
    pub fn initial_state(mut self, state: Payload) -> Self {
        self.defaults.initial_state = state;
        self
    }

    /// Restrict state to these keys.
    pub fn state_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.defaults.state_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Reject descriptors that can never be constructed.
    pub fn validate(&self) -> LarderResult<()> {
        if self.name.trim().is_empty() {
            return Err(LarderError::Configuration(
                "agent descriptor has an empty name".into(),
            ));
        }
        if let Some(alias) = self.aliases.iter().find(|a| a.trim().is_empty()) {
            return Err(LarderError::Configuration(format!(
                "agent '{}' has a blank alias '{alias}'",
                self.name
            )));
        }
        if self.defaults.timeout.is_zero() {
            return Err(LarderError::Configuration(format!(
                "agent '{}' has a zero timeout",
                self.name
            )));
        }
        self.check_state_shape(&self.defaults.initial_state)
    }

    /// Every key of `state` must belong to the declared shape, if any.
    pub fn check_state_shape(&self, state: &Payload) -> LarderResult<()> {
        let Some(keys) = &self.defaults.state_keys else {
            return Ok(());
        };
        match state.keys().find(|k| !keys.contains(k)) {
            Some(key) => Err(LarderError::Configuration(format!(
                "agent '{}' does not accept state key '{key}' (accepted: {})",
                self.name,
                keys.join(", ")
            ))),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("description", &self.description)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}
