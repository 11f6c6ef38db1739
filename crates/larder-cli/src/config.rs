//! `larder.toml` loading.
//!
//! Every section is optional and every field has a default, so an empty file
//! is a valid configuration: builtins only, direct dispatch to `echo`.

use larder_agents::{register_builtins, AgentRegistry, BuiltinKind};
use larder_core::{LarderError, LarderResult, Payload};
use larder_gateway::MetricsConfig;
use larder_orchestrator::{DispatchMode, OrchestratorConfig, PlanStep};
use larder_pool::PoolConfig;
use larder_queue::{AdapterConfig, InProcessConfig, RetryPolicy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level `larder.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct LarderConfig {
    /// Listener address.
    #[serde(default)]
    pub server: ServerConfig,
    /// Connection limits and liveness.
    #[serde(default)]
    pub pool: PoolSection,
    /// Task queue for long-running agents.
    #[serde(default)]
    pub queue: QueueSection,
    /// Dispatch mode and queue waits.
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    /// Snapshot caching and history.
    #[serde(default)]
    pub metrics: MetricsSection,
    /// Tracing output.
    #[serde(default)]
    pub logging: LoggingSection,
    /// Register `echo`, `delay` and `fail` before the configured agents.
    #[serde(default = "default_true")]
    pub builtins: bool,
    /// Extra agents built from the built-in kinds.
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    /// Intent label -> agent name.
    #[serde(default)]
    pub intents: BTreeMap<String, String>,
}

/// `[server]`
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// `[pool]`
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    /// Heartbeat period; silence for two periods disconnects.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// Outbound events buffered per connection.
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    /// How long a full buffer may stall delivery before the connection is dropped.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Upper bound on open connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long an empty session is kept.
    #[serde(default = "default_session_ttl_secs")]
    pub session_idle_ttl_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_secs(),
            buffer: default_buffer(),
            send_timeout_ms: default_send_timeout_ms(),
            max_connections: default_max_connections(),
            session_idle_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl PoolSection {
    /// Runtime pool settings.
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            buffer: self.buffer.max(1),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            max_connections: self.max_connections,
            session_idle_ttl: Duration::from_secs(self.session_idle_ttl_secs),
        }
    }
}

/// `[queue]`
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    /// Without a queue, long-running agents run inline.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Jobs waiting for a worker before enqueue reports the backend busy.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Re-runs of a job whose worker panicked.
    #[serde(default = "default_redeliveries")]
    pub max_redeliveries: u32,
    /// Terminal job records kept for polling.
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Enqueue backoff.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: default_workers(),
            capacity: default_capacity(),
            max_redeliveries: default_redeliveries(),
            retention: default_retention(),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueSection {
    /// Adapter settings.
    pub fn to_adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            retry: self.retry.clone(),
            retention: self.retention,
        }
    }

    /// Worker pool settings.
    pub fn to_inprocess_config(&self) -> InProcessConfig {
        InProcessConfig {
            workers: self.workers.max(1),
            capacity: self.capacity.max(1),
            max_redeliveries: self.max_redeliveries,
        }
    }
}

/// `[orchestrator]`
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// `direct` or `planner`.
    #[serde(default)]
    pub mode: DispatchMode,
    /// Agent for direct dispatch and unmapped intents.
    #[serde(default = "default_agent")]
    pub default_agent: Option<String>,
    /// Queue wait is this many agent timeouts plus the grace.
    #[serde(default = "default_wait_factor")]
    pub queue_wait_factor: u32,
    /// Added to every queue wait.
    #[serde(default = "default_wait_grace_secs")]
    pub queue_wait_grace_secs: u64,
    /// Steps for the static planner in `planner` mode.
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Direct,
            default_agent: default_agent(),
            queue_wait_factor: default_wait_factor(),
            queue_wait_grace_secs: default_wait_grace_secs(),
            steps: Vec::new(),
        }
    }
}

impl OrchestratorSection {
    /// Runtime orchestrator settings.
    pub fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            mode: self.mode,
            default_agent: self.default_agent.clone(),
            queue_wait_factor: self.queue_wait_factor,
            queue_wait_grace: Duration::from_secs(self.queue_wait_grace_secs),
        }
    }
}

/// `[metrics]`
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSection {
    /// Maximum age of a cached snapshot.
    #[serde(default = "default_freshness_ms")]
    pub freshness_ms: u64,
    /// Samples kept for `/metrics/history`.
    #[serde(default = "default_history")]
    pub history: usize,
    /// Period of the background sampler.
    #[serde(default = "default_sample_secs")]
    pub sample_interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            freshness_ms: default_freshness_ms(),
            history: default_history(),
            sample_interval_secs: default_sample_secs(),
        }
    }
}

impl MetricsSection {
    /// Aggregator settings.
    pub fn to_config(&self) -> MetricsConfig {
        MetricsConfig {
            freshness: Duration::from_millis(self.freshness_ms),
            history: self.history,
        }
    }

    /// Sampler period, at least one second.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

/// `[logging]`
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// Used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// JSON lines instead of human-readable output.
    #[serde(default = "default_true")]
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: true,
        }
    }
}

/// One `[[agents]]` entry: a named instance of a built-in kind.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    /// Canonical name.
    pub name: String,
    /// Built-in kind: `echo`, `delay` or `fail`.
    pub kind: String,
    /// Alternative names.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Overrides the kind's description.
    #[serde(default)]
    pub description: Option<String>,
    /// Overrides the kind's timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Overrides whether the agent runs through the queue.
    #[serde(default)]
    pub long_running: Option<bool>,
    /// Initial state, merged over the kind's defaults.
    #[serde(default)]
    pub state: Payload,
}

fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_buffer() -> usize {
    64
}
fn default_send_timeout_ms() -> u64 {
    2000
}
fn default_max_connections() -> usize {
    10_000
}
fn default_session_ttl_secs() -> u64 {
    300
}
fn default_workers() -> usize {
    4
}
fn default_capacity() -> usize {
    256
}
fn default_redeliveries() -> u32 {
    2
}
fn default_retention() -> usize {
    1024
}
fn default_agent() -> Option<String> {
    Some("echo".to_string())
}
fn default_wait_factor() -> u32 {
    2
}
fn default_wait_grace_secs() -> u64 {
    5
}
fn default_freshness_ms() -> u64 {
    1000
}
fn default_history() -> usize {
    120
}
fn default_sample_secs() -> u64 {
    10
}
fn default_filter() -> String {
    "info".to_string()
}

impl LarderConfig {
    /// Parse TOML text.
    pub fn parse(text: &str) -> LarderResult<Self> {
        toml::from_str(text).map_err(|e| LarderError::Configuration(format!("invalid config: {e}")))
    }

    /// Read and parse a config file.
    pub async fn load(path: &Path) -> LarderResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            LarderError::Configuration(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::parse(&text)
    }

    /// Build the agent registry: builtins (unless disabled), then every
    /// `[[agents]]` entry, then intents and the default agent. Any clash is
    /// a configuration error.
    pub fn build_registry(&self) -> LarderResult<AgentRegistry> {
        let mut builder = AgentRegistry::builder();
        if self.builtins {
            builder = register_builtins(builder);
        }

        for entry in &self.agents {
            let kind: BuiltinKind = entry.kind.parse()?;
            let mut descriptor = kind.descriptor(entry.name.clone());
            for alias in &entry.aliases {
                descriptor = descriptor.alias(alias.clone());
            }
            if let Some(description) = &entry.description {
                descriptor = descriptor.description(description.clone());
            }
            if let Some(secs) = entry.timeout_secs {
                descriptor = descriptor.timeout(Duration::from_secs(secs));
            }
            if let Some(long_running) = entry.long_running {
                descriptor = descriptor.long_running(long_running);
            }
            if !entry.state.is_empty() {
                descriptor = descriptor.initial_state(entry.state.clone());
            }
            builder = builder.register(descriptor);
        }

        for (intent, agent) in &self.intents {
            builder = builder.map_intent(intent.clone(), agent.clone());
        }
        if let Some(default) = &self.orchestrator.default_agent {
            builder = builder.default_agent(default.clone());
        }
        builder.build()
    }
}
