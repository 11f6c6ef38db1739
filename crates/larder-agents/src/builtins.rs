//! Diagnostic agents shipped with every deployment.
//!
//! - `echo` (alias `repeat`): returns the input text, optionally prefixed.
//! - `delay` (alias `sleep`): long-running; waits `delay_ms` then echoes.
//! - `fail` (alias `boom`): always reports an agent error.

use crate::agent::{Agent, AgentContext};
use crate::descriptor::{AgentDescriptor, AgentFactory};
use crate::registry::AgentRegistryBuilder;
use async_trait::async_trait;
use larder_core::{LarderError, LarderResult, Payload};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Built-in agent kinds that configuration can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// Returns the input text.
    Echo,
    /// Waits, then echoes.
    Delay,
    /// Always fails with `agent_error`.
    Fail,
}

impl BuiltinKind {
    /// Configuration spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinKind::Echo => "echo",
            BuiltinKind::Delay => "delay",
            BuiltinKind::Fail => "fail",
        }
    }

    /// A descriptor named `name` backed by this kind, with the kind's state
    /// shape and long-running default.
    pub fn descriptor(&self, name: impl Into<String>) -> AgentDescriptor {
        match self {
            BuiltinKind::Echo => {
                let factory: Arc<dyn AgentFactory> = Arc::new(
                    |state: &Payload| -> LarderResult<Arc<dyn Agent>> {
                        Ok(Arc::new(EchoAgent::from_state(state)))
                    },
                );
                AgentDescriptor::new(name, factory)
                    .description("Returns the input text")
                    .state_keys(["prefix"])
            }
            BuiltinKind::Delay => {
                let factory: Arc<dyn AgentFactory> = Arc::new(
                    |state: &Payload| -> LarderResult<Arc<dyn Agent>> {
                        Ok(Arc::new(DelayAgent::from_state(state)?))
                    },
                );
                AgentDescriptor::new(name, factory)
                    .description("Waits delay_ms milliseconds, then echoes")
                    .state_keys(["delay_ms"])
                    .long_running(true)
            }
            BuiltinKind::Fail => {
                let factory: Arc<dyn AgentFactory> = Arc::new(
                    |state: &Payload| -> LarderResult<Arc<dyn Agent>> {
                        Ok(Arc::new(FailAgent::from_state(state)))
                    },
                );
                AgentDescriptor::new(name, factory)
                    .description("Always fails with an agent error")
                    .state_keys(["message"])
            }
        }
    }
}

impl FromStr for BuiltinKind {
    type Err = LarderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "echo" => Ok(BuiltinKind::Echo),
            "delay" => Ok(BuiltinKind::Delay),
            "fail" => Ok(BuiltinKind::Fail),
            other => Err(LarderError::Configuration(format!(
                "unknown agent kind '{other}' (expected echo, delay or fail)"
            ))),
        }
    }
}

/// Register `echo`, `delay` and `fail` under their default names and aliases.
pub fn register_builtins(builder: AgentRegistryBuilder) -> AgentRegistryBuilder {
    builder
        .register(BuiltinKind::Echo.descriptor("echo").alias("repeat"))
        .register(BuiltinKind::Delay.descriptor("delay").alias("sleep"))
        .register(BuiltinKind::Fail.descriptor("fail").alias("boom"))
}

fn input_text(input: &Payload) -> String {
    input
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Echoes `text`, prepending the `prefix` state value when set.
#[derive(Debug, Default)]
pub struct EchoAgent {
    prefix: String,
}

impl EchoAgent {
    /// Build from initial state.
    pub fn from_state(state: &Payload) -> Self {
        Self {
            prefix: state
                .get("prefix")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn describe(&self) -> &str {
        "Returns the input text"
    }

    async fn execute(&self, _ctx: &AgentContext, input: Payload) -> LarderResult<Payload> {
        let text = format!("{}{}", self.prefix, input_text(&input));
        Ok(json_object(json!({ "text": text })))
    }
}

/// Sleeps before echoing. `delay_ms` in the input wins over the state default.
#[derive(Debug)]
pub struct DelayAgent {
    default_delay: Duration,
}

impl DelayAgent {
    /// Build from initial state.
    pub fn from_state(state: &Payload) -> LarderResult<Self> {
        let ms = match state.get("delay_ms") {
            None => 0,
            Some(v) => v.as_u64().ok_or_else(|| {
                LarderError::Configuration(format!("delay_ms must be a non-negative integer, got {v}"))
            })?,
        };
        Ok(Self {
            default_delay: Duration::from_millis(ms),
        })
    }
}

#[async_trait]
impl Agent for DelayAgent {
    fn describe(&self) -> &str {
        "Waits delay_ms milliseconds, then echoes"
    }

    async fn execute(&self, ctx: &AgentContext, input: Payload) -> LarderResult<Payload> {
        let delay = match input.get("delay_ms") {
            None => self.default_delay,
            Some(v) => Duration::from_millis(v.as_u64().ok_or_else(|| {
                LarderError::Agent(format!("delay_ms must be a non-negative integer, got {v}"))
            })?),
        };
        debug!(invocation_id = %ctx.invocation_id, delay_ms = delay.as_millis() as u64, "Delaying");
        tokio::time::sleep(delay).await;
        Ok(json_object(json!({
            "text": input_text(&input),
            "delayed_ms": delay.as_millis() as u64,
        })))
    }

    async fn cancel(&self, ctx: &AgentContext) {
        debug!(invocation_id = %ctx.invocation_id, "Delay cancelled");
    }
}

/// Reports a business failure on every call.
#[derive(Debug)]
pub struct FailAgent {
    message: String,
}

impl FailAgent {
    /// Build from initial state.
    pub fn from_state(state: &Payload) -> Self {
        Self {
            message: state
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("agent failed on purpose")
                .to_string(),
        }
    }
}

#[async_trait]
impl Agent for FailAgent {
    fn describe(&self) -> &str {
        "Always fails with an agent error"
    }

    async fn execute(&self, _ctx: &AgentContext, _input: Payload) -> LarderResult<Payload> {
        Err(LarderError::Agent(self.message.clone()))
    }
}

fn json_object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
