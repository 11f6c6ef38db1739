//! Agent registry and agent instances for the Larder dispatch core.
//!
//! Agents are selected only by registry name or alias. The registry is built
//! once at startup and shared read-only behind an `Arc`.
//!
//! # Main types
//!
//! - [`AgentRegistry`]: Immutable, case-insensitive name/alias/intent lookup.
//! - [`AgentDescriptor`]: Name, aliases, typed defaults, and the factory.
//! - [`AgentInstance`]: A constructed agent with timeout and plugins applied.
//! - [`Agent`]: The trait every agent kind implements.
//! - [`Plugin`]: Hooks wrapped around each execution.

/// The agent trait and constructed instances.
pub mod agent;
/// Built-in diagnostic agents.
pub mod builtins;
/// Agent descriptors, defaults and overrides.
pub mod descriptor;
/// Execution hooks.
pub mod plugin;
/// The agent registry.
pub mod registry;

pub use agent::{Agent, AgentContext, AgentInstance};
pub use builtins::{register_builtins, BuiltinKind};
pub use descriptor::{AgentDefaults, AgentDescriptor, AgentFactory, AgentOverrides, DEFAULT_AGENT_TIMEOUT};
pub use plugin::Plugin;
pub use registry::{AgentRegistry, AgentRegistryBuilder};
