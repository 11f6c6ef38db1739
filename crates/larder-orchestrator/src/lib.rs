//! Query orchestration for the Larder dispatch core.
//!
//! The orchestrator turns a client query into one or more agent invocations,
//! runs them inline or through the task queue, and streams each one's
//! lifecycle to the query's session.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Plans a query, dispatches its steps, aggregates the outcome.
//! - [`Planner`]: Strategy that turns a query into [`PlanStep`]s.
//! - [`InvocationTracker`]: In-flight invocations indexed by session.
//! - [`OrchestrationResult`]: Aggregated `final` output and per-step outcomes.

/// Dispatch mode and wait settings.
pub mod config;
/// The orchestration engine.
pub mod engine;
/// Planners.
pub mod planner;
/// In-flight invocation tracking.
pub mod tracker;

pub use config::{DispatchMode, OrchestratorConfig};
pub use engine::{InvocationStats, OrchestrationResult, Orchestrator, StepOutcome};
pub use planner::{DirectPlanner, PlanStep, Planner, StaticPlanner};
pub use tracker::InvocationTracker;
