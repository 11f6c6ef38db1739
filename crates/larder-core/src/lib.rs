//! Core types and error definitions for the Larder dispatch core.
//!
//! This crate provides the foundational types shared across all Larder crates:
//! the error taxonomy, the wire-safety boundary, the invocation state machine,
//! the realtime envelope, and the [`SessionBus`] seam between the orchestrator
//! and the connection pool.
//!
//! # Main types
//!
//! - [`LarderError`]: Unified error enum; every variant has a wire [`ErrorKind`].
//! - [`AgentInvocation`]: One job against an agent, with monotonic status.
//! - [`Envelope`]: The JSON frame exchanged with realtime clients.
//! - [`ErrorDescriptor`]: The `{kind, message}` shape errors are reduced to.
//! - [`SessionBus`]: Session provisioning + delivery seam.

/// Session provisioning and event delivery seam.
pub mod bus;
/// Realtime message envelope.
pub mod envelope;
/// Error taxonomy.
pub mod error;
/// Agent invocation records and their state machine.
pub mod invocation;
/// Tracing subscriber initialisation.
pub mod telemetry;
/// Wire-safety checks and payload conversion.
pub mod wire;

pub use bus::{DeliveryReport, FailedDelivery, SessionBus};
pub use envelope::{Envelope, EventType};
pub use error::{ErrorKind, LarderError, LarderResult};
pub use invocation::{AgentInvocation, InvocationStatus};
pub use wire::{ErrorDescriptor, Payload};
