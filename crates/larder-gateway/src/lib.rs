//! WebSocket gateway for the Larder dispatch core.
//!
//! Clients connect on `/ws`, optionally naming a session, and exchange JSON
//! envelopes. Queries are handed to the orchestrator; its events come back
//! through the connection pool. `/health`, `/metrics`, `/metrics/history`
//! and `DELETE /sessions/{id}` round out the HTTP surface.
//!
//! # Main types
//!
//! - [`GatewayServer`]: Builds the axum router and starts background tasks.
//! - [`MessageRouter`]: Routes inbound frames to the orchestrator or the pool.
//! - [`MetricsAggregator`]: Cached point-in-time and sampled pool metrics.

/// Pool metrics.
pub mod metrics;
/// Inbound frame routing.
pub mod router;
/// HTTP and WebSocket server.
pub mod server;

pub use metrics::{MetricsAggregator, MetricsConfig, PoolMetricsSnapshot};
pub use router::{MessageRouter, Routed};
pub use server::{AppState, BackgroundTasks, GatewayServer};
