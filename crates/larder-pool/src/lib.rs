//! Connection pool for realtime delivery.
//!
//! [`ConnectionPool`] holds every duplex client connection, indexes them by
//! session, and fans events out to a session without letting one slow or
//! dead connection hold up the others. [`HeartbeatMonitor`] enforces
//! liveness and expires idle sessions.

/// Connection records.
pub mod connection;
/// Liveness monitor.
pub mod heartbeat;
/// The pool itself.
pub mod pool;
/// Session records.
pub mod session;

pub use connection::{Connection, ConnectionInfo, ConnectionState};
pub use heartbeat::{HeartbeatMonitor, TickReport};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use session::Session;
