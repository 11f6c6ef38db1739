//! Tracing subscriber setup shared by binaries and integration harnesses.

use crate::error::{LarderError, LarderResult};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter`. With `json = true` every event is
/// emitted as one JSON object per line.
pub fn init_tracing(default_filter: &str, json: bool) -> LarderResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| LarderError::Configuration(format!("invalid log filter '{default_filter}': {e}")))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| LarderError::Configuration(format!("tracing already initialised: {e}")))
}
