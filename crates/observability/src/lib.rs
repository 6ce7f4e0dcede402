//! Tracing/logging setup shared by binaries and tests.

/// Initialize process-wide tracing with the default configuration
/// (`RUST_LOG` filter, JSON lines).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
/// Returns `true` if this call installed the subscriber.
pub fn init() -> bool {
    tracing::init_with(&ObservabilityConfig::default())
}

/// Initialize process-wide tracing with an explicit configuration.
pub fn init_with(config: &ObservabilityConfig) -> bool {
    tracing::init_with(config)
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::{LogFormat, ObservabilityConfig, ParseLogFormatError};
