//! Observability infrastructure for Conflux.
//!
//! Structured logging with consistent spans. This module provides the
//! initialization helper and span constructors used across all Conflux
//! components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `conflux_ddl=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for coordinator operations with standard fields.
///
/// # Example
///
/// ```rust
/// use conflux_core::observability::coordinator_span;
///
/// let span = coordinator_span("handle_info", "task-1");
/// let _guard = span.enter();
/// // ... handle the event
/// ```
#[must_use]
pub fn coordinator_span(operation: &str, task: &str) -> Span {
    tracing::info_span!("coordinator", op = operation, task = task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty); // Second call should be a no-op
    }

    #[test]
    fn span_helper_creates_span() {
        let span = coordinator_span("test_operation", "task");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }
}
