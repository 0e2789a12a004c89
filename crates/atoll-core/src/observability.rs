//! Observability infrastructure for Atoll.
//!
//! Structured logging with consistent spans: every attempt-scoped and
//! cleanup-scoped operation runs inside a span carrying the ids needed to
//! correlate client logs with ATR state on the server.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

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
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `atoll_txn=debug`)
///
/// # Example
///
/// ```rust
/// use atoll_core::observability::{LogFormat, init_logging};
///
/// init_logging(LogFormat::Pretty);
/// ```
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

/// Creates a span for attempt-scoped operations.
///
/// # Example
///
/// ```rust
/// use atoll_core::observability::attempt_span;
///
/// let span = attempt_span("stage_replace", "txn-1", "attempt-1");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn attempt_span(operation: &str, transaction_id: &str, attempt_id: &str) -> Span {
    tracing::info_span!(
        "attempt",
        op = operation,
        transaction_id = transaction_id,
        attempt_id = attempt_id,
    )
}

/// Creates a span for cleanup operations.
#[must_use]
pub fn cleanup_span(operation: &str, atr_id: &str, attempt_id: &str) -> Span {
    tracing::info_span!(
        "cleanup",
        op = operation,
        atr_id = atr_id,
        attempt_id = attempt_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = attempt_span("get", "t", "a");
        let _guard = span.enter();
        tracing::info!("inside attempt span");
    }
}
