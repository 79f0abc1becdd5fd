//! Internal diagnostics sink.
//!
//! Grounded on `opentelemetry/src/global/internal_logging.rs`'s
//! `otel_debug!`/`otel_warn!` macros: a default implementation forwards to
//! the `tracing` crate behind an `internal-logs` cargo feature; disabling
//! the feature compiles the calls out entirely rather than merely silencing
//! them at runtime, so hosts that don't want `tracing` pulled in
//! transitively can opt out for good.

use std::fmt;

/// Severity of an internal diagnostic message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Sink interface the host may inject in place of the default.
pub trait Logger: Send + Sync + fmt::Debug {
    fn log(&self, level: Level, message: &str, error: Option<&(dyn std::error::Error + 'static)>);
}

/// Drops every message. Used when the host supplies no logger and the
/// `internal-logs` feature is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: Level, _message: &str, _error: Option<&(dyn std::error::Error + 'static)>) {}
}

/// Forwards to the `tracing` crate at the matching level, mirroring
/// `otel_debug!`/`otel_info!`/`otel_warn!`/`otel_error!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    #[allow(unused_variables)]
    fn log(&self, level: Level, message: &str, error: Option<&(dyn std::error::Error + 'static)>) {
        #[cfg(feature = "internal-logs")]
        {
            let error_display = error.map(|e| e.to_string()).unwrap_or_default();
            match level {
                Level::Debug => tracing::debug!(target: "dd_trace_core", error = %error_display, "{}", message),
                Level::Info => tracing::info!(target: "dd_trace_core", error = %error_display, "{}", message),
                Level::Warn => tracing::warn!(target: "dd_trace_core", error = %error_display, "{}", message),
                Level::Error => tracing::error!(target: "dd_trace_core", error = %error_display, "{}", message),
            }
        }
    }
}

/// Default logger: `TracingLogger` when `internal-logs` is enabled (the
/// crate default feature), `NoopLogger` otherwise.
pub fn default_logger() -> std::sync::Arc<dyn Logger> {
    std::sync::Arc::new(TracingLogger)
}
