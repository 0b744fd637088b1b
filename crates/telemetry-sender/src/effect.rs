//! Structured logging helper carrying the sender's identity, the way the
//! teacher's exporter effect handler carries pipeline/exporter identity into
//! every log line.

use crate::DebugInfo;

/// Logs on behalf of the sender task, always attaching `debug_info`.
#[derive(Clone)]
pub struct EffectHandler {
    debug_info: DebugInfo,
}

impl EffectHandler {
    /// Creates a new effect handler for one sender task instance.
    pub fn new(debug_info: DebugInfo) -> Self {
        Self { debug_info }
    }

    /// Logs an info-level message.
    pub fn info(&self, msg: impl std::fmt::Display) {
        tracing::info!(debug_info = ?self.debug_info, "{}", msg);
    }

    /// Logs a warning, optionally with an extra detail message.
    pub fn warn(&self, warn_msg: impl std::fmt::Display, detail: Option<&str>) {
        match detail {
            Some(detail) => tracing::warn!(warn = %warn_msg, debug_info = ?self.debug_info, "{}", detail),
            None => tracing::warn!(warn = %warn_msg, debug_info = ?self.debug_info, "no further detail"),
        }
    }

    /// Logs an error, optionally with an extra detail message.
    pub fn error(&self, err_msg: impl std::fmt::Display, detail: Option<&str>) {
        match detail {
            Some(detail) => tracing::error!(error = %err_msg, debug_info = ?self.debug_info, "{}", detail),
            None => tracing::error!(error = %err_msg, debug_info = ?self.debug_info, "no further detail"),
        }
    }
}
