//! The host application wrapper this store consumes but does not own.
//!
//! Spec keeps the context itself out of scope ("supplies the store with a
//! logger, a default dataset, and a handle"); this module models only the
//! narrow surface the store actually calls, as a trait, so a host can plug
//! in its own implementation without this crate depending on it.

use crate::time::Tid;

/// Severity passed to [`Context::log`], mirroring the handful of levels a
/// host logger realistically distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// The host-supplied surface the store consumes: a logger and a default
/// dataset. Connection management, calendar helpers, and everything else a
/// real host wrapper carries are out of scope here.
pub trait Context: Send + Sync {
    /// Emits a host-facing log line at the given severity.
    fn log(&self, level: LogLevel, message: &str);

    /// The dataset new sessions should operate against absent an explicit
    /// override.
    fn default_data_set(&self) -> Tid;
}

/// A [`Context`] that forwards to the `tracing` macros and reports a fixed
/// default dataset — useful as a host-free default in tests and small
/// programs that don't need their own context implementation.
#[derive(Debug, Clone, Copy)]
pub struct TracingContext {
    default_data_set: Tid,
}

impl TracingContext {
    pub fn new(default_data_set: Tid) -> Self {
        Self { default_data_set }
    }
}

impl Context for TracingContext {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!("{message}"),
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
    }

    fn default_data_set(&self) -> Tid {
        self.default_data_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_context_reports_its_default_dataset() {
        let ctx = TracingContext::new(Tid::new(5, [0; 8]));
        assert_eq!(ctx.default_data_set(), Tid::new(5, [0; 8]));
    }

    #[test]
    fn log_levels_are_ordered_by_severity() {
        assert!(LogLevel::Trace < LogLevel::Error);
    }
}
