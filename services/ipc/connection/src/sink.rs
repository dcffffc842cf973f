//! Pluggable sinks for errors and warnings.
//!
//! A connection never panics or returns early without telling someone: every
//! failure is handed to a [`LogSink`] together with the transport's error
//! text, if there is one.

use std::sync::Arc;
use tracing::{error, warn};

/// Receives a human readable message and an optional transport error string
pub trait LogSink: Send + Sync {
    /// Record one event
    fn log(&self, message: &str, transport_error: Option<&str>);
}

impl<F> LogSink for F
where
    F: Fn(&str, Option<&str>) + Send + Sync,
{
    fn log(&self, message: &str, transport_error: Option<&str>) {
        self(message, transport_error)
    }
}

/// Writes `[erro]` or `[warn]` tagged lines to standard output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleSink {
    /// `[erro]` lines
    Error,
    /// `[warn]` lines
    Warn,
}

impl ConsoleSink {
    fn tag(self) -> &'static str {
        match self {
            ConsoleSink::Error => "[erro]",
            ConsoleSink::Warn => "[warn]",
        }
    }

    /// The line this sink prints for an event
    pub fn format(self, message: &str, transport_error: Option<&str>) -> String {
        match transport_error {
            Some(detail) => format!("{} {}: {}", self.tag(), message, detail),
            None => format!("{} {}", self.tag(), message),
        }
    }
}

impl LogSink for ConsoleSink {
    fn log(&self, message: &str, transport_error: Option<&str>) {
        println!("{}", self.format(message, transport_error));
    }
}

/// Forwards events to `tracing` at error or warn level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingSink {
    /// `error!` events
    Error,
    /// `warn!` events
    Warn,
}

impl LogSink for TracingSink {
    fn log(&self, message: &str, transport_error: Option<&str>) {
        let detail = transport_error.unwrap_or("-");
        match self {
            TracingSink::Error => error!(transport_error = detail, "{}", message),
            TracingSink::Warn => warn!(transport_error = detail, "{}", message),
        }
    }
}

pub(crate) fn default_error_sink() -> Arc<dyn LogSink> {
    Arc::new(ConsoleSink::Error)
}

pub(crate) fn default_warn_sink() -> Arc<dyn LogSink> {
    Arc::new(ConsoleSink::Warn)
}
