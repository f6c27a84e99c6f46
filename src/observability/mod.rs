//! Observability for planning and execution
//!
//! - Structured logging (JSON, one line per event)
//! - Typed trace events with an optional callback sink
//! - Begin/complete scopes around plan construction and execution
//!
//! Observability is read-only: it never changes what gets planned or
//! returned. Logging is off unless explicitly enabled.

mod events;
mod logger;
mod scope;
mod trace;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use scope::ObservationScope;
pub use trace::{Observer, TraceEvent, TraceSink};

/// Logs a lifecycle event outside any plan (configuration loading)
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::info(event.as_str(), fields);
}
