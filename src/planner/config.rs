//! Planner configuration
//!
//! Explicit configuration object; nothing is read from the environment.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::observability::{Observer, TraceSink};

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Emit structured log lines for planning and execution events
    #[serde(default)]
    pub log_events: bool,
    /// Use the multi-source planner even with a single source
    #[serde(default)]
    pub force_multisource: bool,
    #[serde(skip)]
    pub trace: Option<TraceSink>,
}

impl PlannerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.log_events = enabled;
        self
    }

    pub fn with_force_multisource(mut self, force: bool) -> Self {
        self.force_multisource = force;
        self
    }

    pub fn with_trace(mut self, sink: TraceSink) -> Self {
        self.trace = Some(sink);
        self
    }

    pub fn observer(&self) -> Observer {
        Observer::new(self.log_events, self.trace.clone())
    }
}

impl fmt::Debug for PlannerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannerConfig")
            .field("log_events", &self.log_events)
            .field("force_multisource", &self.force_multisource)
            .field("trace", &self.trace.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: PlannerConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.log_events);
        assert!(!config.force_multisource);
        assert!(config.trace.is_none());
    }

    #[test]
    fn test_builder() {
        let config = PlannerConfig::new().with_logging(true).with_force_multisource(true);
        assert!(config.observer().logs_enabled());
        assert!(config.force_multisource);
    }
}
