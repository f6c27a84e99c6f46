//! ObservationScope for automatic begin/complete logging
//!
//! - Logs `{name}_BEGIN` on creation
//! - Logs `{name}_COMPLETE` when completed
//! - Logs `{name}_ERROR` on drop if never completed
//!
//! Nothing is written unless the observer has logging enabled.

use std::cell::Cell;

use super::logger::Logger;
use super::trace::Observer;

/// ```ignore
/// let scope = ObservationScope::new(&observer, "EXECUTE");
/// let rows = plan.run()?;     // early return logs EXECUTE_ERROR
/// scope.complete_with_fields(&[("rows", "2")]);
/// ```
pub struct ObservationScope<'a> {
    name: &'a str,
    enabled: bool,
    completed: Cell<bool>,
}

impl<'a> ObservationScope<'a> {
    pub fn new(observer: &Observer, name: &'a str) -> Self {
        let enabled = observer.logs_enabled();
        if enabled {
            Logger::info(&format!("{}_BEGIN", name), &[]);
        }
        Self {
            name,
            enabled,
            completed: Cell::new(false),
        }
    }

    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    pub fn complete_with_fields(self, fields: &[(&str, &str)]) {
        self.completed.set(true);
        if self.enabled {
            Logger::info(&format!("{}_COMPLETE", self.name), fields);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.get()
    }
}

impl Drop for ObservationScope<'_> {
    fn drop(&mut self) {
        if !self.completed.get() && self.enabled {
            Logger::error(
                &format!("{}_ERROR", self.name),
                &[("reason", "scope dropped without completion")],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_complete() {
        let observer = Observer::silent();
        let scope = ObservationScope::new(&observer, "EXECUTE");
        assert!(!scope.is_completed());
        scope.complete();
    }

    #[test]
    fn test_scope_drop_without_complete() {
        let observer = Observer::new(true, None);
        let scope = ObservationScope::new(&observer, "PLAN");
        drop(scope);
    }
}
