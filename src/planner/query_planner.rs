//! Planner entry point
//!
//! Picks the single-source or multi-source strategy and wraps planning in
//! an observation scope.

use crate::executor::ExecutionPlan;
use crate::observability::{ObservationScope, TraceEvent};
use crate::source::Repository;
use crate::syntax::Statement;

use super::config::PlannerConfig;
use super::errors::PlannerResult;
use super::multi::MultiSourcePlanner;
use super::single::SinglesourcePlanner;

pub struct QueryPlanner<'r> {
    repo: &'r Repository,
    config: PlannerConfig,
}

impl<'r> QueryPlanner<'r> {
    pub fn new(repo: &'r Repository, config: PlannerConfig) -> Self {
        Self { repo, config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// True if statements are planned by the single-source planner
    pub fn is_single_source(&self) -> bool {
        self.repo.len() == 1 && !self.config.force_multisource
    }

    /// Builds the execution plan of `statement`
    ///
    /// Errors are raised before any source is contacted; the returned plan
    /// has not been executed.
    pub fn build_plan(&self, statement: &Statement) -> PlannerResult<ExecutionPlan> {
        let observer = self.config.observer();
        let scope = ObservationScope::new(&observer, "PLAN");
        observer.emit(TraceEvent::PlanBegin {
            statement: statement.to_string(),
        });

        let mut plan = ExecutionPlan::new(observer.clone());
        let built = if self.is_single_source() {
            SinglesourcePlanner::new(self.repo).build_plan(&mut plan, statement)
        } else {
            MultiSourcePlanner::new(self.repo, observer.clone()).build_plan(&mut plan, statement)
        };

        match built {
            Ok(()) => {
                let steps = plan.steps().len();
                observer.emit(TraceEvent::PlanComplete { steps });
                scope.complete_with_fields(&[("steps", &steps.to_string())]);
                Ok(plan)
            }
            Err(err) => {
                observer.emit(TraceEvent::PlanRejected {
                    code: err.code(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }
}
