//! Observable planning and execution events
//!
//! Events are explicit and typed. Each carries a stable string name used as
//! the `event` key of log lines.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Planning
    PlanBegin,
    PlanComplete,
    /// Statement rejected before contacting any source
    PlanRejected,
    BranchAnnotated,
    /// Branch decomposed into part steps
    BranchSplit,
    /// Branch proven empty during planning
    BranchShortCircuit,
    PartStepDefined,

    // Execution
    StepExecuted,
    SourceSearch,
    MutationApplied,

    // Configuration
    ConfigLoaded,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::PlanBegin => "PLAN_BEGIN",
            Event::PlanComplete => "PLAN_COMPLETE",
            Event::PlanRejected => "PLAN_REJECTED",
            Event::BranchAnnotated => "BRANCH_ANNOTATED",
            Event::BranchSplit => "BRANCH_SPLIT",
            Event::BranchShortCircuit => "BRANCH_SHORT_CIRCUIT",
            Event::PartStepDefined => "PART_STEP_DEFINED",
            Event::StepExecuted => "STEP_EXECUTED",
            Event::SourceSearch => "SOURCE_SEARCH",
            Event::MutationApplied => "MUTATION_APPLIED",
            Event::ConfigLoaded => "CONFIG_LOADED",
        }
    }

    /// Per-step events are logged at TRACE, the rest at INFO
    pub fn is_detail(&self) -> bool {
        matches!(
            self,
            Event::PartStepDefined | Event::StepExecuted | Event::SourceSearch
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
