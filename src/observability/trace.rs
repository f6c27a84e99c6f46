//! Typed trace events and the observer dispatching them
//!
//! Every event goes to the optional trace sink; it is also logged when
//! logging is enabled.

use std::fmt;
use std::rc::Rc;

use super::events::Event;
use super::logger::{Logger, Severity};

/// Structured planning/execution trace record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    PlanBegin {
        statement: String,
    },
    PlanComplete {
        steps: usize,
    },
    PlanRejected {
        code: &'static str,
        reason: String,
    },
    BranchAnnotated {
        branch: usize,
        invariants: Vec<String>,
        need_distinct: bool,
        need_intersect: bool,
    },
    /// Per-source term coverage and the split decision of a branch
    BranchSplit {
        branch: usize,
        needsplit: bool,
        coverage: Vec<String>,
    },
    BranchShortCircuit {
        branch: usize,
        reason: String,
    },
    PartStepDefined {
        sources: Vec<String>,
        terms: Vec<String>,
        solutions: Vec<usize>,
        is_final: bool,
    },
    StepExecuted {
        step: String,
        rows: usize,
    },
    SourceSearch {
        source: String,
        query: String,
        rows: usize,
    },
    MutationApplied {
        source: String,
        operation: String,
    },
}

impl TraceEvent {
    pub fn event(&self) -> Event {
        match self {
            TraceEvent::PlanBegin { .. } => Event::PlanBegin,
            TraceEvent::PlanComplete { .. } => Event::PlanComplete,
            TraceEvent::PlanRejected { .. } => Event::PlanRejected,
            TraceEvent::BranchAnnotated { .. } => Event::BranchAnnotated,
            TraceEvent::BranchSplit { .. } => Event::BranchSplit,
            TraceEvent::BranchShortCircuit { .. } => Event::BranchShortCircuit,
            TraceEvent::PartStepDefined { .. } => Event::PartStepDefined,
            TraceEvent::StepExecuted { .. } => Event::StepExecuted,
            TraceEvent::SourceSearch { .. } => Event::SourceSearch,
            TraceEvent::MutationApplied { .. } => Event::MutationApplied,
        }
    }

    /// Log fields, values rendered as strings
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            TraceEvent::PlanBegin { statement } => vec![("statement", statement.clone())],
            TraceEvent::PlanComplete { steps } => vec![("steps", steps.to_string())],
            TraceEvent::PlanRejected { code, reason } => {
                vec![("code", code.to_string()), ("reason", reason.clone())]
            }
            TraceEvent::BranchAnnotated {
                branch,
                invariants,
                need_distinct,
                need_intersect,
            } => vec![
                ("branch", branch.to_string()),
                ("invariants", invariants.join(",")),
                ("need_distinct", need_distinct.to_string()),
                ("need_intersect", need_intersect.to_string()),
            ],
            TraceEvent::BranchSplit {
                branch,
                needsplit,
                coverage,
            } => vec![
                ("branch", branch.to_string()),
                ("coverage", coverage.join("; ")),
                ("needsplit", needsplit.to_string()),
            ],
            TraceEvent::BranchShortCircuit { branch, reason } => {
                vec![("branch", branch.to_string()), ("reason", reason.clone())]
            }
            TraceEvent::PartStepDefined {
                sources,
                terms,
                solutions,
                is_final,
            } => vec![
                ("final", is_final.to_string()),
                (
                    "solutions",
                    solutions
                        .iter()
                        .map(|s| s.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                ),
                ("sources", sources.join(",")),
                ("terms", terms.join(",")),
            ],
            TraceEvent::StepExecuted { step, rows } => {
                vec![("rows", rows.to_string()), ("step", step.clone())]
            }
            TraceEvent::SourceSearch {
                source,
                query,
                rows,
            } => vec![
                ("query", query.clone()),
                ("rows", rows.to_string()),
                ("source", source.clone()),
            ],
            TraceEvent::MutationApplied { source, operation } => {
                vec![("operation", operation.clone()), ("source", source.clone())]
            }
        }
    }
}

/// Callback receiving every trace event
pub type TraceSink = Rc<dyn Fn(&TraceEvent)>;

/// Dispatches trace events to the log and to an optional sink
#[derive(Clone, Default)]
pub struct Observer {
    log_events: bool,
    sink: Option<TraceSink>,
}

impl Observer {
    pub fn new(log_events: bool, sink: Option<TraceSink>) -> Self {
        Self { log_events, sink }
    }

    /// Observer that drops everything
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn logs_enabled(&self) -> bool {
        self.log_events
    }

    pub fn emit(&self, event: TraceEvent) {
        if self.log_events {
            let kind = event.event();
            let severity = match &event {
                TraceEvent::PlanRejected { .. } => Severity::Error,
                _ if kind.is_detail() => Severity::Trace,
                _ => Severity::Info,
            };
            let fields = event.fields();
            let refs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
            Logger::log(severity, kind.as_str(), &refs);
        }
        if let Some(sink) = &self.sink {
            (**sink)(&event);
        }
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("log_events", &self.log_events)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
