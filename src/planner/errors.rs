//! Planner error types
//!
//! Error codes:
//! - AERO_PLAN_QUERY_SHAPE (REJECT)
//! - AERO_PLAN_READONLY_RELATION (REJECT)
//! - AERO_PLAN_UNSUPPORTED_WRITE (REJECT)
//!
//! Every planner error is raised before any source is contacted.

use thiserror::Error;

/// Result type for planning
pub type PlannerResult<T> = Result<T, PlannerError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("invalid query shape: {reason}")]
    QueryShape { reason: String },

    #[error("relation {rtype} is read-only and cannot be assigned")]
    ReadOnlyRelation { rtype: String },

    #[error("no source can write {what}")]
    UnsupportedWrite { what: String },
}

impl PlannerError {
    pub fn query_shape(reason: impl Into<String>) -> Self {
        PlannerError::QueryShape {
            reason: reason.into(),
        }
    }

    pub fn read_only(rtype: impl Into<String>) -> Self {
        PlannerError::ReadOnlyRelation {
            rtype: rtype.into(),
        }
    }

    pub fn unsupported_write(what: impl Into<String>) -> Self {
        PlannerError::UnsupportedWrite { what: what.into() }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            PlannerError::QueryShape { .. } => "AERO_PLAN_QUERY_SHAPE",
            PlannerError::ReadOnlyRelation { .. } => "AERO_PLAN_READONLY_RELATION",
            PlannerError::UnsupportedWrite { .. } => "AERO_PLAN_UNSUPPORTED_WRITE",
        }
    }
}
