//! Errors raised by source collaborators
//!
//! These are opaque to the planner: the executor propagates them unchanged.

use thiserror::Error;

/// Result type for source operations
pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source {uri} does not support {what}")]
    Unsupported { uri: String, what: String },

    #[error("source {uri} has no entity {eid}")]
    UnknownEntity { uri: String, eid: i64 },

    #[error("source {uri} failed: {message}")]
    Backend { uri: String, message: String },
}

impl SourceError {
    pub fn unsupported(uri: impl Into<String>, what: impl Into<String>) -> Self {
        SourceError::Unsupported {
            uri: uri.into(),
            what: what.into(),
        }
    }

    pub fn unknown_entity(uri: impl Into<String>, eid: i64) -> Self {
        SourceError::UnknownEntity {
            uri: uri.into(),
            eid,
        }
    }

    pub fn backend(uri: impl Into<String>, message: impl Into<String>) -> Self {
        SourceError::Backend {
            uri: uri.into(),
            message: message.into(),
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            SourceError::Unsupported { .. } => "AERO_SOURCE_UNSUPPORTED",
            SourceError::UnknownEntity { .. } => "AERO_SOURCE_UNKNOWN_ENTITY",
            SourceError::Backend { .. } => "AERO_SOURCE_BACKEND",
        }
    }
}
