//! Executor error types
//!
//! Error codes:
//! - AERO_EXEC_SOURCE (source collaborator failure, propagated unchanged)
//! - AERO_EXEC_ALREADY_EXECUTED
//! - AERO_EXEC_MISSING_TEMP_TABLE
//! - AERO_EXEC_UNSUPPORTED_FUNCTION
//! - AERO_EXEC_MUTATION

use thiserror::Error;

use crate::source::SourceError;

/// Result type for plan execution
pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("step {step} was already executed")]
    AlreadyExecuted { step: String },

    #[error("temporary table {table} is missing")]
    MissingTempTable { table: String },

    #[error("unsupported function {name}")]
    UnsupportedFunction { name: String },

    #[error("mutation failed: {message}")]
    Mutation { message: String },
}

impl ExecutorError {
    pub fn mutation(message: impl Into<String>) -> Self {
        ExecutorError::Mutation {
            message: message.into(),
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::Source(_) => "AERO_EXEC_SOURCE",
            ExecutorError::AlreadyExecuted { .. } => "AERO_EXEC_ALREADY_EXECUTED",
            ExecutorError::MissingTempTable { .. } => "AERO_EXEC_MISSING_TEMP_TABLE",
            ExecutorError::UnsupportedFunction { .. } => "AERO_EXEC_UNSUPPORTED_FUNCTION",
            ExecutorError::Mutation { .. } => "AERO_EXEC_MUTATION",
        }
    }
}
