//! CLI-specific error types
//!
//! All CLI errors are fatal: the command writes an error response and exits
//! non-zero.

use std::io;

use thiserror::Error;

use crate::executor::ExecutorError;
use crate::planner::PlannerError;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error(transparent)]
    Plan(#[from] PlannerError),

    #[error(transparent)]
    Execution(#[from] ExecutorError),
}

impl CliError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        CliError::Config(msg.into())
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        CliError::Io(msg.into())
    }

    /// Stable error code; planning and execution errors keep their own
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Config(_) => "AERO_CLI_CONFIG_ERROR",
            CliError::Io(_) => "AERO_CLI_IO_ERROR",
            CliError::Plan(err) => err.code(),
            CliError::Execution(err) => err.code(),
        }
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(CliError::config_error("x").code(), "AERO_CLI_CONFIG_ERROR");
        let plan: CliError = PlannerError::read_only("eid").into();
        assert_eq!(plan.code(), "AERO_PLAN_READONLY_RELATION");
        assert_eq!(
            plan.to_string(),
            "relation eid is read-only and cannot be assigned"
        );
    }
}
