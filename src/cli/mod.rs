//! CLI module for aeroplan
//!
//! Provides command-line interface for:
//! - explain: print the plan of one statement
//! - run: plan and execute one statement

mod args;
mod commands;
mod config;
mod errors;
mod io;

pub use args::{Cli, Command, CommonArgs};
pub use commands::{execute, explain, explain_statement, run, run_command, run_statement};
pub use config::{
    load_repository, RepositoryConfig, SourceConfig, SourceData, StoredEntity, StoredRelation,
};
pub use errors::{CliError, CliResult};
pub use io::{parse_statement, read_statement, write_error, write_response};
