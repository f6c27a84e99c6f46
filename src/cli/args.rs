//! CLI argument definitions using clap
//!
//! Commands:
//! - aeroplan explain --config <path>
//! - aeroplan run --config <path>
//!
//! Both read one JSON statement from stdin.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// aeroplan - plans and runs statements over a repository of sources
#[derive(Parser, Debug)]
#[command(name = "aeroplan")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Path to the repository configuration file
    #[arg(long, default_value = "./repository.json")]
    pub config: PathBuf,

    /// Emit structured log lines on stderr
    #[arg(long)]
    pub verbose: bool,

    /// Plan with the multi-source planner even for a single source
    #[arg(long)]
    pub force_multisource: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the execution plan of a statement
    Explain(CommonArgs),

    /// Plan and execute a statement
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// JSON object of substitution arguments (`%(name)s`)
        #[arg(long)]
        args: Option<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
