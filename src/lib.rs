//! aeroplan - query planning and execution over a federation of sources
//!
//! Statements are planned against a repository whose sources each serve a
//! subset of the schema. The system source serves everything and is where
//! partial results are joined.

pub mod cli;
pub mod executor;
pub mod observability;
pub mod planner;
pub mod schema;
pub mod source;
pub mod syntax;
