//! JSON I/O handling for CLI
//!
//! - Input: one JSON statement via stdin
//! - Output: one JSON object via stdout
//! - UTF-8 only

use std::io::{self, Read, Write};

use serde_json::Value;

use crate::syntax::Statement;

use super::errors::{CliError, CliResult};

/// Parses a statement from its JSON text
pub fn parse_statement(text: &str) -> CliResult<Statement> {
    if text.trim().is_empty() {
        return Err(CliError::io_error("Empty input"));
    }
    Ok(serde_json::from_str(text)?)
}

/// Reads the whole of stdin as one statement
pub fn read_statement() -> CliResult<Statement> {
    let mut text = String::new();
    io::stdin().lock().read_to_string(&mut text)?;
    parse_statement(&text)
}

fn write_value(value: &Value) -> CliResult<()> {
    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

pub fn write_response(data: Value) -> CliResult<()> {
    write_value(&serde_json::json!({
        "status": "ok",
        "data": data
    }))
}

pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    write_value(&serde_json::json!({
        "status": "error",
        "code": code,
        "message": message
    }))
}
