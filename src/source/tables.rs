//! Temporary relations exchanged between plan steps
//!
//! A non-final fetch step writes its rows into a temp table; a later step
//! reads them through an input map binding variables to `table.Cn` columns.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::Row;

/// Column of a temp table, rendered `table.Cn`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: usize,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: usize) -> Self {
        Self {
            table: table.into(),
            column,
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.C{}", self.table, self.column)
    }
}

/// Variable -> temp table columns holding its values
///
/// A variable mapped to several columns is joined by equality.
pub type InputMap = BTreeMap<String, Vec<ColumnRef>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TempTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Temp tables of one plan execution
#[derive(Debug, Clone, Default)]
pub struct TempTables {
    tables: BTreeMap<String, TempTable>,
}

impl TempTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the table if needed, then appends rows
    pub fn append(&mut self, name: &str, columns: &[String], rows: Vec<Row>) {
        let table = self
            .tables
            .entry(name.to_string())
            .or_insert_with(|| TempTable {
                columns: columns.to_vec(),
                rows: Vec::new(),
            });
        table.rows.extend(rows);
    }

    pub fn get(&self, name: &str) -> Option<&TempTable> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Inputs handed to `Source::syntax_tree_search` for steps reading temp tables
#[derive(Debug, Clone, Copy)]
pub struct SearchInputs<'a> {
    pub map: &'a InputMap,
    pub tables: &'a TempTables,
}
