//! Relation definitions
//!
//! The planner only needs to know, per relation type, whether it is final
//! (an attribute stored on the subject's row), inlined (a foreign-key column
//! on the subject's row) or symmetric.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Scalar types a final relation may point to
pub const FINAL_TYPES: &[&str] = &[
    "String", "Int", "BigInt", "Float", "Decimal", "Boolean", "Date", "Datetime",
    "TZDatetime", "Time", "Interval", "Bytes", "Password",
];

/// Relations handled by the planner itself; never assignable
pub const READONLY_RELATIONS: &[&str] = &["eid", "is", "identity"];

/// Returns true for scalar (attribute value) types
pub fn is_final_type(etype: &str) -> bool {
    FINAL_TYPES.contains(&etype)
}

/// Returns true for `eid`, `is` and `identity`
pub fn is_readonly_relation(rtype: &str) -> bool {
    READONLY_RELATIONS.contains(&rtype)
}

/// Definition of one relation type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    /// Attribute relation (object is a scalar value)
    #[serde(default, rename = "final")]
    pub is_final: bool,
    /// Stored as a column on the subject table
    #[serde(default)]
    pub inlined: bool,
    #[serde(default)]
    pub symmetric: bool,
}

impl RelationDef {
    pub fn attribute() -> Self {
        Self {
            is_final: true,
            ..Self::default()
        }
    }

    pub fn relation() -> Self {
        Self::default()
    }

    pub fn inlined() -> Self {
        Self {
            inlined: true,
            ..Self::default()
        }
    }
}

/// Relation schema shared by every source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub relations: BTreeMap<String, RelationDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relation(mut self, rtype: impl Into<String>, def: RelationDef) -> Self {
        self.relations.insert(rtype.into(), def);
        self
    }

    /// Final relations: declared attributes plus `eid` and `has_text`
    ///
    /// Unknown relation types are treated as non-final entity relations.
    pub fn is_final(&self, rtype: &str) -> bool {
        match rtype {
            "eid" | "has_text" => true,
            "is" | "identity" => false,
            _ => self.relations.get(rtype).map(|d| d.is_final).unwrap_or(false),
        }
    }

    pub fn is_inlined(&self, rtype: &str) -> bool {
        self.relations.get(rtype).map(|d| d.inlined).unwrap_or(false)
    }

    pub fn is_symmetric(&self, rtype: &str) -> bool {
        self.relations.get(rtype).map(|d| d.symmetric).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finality() {
        let schema = Schema::new()
            .with_relation("login", RelationDef::attribute())
            .with_relation("in_group", RelationDef::relation());
        assert!(schema.is_final("login"));
        assert!(schema.is_final("eid"));
        assert!(!schema.is_final("in_group"));
        assert!(!schema.is_final("is"));
        assert!(!schema.is_final("unknown"));
    }

    #[test]
    fn test_readonly_relations() {
        assert!(is_readonly_relation("eid"));
        assert!(is_readonly_relation("identity"));
        assert!(!is_readonly_relation("login"));
    }

    #[test]
    fn test_schema_from_json() {
        let schema: Schema = serde_json::from_str(
            r#"{"relations": {"login": {"final": true}, "owned_by": {"inlined": true}}}"#,
        )
        .unwrap();
        assert!(schema.is_final("login"));
        assert!(schema.is_inlined("owned_by"));
    }
}
