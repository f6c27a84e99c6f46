//! Relation schema consulted during planning

mod types;

pub use types::{
    is_final_type, is_readonly_relation, RelationDef, Schema, FINAL_TYPES, READONLY_RELATIONS,
};
