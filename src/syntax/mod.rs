//! Statement tree consumed by the planner
//!
//! Statements arrive already type-resolved: every branch carries its list of
//! solutions (variable → type assignments). The planner never mutates the
//! caller's tree; it builds new `Select`s for the sub-statements it emits.

mod display;
mod nodes;
mod scope;

pub use display::render_node;
pub use nodes::{
    is_aggregate_function, solution, CmpOp, Constant, Delete, Insert, MainEntity, MainRelation,
    Node, NodeId, Operand, Optional, Relation, Select, Solution, SortTerm, Statement, Union,
    Update,
};
pub use scope::{ScopeId, ScopeMap};
