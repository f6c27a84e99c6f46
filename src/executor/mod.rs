//! Plan execution
//!
//! A plan is a DAG of steps executed sequentially, depth first, in
//! declaration order. Fetch steps call into sources; union, intersect and
//! aggregate steps combine rows in memory; mutation steps apply one
//! repository call per input row.

mod errors;
mod filters;
mod mutation;
mod plan;
mod shape;
mod sorter;
mod steps;

pub use errors::{ExecutorError, ExecutorResult};
pub use filters::ValueFilter;
pub use mutation::{Mutation, MutationOp};
pub use plan::{ExecContext, ExecutionPlan, StepKey, StepRepr};
pub use shape::{apply_window, dedup_rows, Binding, ResultShape};
pub use sorter::{compare_values, ResultSorter};
pub use steps::{FetchQuery, Step, StepKind, StepState, TableOutput};
