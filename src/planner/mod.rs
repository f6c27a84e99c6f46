//! Query planning over a repository of sources
//!
//! A statement is annotated, then planned either whole on the system source
//! or, when several sources are involved, split into part steps whose
//! results meet in temp tables.
//!
//! # Design Principles
//!
//! - Deterministic: same statement and repository give the same plan
//! - Fail before contact: planning errors are raised before any source is queried
//! - Explicit: configuration is passed in, never read from the environment

mod annotator;
mod config;
mod errors;
mod explain;
mod filterer;
mod multi;
mod partinfo;
mod query_planner;
mod single;

pub use annotator::{Annotations, Annotator, BranchAnnotations, VarInfo};
pub use config::PlannerConfig;
pub use errors::{PlannerError, PlannerResult};
pub use explain::ExplainPlan;
pub use filterer::{FilteredStep, TermsFiltererVisitor};
pub use multi::MultiSourcePlanner;
pub use partinfo::{PartPlanInformation, SourceTerms, StepDef, Term};
pub use query_planner::QueryPlanner;
pub use single::{plan_mutation, SelectPlanner, SinglesourcePlanner};
