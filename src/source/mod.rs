//! Data sources consumed by the planner
//!
//! A source is an independently queryable backend supporting part of the
//! schema. The system source is always present, supports every type and can
//! read the temp tables produced by earlier plan steps.
//!
//! Calls into a source are synchronous and opaque: no timeout or retry policy
//! lives here.

mod descriptor;
mod errors;
mod memory;
mod repository;
mod tables;

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::syntax::Union;

pub use descriptor::{SourceDescriptor, SourceId};
pub use errors::{SourceError, SourceResult};
pub use memory::{Entity, MemorySource};
pub use repository::{Repository, Session};
pub use tables::{ColumnRef, InputMap, SearchInputs, TempTable, TempTables};

/// One result row
pub type Row = Vec<Value>;

/// Query arguments referenced by `%(name)s` substitutions
pub type QueryArgs = BTreeMap<String, Value>;

/// Capability interface of a source
pub trait Source {
    fn descriptor(&self) -> &SourceDescriptor;

    fn uri(&self) -> &str {
        &self.descriptor().uri
    }

    fn support_entity(&self, etype: &str, write: bool) -> bool {
        self.descriptor().support_entity(etype, write)
    }

    fn support_relation(&self, rtype: &str, write: bool) -> bool {
        self.descriptor().support_relation(rtype, write)
    }

    fn cross_relations(&self) -> &BTreeSet<String> {
        &self.descriptor().cross_relations
    }

    fn dont_cross_relations(&self) -> &BTreeSet<String> {
        &self.descriptor().dont_cross_relations
    }

    /// Evaluates `union` and returns its rows
    fn syntax_tree_search(
        &self,
        session: &Session<'_>,
        union: &Union,
        args: &QueryArgs,
        cache_key: Option<&str>,
        inputs: Option<SearchInputs<'_>>,
    ) -> SourceResult<Vec<Row>>;

    fn add_entity(
        &self,
        session: &Session<'_>,
        eid: i64,
        etype: &str,
        attributes: &BTreeMap<String, Value>,
    ) -> SourceResult<()>;

    fn update_entity(
        &self,
        session: &Session<'_>,
        eid: i64,
        attributes: &BTreeMap<String, Value>,
    ) -> SourceResult<()>;

    fn delete_entity(&self, session: &Session<'_>, eid: i64) -> SourceResult<()>;

    fn add_relation(
        &self,
        session: &Session<'_>,
        subject: i64,
        rtype: &str,
        object: i64,
    ) -> SourceResult<()>;

    fn delete_relation(
        &self,
        session: &Session<'_>,
        subject: i64,
        rtype: &str,
        object: i64,
    ) -> SourceResult<()>;
}
