//! Execution plan: top-level steps plus the resources they share
//!
//! The temp-table name allocator and the step de-duplication index are scoped
//! to one plan and single-writer.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Serialize;

use crate::observability::{ObservationScope, Observer};
use crate::source::{QueryArgs, Row, Session, SourceId, TempTables};
use crate::syntax::Solution;

use super::errors::{ExecutorError, ExecutorResult};
use super::steps::{Step, StepKind};

/// Shared state handed to every step during execution
pub struct ExecContext<'a> {
    pub session: Session<'a>,
    pub args: &'a QueryArgs,
    pub tables: &'a RefCell<TempTables>,
    pub observer: &'a Observer,
}

/// Identity of a non-final step for de-duplication
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StepKey {
    pub text: String,
    pub solutions: Vec<usize>,
    pub sources: Vec<SourceId>,
    pub inserted: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct ExecutionPlan {
    steps: Vec<Rc<Step>>,
    next_table: Cell<usize>,
    shared: RefCell<BTreeMap<StepKey, Rc<Step>>>,
    executed: Cell<bool>,
    observer: Observer,
}

impl ExecutionPlan {
    pub fn new(observer: Observer) -> Self {
        Self {
            observer,
            ..Self::default()
        }
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    /// Fresh temp table name: `table0`, `table1`, ...
    pub fn allocate_table(&self) -> String {
        let n = self.next_table.get();
        self.next_table.set(n + 1);
        format!("table{}", n)
    }

    /// Step previously registered under `key`
    pub fn shared_step(&self, key: &StepKey) -> Option<Rc<Step>> {
        self.shared.borrow().get(key).cloned()
    }

    pub fn register_shared(&self, key: StepKey, step: Rc<Step>) {
        self.shared.borrow_mut().insert(key, step);
    }

    pub fn add_step(&mut self, step: Rc<Step>) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[Rc<Step>] {
        &self.steps
    }

    /// Runs every top-level step in order and concatenates their rows
    pub fn execute(&self, session: Session<'_>, args: &QueryArgs) -> ExecutorResult<Vec<Row>> {
        if self.executed.replace(true) {
            return Err(ExecutorError::AlreadyExecuted {
                step: "plan".to_string(),
            });
        }
        let scope = ObservationScope::new(&self.observer, "EXECUTE");
        let tables = RefCell::new(TempTables::new());
        let ctx = ExecContext {
            session,
            args,
            tables: &tables,
            observer: &self.observer,
        };
        let mut rows = Vec::new();
        for step in &self.steps {
            rows.extend(step.execute(&ctx)?);
        }
        scope.complete_with_fields(&[("rows", &rows.len().to_string())]);
        Ok(rows)
    }

    /// Canonical, deterministic description of the plan
    pub fn test_repr(&self, session: &Session<'_>) -> Vec<StepRepr> {
        self.steps.iter().map(|s| StepRepr::of(s, session)).collect()
    }
}

/// Canonical form of one step and its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRepr {
    pub step: &'static str,
    /// Sorted `(sub-statement text, solutions)` pairs, or mutation operations
    pub queries: Vec<(String, Vec<Solution>)>,
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepRepr>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl StepRepr {
    pub fn of(step: &Step, session: &Session<'_>) -> Self {
        let mut repr = StepRepr {
            step: step.name(),
            queries: Vec::new(),
            sources: Vec::new(),
            limit: None,
            offset: 0,
            inputs: BTreeMap::new(),
            output: step.output().map(|o| o.table.clone()),
            children: step
                .children()
                .iter()
                .map(|c| StepRepr::of(c, session))
                .collect(),
        };
        if let Some(query) = step.query() {
            let mut queries: Vec<(String, Vec<Solution>)> = query
                .union
                .children
                .iter()
                .map(|s| (s.to_string(), s.solutions.clone()))
                .collect();
            queries.sort();
            repr.queries = queries;
            repr.sources = query
                .sources
                .iter()
                .map(|id| session.repo.uri(*id).to_string())
                .collect();
            repr.limit = query.limit;
            repr.offset = query.offset;
            repr.inputs = query
                .inputs
                .iter()
                .map(|(var, cols)| (var.clone(), cols.iter().map(|c| c.to_string()).collect()))
                .collect();
        }
        if let StepKind::Mutation(mutation) = step.kind() {
            repr.queries = mutation
                .ops
                .iter()
                .map(|op| (op.to_string(), Vec::new()))
                .collect();
        }
        repr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{FetchQuery, ResultShape, TableOutput};
    use crate::schema::Schema;
    use crate::source::{ColumnRef, InputMap, MemorySource, Repository, SourceDescriptor};
    use crate::syntax::{solution, Operand, Relation, Select, SortTerm, Union};
    use serde_json::json;

    fn repo() -> Repository {
        let system = MemorySource::new(SourceDescriptor::system(), Schema::new())
            .with_entity(1, "User", &[])
            .with_entity(10, "Group", &[])
            .with_relation(1, "in_group", 10)
            .with_relation(7, "in_group", 10);
        let ldap = MemorySource::new(
            SourceDescriptor::new("ldap").with_entity("User", false),
            Schema::new(),
        )
        .with_entity(7, "User", &[])
        .with_entity(8, "User", &[]);
        let mut repo = Repository::new(Schema::new(), Rc::new(system));
        repo.add_source(Rc::new(ldap));
        repo
    }

    fn users() -> Union {
        Union::single(
            Select::any(&["X"])
                .with_relations(vec![Relation::new("X", "is", Operand::etype("User"))])
                .with_solutions(vec![solution(&[("X", "User")])]),
        )
    }

    #[test]
    fn test_fetch_into_temp_table_then_join() {
        let repo = repo();
        let mut plan = ExecutionPlan::new(Observer::silent());
        let table = plan.allocate_table();
        let fetch = Step::fetch(
            FetchQuery::new(users(), vec![SourceId(0), SourceId(1)]),
            TableOutput {
                table: table.clone(),
                columns: vec!["X".into()],
            },
            Vec::new(),
        );
        let mut inputs = InputMap::new();
        inputs.insert("X".into(), vec![ColumnRef::new(table, 0)]);
        let join = Union::single(
            Select::any(&["X"]).with_relations(vec![Relation::new("X", "in_group", Operand::var("G"))]),
        );
        let last = Step::one_fetch(
            FetchQuery::new(join, vec![SourceId(0)]).with_inputs(inputs),
            vec![fetch],
        );
        plan.add_step(last);
        let rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        assert_eq!(rows, vec![vec![json!(1)], vec![json!(7)]]);
    }

    #[test]
    fn test_plan_executes_once() {
        let repo = repo();
        let mut plan = ExecutionPlan::new(Observer::silent());
        plan.add_step(Step::one_fetch(FetchQuery::new(users(), vec![SourceId(1)]), Vec::new()));
        plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        let err = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap_err();
        assert_eq!(err.code(), "AERO_EXEC_ALREADY_EXECUTED");
    }

    #[test]
    fn test_shared_step_runs_once() {
        let ldap = Rc::new(
            MemorySource::new(
                SourceDescriptor::new("ldap").with_entity("User", false),
                Schema::new(),
            )
            .with_entity(7, "User", &[]),
        );
        let system = MemorySource::new(SourceDescriptor::system(), Schema::new());
        let mut repo = Repository::new(Schema::new(), Rc::new(system));
        let ldap_id = repo.add_source(ldap.clone());

        let mut plan = ExecutionPlan::new(Observer::silent());
        let shared = Step::one_fetch(FetchQuery::new(users(), vec![ldap_id]), Vec::new());
        plan.add_step(Step::union(vec![Rc::clone(&shared), Rc::clone(&shared)], false));
        let rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(ldap.calls().len(), 1);
    }

    #[test]
    fn test_multi_source_window_applied_locally() {
        let repo = repo();
        let mut plan = ExecutionPlan::new(Observer::silent());
        let mut union = users();
        union.children[0].limit = Some(2);
        let query = FetchQuery::new(union, vec![SourceId(0), SourceId(1)]).with_window(Some(1), 1);
        plan.add_step(Step::one_fetch(query, Vec::new()));
        let rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        assert_eq!(rows, vec![vec![json!(7)]]);
    }

    #[test]
    fn test_aggregate_over_sources() {
        let repo = repo();
        let mut plan = ExecutionPlan::new(Observer::silent());
        let a = Step::one_fetch(FetchQuery::new(users(), vec![SourceId(0)]), Vec::new());
        let b = Step::one_fetch(FetchQuery::new(users(), vec![SourceId(1)]), Vec::new());
        let shape = ResultShape {
            selection: vec![Operand::var("X")],
            orderby: vec![SortTerm::desc(Operand::var("X"))],
            limit: Some(2),
            ..ResultShape::default()
        };
        plan.add_step(Step::aggr(vec![a, b], vec!["X".into()], shape));
        let rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        assert_eq!(rows, vec![vec![json!(8)], vec![json!(7)]]);
    }

    #[test]
    fn test_repr_is_deterministic() {
        let repo = repo();
        let session = Session::new(&repo);
        let mut plan = ExecutionPlan::new(Observer::silent());
        plan.add_step(Step::one_fetch(
            FetchQuery::new(users(), vec![SourceId(0), SourceId(1)]),
            Vec::new(),
        ));
        let first = plan.test_repr(&session);
        assert_eq!(first, plan.test_repr(&session));
        assert_eq!(first[0].step, "OneFetchStep");
        assert_eq!(first[0].sources, vec!["system".to_string(), "ldap".to_string()]);
        assert_eq!(first[0].queries[0].0, "Any X WHERE X is User");
    }
}
