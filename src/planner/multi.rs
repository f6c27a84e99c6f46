//! Multi-source planning
//!
//! Branches whose coverage is identical on every source are sent whole to
//! those sources. Split branches are decomposed into part steps: non-final
//! fetches write temp tables, the final fetch joins them on the system
//! source through its input map. A branch negating a type-ambiguous variable
//! is evaluated once per type and the evaluations are intersected.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::executor::{ExecutionPlan, FetchQuery, ResultShape, Step, StepKey, TableOutput};
use crate::observability::{Observer, TraceEvent};
use crate::source::{ColumnRef, InputMap, Repository, SourceId};
use crate::syntax::{Node, NodeId, Operand, Relation, Select, Solution, Statement, Union};

use super::annotator::{Annotations, Annotator, BranchAnnotations};
use super::errors::PlannerResult;
use super::filterer::TermsFiltererVisitor;
use super::partinfo::{PartPlanInformation, StepDef, Term};
use super::single::{plan_mutation, SelectPlanner};

pub struct MultiSourcePlanner<'r> {
    repo: &'r Repository,
    observer: Observer,
}

/// Unsplit branches sharing one source set
struct SourceGroup {
    sources: Vec<SourceId>,
    selects: Vec<Select>,
}

impl<'r> MultiSourcePlanner<'r> {
    pub fn new(repo: &'r Repository, observer: Observer) -> Self {
        Self { repo, observer }
    }

    pub fn build_plan(&self, plan: &mut ExecutionPlan, statement: &Statement) -> PlannerResult<()> {
        match statement {
            Statement::Select(union) => {
                for step in self.plan_select(plan, union)? {
                    plan.add_step(step);
                }
            }
            _ => {
                let step = plan_mutation(self.repo, self, plan, statement)?;
                plan.add_step(step);
            }
        }
        Ok(())
    }

    fn annotate(&self, union: &Union) -> Annotations {
        let annotations = Annotator::new(self.repo.schema()).annotate(&union.children);
        for (index, branch) in annotations.branches.iter().enumerate() {
            self.observer.emit(TraceEvent::BranchAnnotated {
                branch: index,
                invariants: branch.invariants(),
                need_distinct: branch.need_distinct,
                need_intersect: branch.need_intersect,
            });
        }
        annotations
    }

    /// Fetch of an unsplit group of branches
    fn plan_group(&self, group: SourceGroup) -> Vec<Rc<Step>> {
        if group.sources.len() == 1 {
            return vec![Step::one_fetch(
                FetchQuery::new(Union::new(group.selects), group.sources),
                Vec::new(),
            )];
        }

        let mut steps = Vec::new();
        let mut plain = Vec::new();
        for select in group.selects {
            let windowed = select.limit.is_some() || select.offset > 0;
            let reshaped = select.is_aggregated()
                || !select.orderby.is_empty()
                || (select.distinct && windowed);
            if reshaped {
                steps.push(self.aggregate(select, &group.sources));
            } else if windowed {
                let (limit, offset) = (select.limit, select.offset);
                let mut widened = select;
                widened.limit = limit.map(|l| l + offset);
                widened.offset = 0;
                let query = FetchQuery::new(Union::single(widened), group.sources.clone())
                    .with_window(limit, offset);
                steps.push(Step::one_fetch(query, Vec::new()));
            } else {
                plain.push(select);
            }
        }
        if !plain.is_empty() {
            let distinct = plain.iter().any(|s| s.distinct);
            let union = Union::new(plain);
            let per_source: Vec<Rc<Step>> = group
                .sources
                .iter()
                .map(|s| Step::one_fetch(FetchQuery::new(union.clone(), vec![*s]), Vec::new()))
                .collect();
            steps.push(Step::union(per_source, distinct));
        }
        steps
    }

    /// Unsplit branch negating type-ambiguous variables
    ///
    /// Each solution is evaluated with the variables pinned to its types
    /// inside their negation. Solutions differing only by those types are
    /// intersected, the resulting rows are unioned.
    fn plan_intersect(&self, select: &Select, on: &BTreeMap<String, NodeId>, sources: Vec<SourceId>) -> Rc<Step> {
        let shaped = has_modifiers(select);
        let shape = ResultShape::of(select);
        let columns = shape.variables();

        let mut classes: BTreeMap<Solution, Vec<&Solution>> = BTreeMap::new();
        for solution in &select.solutions {
            let rest: Solution = solution
                .iter()
                .filter(|(var, _)| !on.contains_key(*var))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            classes.entry(rest).or_default().push(solution);
        }

        let mut unioned = Vec::new();
        for members in classes.into_values() {
            let mut evaluations = Vec::new();
            for solution in members {
                let mut typed = select.clone();
                typed.solutions = vec![solution.clone()];
                for (var, not) in on {
                    if let Some(etype) = solution.get(var) {
                        pin_type(&mut typed, *not, var, etype);
                    }
                }
                if shaped {
                    typed.selection = columns.iter().map(Operand::var).collect();
                    typed.groupby.clear();
                    typed.orderby.clear();
                    typed.limit = None;
                    typed.offset = 0;
                    typed.distinct = false;
                }
                let group = SourceGroup {
                    sources: sources.clone(),
                    selects: vec![typed],
                };
                evaluations.extend(self.plan_group(group));
            }
            unioned.push(if evaluations.len() == 1 {
                Rc::clone(&evaluations[0])
            } else {
                Step::intersect(evaluations)
            });
        }

        let step = if unioned.len() == 1 {
            Rc::clone(&unioned[0])
        } else {
            Step::union(unioned, true)
        };
        if shaped {
            Step::aggr(vec![step], columns, shape)
        } else {
            step
        }
    }

    /// Raw rows from every source, shaped once assembled
    fn aggregate(&self, select: Select, sources: &[SourceId]) -> Rc<Step> {
        let shape = ResultShape::of(&select);
        let columns = shape.variables();
        let mut raw = select;
        raw.selection = columns.iter().map(Operand::var).collect();
        raw.groupby.clear();
        raw.orderby.clear();
        raw.limit = None;
        raw.offset = 0;
        raw.distinct = false;
        let fetch = Step::one_fetch(
            FetchQuery::new(Union::single(raw), sources.to_vec()),
            Vec::new(),
        );
        Step::aggr(vec![fetch], columns, shape)
    }

    /// Steps of a split branch; returns the step producing its rows
    fn plan_split(
        &self,
        plan: &mut ExecutionPlan,
        info: &PartPlanInformation<'_>,
        sole_producer: bool,
    ) -> Rc<Step> {
        let defs = info.part_steps();
        for def in &defs {
            self.observer.emit(TraceEvent::PartStepDefined {
                sources: def
                    .sources
                    .iter()
                    .map(|s| self.repo.uri(*s).to_string())
                    .collect(),
                terms: def.terms.iter().map(Term::to_string).collect(),
                solutions: def.solindices.iter().copied().collect(),
                is_final: def.is_final,
            });
        }

        let mut placed: BTreeSet<NodeId> = BTreeSet::new();
        let mut values: BTreeMap<NodeId, String> = BTreeMap::new();
        let mut tables: BTreeMap<(Vec<Term>, Vec<String>), String> = BTreeMap::new();
        let mut inputs = InputMap::new();
        let mut children = Vec::new();
        let mut last: Option<(&StepDef, Select)> = None;

        for def in &defs {
            if def.is_final {
                let filtered = TermsFiltererVisitor::new(info, &placed)
                    .keep_modifiers(sole_producer)
                    .with_values(values.clone())
                    .filter(def);
                last = Some((def, filtered.select));
                continue;
            }
            let filtered = TermsFiltererVisitor::new(info, &placed).filter(def);
            let columns: Vec<String> = filtered
                .select
                .selection
                .iter()
                .filter_map(|t| t.as_var().map(String::from))
                .collect();
            // binds nothing, so answers nothing: its relations stay unplaced
            if columns.is_empty() {
                continue;
            }
            placed.extend(filtered.kept.iter().copied());
            values.extend(filtered.values.clone());

            let key = StepKey {
                text: filtered.select.to_string(),
                solutions: def.solindices.iter().copied().collect(),
                sources: def.sources.clone(),
                inserted: filtered.inserted.clone(),
            };
            let (step, table) = match plan.shared_step(&key) {
                Some(shared) => {
                    let table = shared.output().map(|o| o.table.clone()).unwrap_or_default();
                    (shared, table)
                }
                None => {
                    let terms: Vec<Term> = def.terms.iter().cloned().collect();
                    let table = tables
                        .entry((terms, columns.clone()))
                        .or_insert_with(|| plan.allocate_table())
                        .clone();
                    let step = Step::fetch(
                        FetchQuery::new(Union::single(filtered.select), def.sources.clone()),
                        TableOutput {
                            table: table.clone(),
                            columns: columns.clone(),
                        },
                        Vec::new(),
                    );
                    plan.register_shared(key, Rc::clone(&step));
                    (step, table)
                }
            };
            children.push(step);

            let renamed: BTreeMap<&str, &str> = filtered
                .inserted
                .iter()
                .map(|(outer, fresh)| (fresh.as_str(), outer.as_str()))
                .collect();
            for (index, column) in columns.iter().enumerate() {
                let var = renamed.get(column.as_str()).copied().unwrap_or(column.as_str());
                let slot = inputs.entry(var.to_string()).or_default();
                let col = ColumnRef::new(table.clone(), index);
                if !slot.contains(&col) {
                    slot.push(col);
                }
            }
        }

        let (def, select) = match last {
            Some(last) => last,
            None => {
                // part_steps always closes with a final step
                let select = info.select().clone();
                return Step::one_fetch(
                    FetchQuery::new(Union::single(select), vec![SourceId::SYSTEM]),
                    children,
                );
            }
        };
        if !sole_producer && has_modifiers(info.select()) {
            let mut raw = select;
            let shape = ResultShape::of(info.select());
            let columns = shape.variables();
            raw.selection = columns.iter().map(Operand::var).collect();
            raw.distinct = false;
            let fetch = Step::one_fetch(
                FetchQuery::new(Union::single(raw), def.sources.clone()).with_inputs(inputs),
                children,
            );
            return Step::aggr(vec![fetch], columns, shape);
        }
        Step::one_fetch(
            FetchQuery::new(Union::single(select), def.sources.clone()).with_inputs(inputs),
            children,
        )
    }

    fn combine(&self, steps: Vec<Rc<Step>>, distinct: bool) -> Vec<Rc<Step>> {
        if steps.len() < 2 {
            return steps;
        }
        vec![Step::union(steps, distinct)]
    }
}

/// Adds `var is <etype>` inside the negation `not`
fn pin_type(select: &mut Select, not: NodeId, var: &str, etype: &str) {
    let child = match select.node(not) {
        Node::Not(child) => *child,
        _ => return,
    };
    let is = select.rel(Relation::new(var, "is", Operand::etype(etype)));
    let pinned = select.and(vec![child, is]);
    select.nodes[not.index()] = Node::Not(pinned);
}

/// Modifiers only an aggregate step can apply once branches are merged
fn has_modifiers(select: &Select) -> bool {
    select.is_aggregated()
        || !select.orderby.is_empty()
        || select.limit.is_some()
        || select.offset > 0
}

impl SelectPlanner for MultiSourcePlanner<'_> {
    fn plan_select(&self, plan: &mut ExecutionPlan, union: &Union) -> PlannerResult<Vec<Rc<Step>>> {
        let annotations = self.annotate(union);
        let union = annotations.deduplicated(union);
        let sole = union.children.len() == 1;

        let mut groups: Vec<SourceGroup> = Vec::new();
        let mut steps: Vec<Rc<Step>> = Vec::new();
        for (index, select) in union.children.iter().enumerate() {
            let branch: &BranchAnnotations = annotations.branch(index);
            let info = PartPlanInformation::new(self.repo, select, branch);
            if info.is_empty() {
                self.observer.emit(TraceEvent::BranchShortCircuit {
                    branch: index,
                    reason: "eid not owned by any source".to_string(),
                });
                continue;
            }
            self.observer.emit(TraceEvent::BranchSplit {
                branch: index,
                needsplit: info.needsplit(),
                coverage: info.coverage(),
            });

            if info.needsplit() {
                steps.push(self.plan_split(plan, &info, sole));
                continue;
            }
            let sources = info.sources();
            if branch.need_intersect {
                steps.push(self.plan_intersect(select, &branch.intersect_on, sources));
                continue;
            }
            match groups.iter_mut().find(|g| g.sources == sources) {
                Some(group) => group.selects.push(select.clone()),
                None => groups.push(SourceGroup {
                    sources,
                    selects: vec![select.clone()],
                }),
            }
        }

        let mut planned: Vec<Rc<Step>> = Vec::new();
        for group in groups {
            planned.extend(self.plan_group(group));
        }
        planned.extend(steps);
        let distinct = union.children.iter().any(|s| s.distinct);
        Ok(self.combine(planned, distinct))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StepKind;
    use crate::schema::{RelationDef, Schema};
    use crate::source::{MemorySource, QueryArgs, Session, SourceDescriptor};
    use crate::syntax::{solution, Relation};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new()
            .with_relation("login", RelationDef::attribute())
            .with_relation("name", RelationDef::attribute())
            .with_relation("in_group", RelationDef::relation())
    }

    fn repo() -> Repository {
        let system = MemorySource::new(SourceDescriptor::system(), schema())
            .with_entity(1, "User", &[("login", json!("admin"))])
            .with_entity(10, "Group", &[("name", json!("users"))])
            .with_relation(1, "in_group", 10)
            .with_relation(7, "in_group", 10);
        let ldap = MemorySource::new(
            SourceDescriptor::new("ldap")
                .with_entity("User", false)
                .with_relation("login", false),
            schema(),
        )
        .with_entity(7, "User", &[("login", json!("bob"))])
        .with_entity(8, "User", &[("login", json!("carol"))]);
        let mut repo = Repository::new(schema(), Rc::new(system));
        let ldap_id = repo.add_source(Rc::new(ldap));
        repo.register_eid(1, SourceId::SYSTEM);
        repo.register_eid(10, SourceId::SYSTEM);
        repo.register_eid(7, ldap_id);
        repo.register_eid(8, ldap_id);
        repo
    }

    fn users() -> Select {
        Select::any(&["X"])
            .with_relations(vec![Relation::new("X", "is", Operand::etype("User"))])
            .with_solutions(vec![solution(&[("X", "User")])])
    }

    fn plan(repo: &Repository, select: Select) -> ExecutionPlan {
        let mut plan = ExecutionPlan::new(Observer::silent());
        MultiSourcePlanner::new(repo, Observer::silent())
            .build_plan(&mut plan, &Statement::Select(Union::single(select)))
            .unwrap();
        plan
    }

    #[test]
    fn test_unsplit_branch_unions_sources() {
        let repo = repo();
        let plan = plan(&repo, users());
        assert_eq!(plan.steps().len(), 1);
        let top = &plan.steps()[0];
        assert_eq!(top.name(), "UnionStep");
        assert_eq!(top.children().len(), 2);
        assert!(top.children().iter().all(|c| c.name() == "OneFetchStep"));
        let mut rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        rows.sort_by_key(|r| r[0].as_i64());
        assert_eq!(rows, vec![vec![json!(1)], vec![json!(7)], vec![json!(8)]]);
    }

    #[test]
    fn test_split_branch_joins_on_system() {
        let repo = repo();
        let select = Select::any(&["X"])
            .with_relations(vec![
                Relation::new("X", "is", Operand::etype("User")),
                Relation::new("X", "in_group", Operand::var("G")),
                Relation::new("G", "name", Operand::string("users")),
            ])
            .with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])]);
        let plan = plan(&repo, select);
        let top = &plan.steps()[0];
        assert_eq!(top.name(), "OneFetchStep");
        let query = top.query().unwrap();
        assert_eq!(query.sources, vec![SourceId::SYSTEM]);
        assert_eq!(
            query.inputs["X"],
            vec![ColumnRef::new("table0", 0)]
        );
        assert_eq!(top.children()[0].name(), "FetchStep");

        let mut rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        rows.sort_by_key(|r| r[0].as_i64());
        assert_eq!(rows, vec![vec![json!(1)], vec![json!(7)]]);
    }

    #[test]
    fn test_window_over_several_sources() {
        let repo = repo();
        let plan = plan(&repo, users().with_limit(1).with_offset(1));
        let top = &plan.steps()[0];
        let query = top.query().unwrap();
        assert_eq!(query.limit, Some(1));
        assert_eq!(query.offset, 1);
        assert_eq!(query.union.children[0].limit, Some(2));
        let rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_ordering_goes_through_aggregate_step() {
        let repo = repo();
        let select = users().with_orderby(crate::syntax::SortTerm::desc(Operand::var("X")));
        let plan = plan(&repo, select);
        let top = &plan.steps()[0];
        assert!(matches!(top.kind(), StepKind::Aggr { .. }));
        let rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        assert_eq!(rows, vec![vec![json!(8)], vec![json!(7)], vec![json!(1)]]);
    }

    #[test]
    fn test_unknown_eid_short_circuits_branch() {
        let repo = repo();
        let select = Select::any(&["X"])
            .with_relations(vec![Relation::new("X", "eid", Operand::int(99))])
            .with_solutions(vec![solution(&[("X", "User")])]);
        let plan = plan(&repo, select);
        assert!(plan.steps().is_empty());
        let rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_identical_non_final_steps_are_shared() {
        let repo = repo();
        let branch = Select::any(&["X"])
            .with_relations(vec![
                Relation::new("X", "is", Operand::etype("User")),
                Relation::new("X", "in_group", Operand::var("G")),
                Relation::new("G", "name", Operand::string("users")),
            ])
            .with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])]);
        let mut other = branch.clone();
        other.limit = Some(5);
        let mut plan = ExecutionPlan::new(Observer::silent());
        MultiSourcePlanner::new(&repo, Observer::silent())
            .build_plan(
                &mut plan,
                &Statement::Select(Union::new(vec![branch, other])),
            )
            .unwrap();
        let top = &plan.steps()[0];
        assert_eq!(top.name(), "UnionStep");
        let first = &top.children()[0];
        let second = &top.children()[1];
        let fetch_a = &first.children()[0];
        let fetch_b = &second.children()[0].children()[0];
        assert!(Rc::ptr_eq(fetch_a, fetch_b));
    }

    #[test]
    fn test_or_binding_extra_variable_is_deduplicated() {
        let repo = repo();
        let mut select = Select::any(&["X"]);
        let is = select.rel(Relation::new("X", "is", Operand::etype("User")));
        let bob = select.rel(Relation::new("X", "login", Operand::string("bob")));
        let any = select.rel(Relation::new("X", "login", Operand::var("L")));
        let or = select.or(vec![bob, any]);
        let root = select.and(vec![is, or]);
        select.set_restriction(root);
        let select = select.with_solutions(vec![solution(&[("X", "User"), ("L", "String")])]);

        let plan = plan(&repo, select);
        let top = &plan.steps()[0];
        assert_eq!(top.name(), "UnionStep");
        for child in top.children() {
            assert!(child.query().unwrap().union.children[0].distinct);
        }
        let mut rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        rows.sort_by_key(|r| r[0].as_i64());
        assert_eq!(rows, vec![vec![json!(1)], vec![json!(7)], vec![json!(8)]]);
    }

    #[test]
    fn test_negated_attribute_checked_where_entities_live() {
        let repo = repo();
        let mut select = Select::any(&["X"]);
        let member = select.rel(Relation::new("X", "in_group", Operand::var("G")));
        let bob = select.rel(Relation::new("X", "login", Operand::string("bob")));
        let not = select.not(bob);
        let root = select.and(vec![member, not]);
        select.set_restriction(root);
        let select = select.with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])]);

        let plan = plan(&repo, select);
        let top = &plan.steps()[0];
        let fetch = &top.children()[0];
        assert_eq!(
            fetch.query().unwrap().union.to_string(),
            "Any X WHERE X is User, NOT X login \"bob\""
        );
        assert_eq!(top.query().unwrap().union.to_string(), "Any X WHERE X in_group G");
        let rows = plan.execute(Session::new(&repo), &QueryArgs::new()).unwrap();
        assert_eq!(rows, vec![vec![json!(1)]]);
    }
}
