//! Sub-statement extraction for one part step
//!
//! Walks the branch restriction and keeps the relations a step is
//! responsible for. OR / NOT / EXISTS subtrees are kept or dropped whole.
//! A subtree dropped by a non-final step is answered by the final step; the
//! attribute values it reads are selected by the step holding the entities.

use std::collections::{BTreeMap, BTreeSet};

use crate::source::Source;
use crate::syntax::{Node, NodeId, Operand, Optional, Relation, ScopeId, Select, Solution};

use super::partinfo::{PartPlanInformation, StepDef, Term};

/// Outcome of visiting one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Filtered {
    Kept(NodeId),
    /// The node cannot be answered by this step and is dropped from its parent
    Unsupported,
}

/// Sub-statement for one step
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredStep {
    pub select: Select,
    /// `(outer variable, fresh variable)` pairs re-attached by equality
    pub inserted: Vec<(String, String)>,
    /// Relation nodes of the branch answered by this step
    pub kept: BTreeSet<NodeId>,
    /// Deferred attribute relations -> selected variable holding their value
    pub values: BTreeMap<NodeId, String>,
}

pub struct TermsFiltererVisitor<'p, 'a> {
    info: &'p PartPlanInformation<'a>,
    placed: &'p BTreeSet<NodeId>,
    keep_modifiers: bool,
    values: BTreeMap<NodeId, String>,
}

struct FilterState<'s> {
    step: &'s StepDef,
    out: Select,
    bound: BTreeSet<String>,
    inserted: Vec<(String, String)>,
    kept: BTreeSet<NodeId>,
}

impl<'p, 'a> TermsFiltererVisitor<'p, 'a> {
    /// `placed` holds relations already answered by earlier steps
    pub fn new(info: &'p PartPlanInformation<'a>, placed: &'p BTreeSet<NodeId>) -> Self {
        Self {
            info,
            placed,
            keep_modifiers: false,
            values: BTreeMap::new(),
        }
    }

    /// Copies GROUP BY / ORDER BY / LIMIT / OFFSET into the final step
    pub fn keep_modifiers(mut self, keep: bool) -> Self {
        self.keep_modifiers = keep;
        self
    }

    /// Attribute values selected by earlier steps, read instead of the
    /// relations they stand for
    pub fn with_values(mut self, values: BTreeMap<NodeId, String>) -> Self {
        self.values = values;
        self
    }

    pub fn filter(&self, step: &StepDef) -> FilteredStep {
        let select = self.info.select();
        let mut bound = self.plainly_bound(step);
        let typed = if step.is_final {
            Vec::new()
        } else {
            self.unbound_entities(step, &bound)
        };
        bound.extend(typed.iter().map(|(var, _)| var.clone()));
        let mut state = FilterState {
            step,
            out: Select::default(),
            bound,
            inserted: Vec::new(),
            kept: BTreeSet::new(),
        };

        let mut roots: Vec<NodeId> = typed
            .iter()
            .map(|(var, etypes)| type_restriction(&mut state.out, var, etypes))
            .collect();
        if let Some(root) = select.restriction {
            if let Filtered::Kept(id) = self.visit(root, &mut state) {
                roots.push(id);
            }
        }
        let values = if step.is_final {
            BTreeMap::new()
        } else {
            self.value_columns(&mut state, &mut roots)
        };
        match roots.len() {
            0 => {}
            1 => state.out.set_restriction(roots[0]),
            _ => {
                let root = state.out.and(roots);
                state.out.set_restriction(root);
            }
        }

        let mut out = state.out;
        if step.is_final {
            out.selection = select.selection.clone();
            out.distinct = select.distinct;
            if self.keep_modifiers {
                out.groupby = select.groupby.clone();
                out.orderby = select.orderby.clone();
                out.limit = select.limit;
                out.offset = select.offset;
            }
        } else {
            out.selection = step
                .needsel
                .iter()
                .filter(|v| state.bound.contains(*v))
                .map(Operand::var)
                .collect();
            if out.selection.is_empty() {
                let scopes = self.info.scopes();
                out.selection = state
                    .bound
                    .iter()
                    .filter(|v| scopes.var_scope(v) == ScopeId::Root)
                    .map(Operand::var)
                    .collect();
            }
            for (_, fresh) in &state.inserted {
                out.selection.push(Operand::var(fresh.clone()));
            }
            for var in values.values() {
                out.selection.push(Operand::var(var.clone()));
            }
            out.distinct = !state.inserted.is_empty();
        }
        out.solutions = self.step_solutions(&out, step);

        FilteredStep {
            select: out,
            inserted: state.inserted,
            kept: state.kept,
            values,
        }
    }

    /// Root variables held by the step that no kept relation binds, with the
    /// entity types every step source can enumerate
    fn unbound_entities(&self, step: &StepDef, bound: &BTreeSet<String>) -> Vec<(String, Vec<String>)> {
        let select = self.info.select();
        let repo = self.info.repo();
        let mut unbound = Vec::new();
        for var in &step.needsel {
            if bound.contains(var)
                || self.info.scopes().var_scope(var) != ScopeId::Root
                || !step.terms.contains(&Term::Var(var.clone()))
            {
                continue;
            }
            let mut etypes: Vec<String> = Vec::new();
            for index in &step.solindices {
                let Some(etype) = select.solutions.get(*index).and_then(|s| s.get(var)) else {
                    continue;
                };
                let enumerable = step
                    .sources
                    .iter()
                    .all(|s| repo.source(*s).support_entity(etype, false));
                if enumerable && !etypes.contains(etype) {
                    etypes.push(etype.clone());
                }
            }
            if !etypes.is_empty() {
                unbound.push((var.clone(), etypes));
            }
        }
        unbound
    }

    /// Selects the value of attributes read by subtrees this step dropped
    ///
    /// Only sources holding an entity know its attributes, so the final step
    /// compares these values instead of reading the attribute again.
    fn value_columns(&self, state: &mut FilterState<'_>, roots: &mut Vec<NodeId>) -> BTreeMap<NodeId, String> {
        let select = self.info.select();
        let repo = self.info.repo();
        let mut values = BTreeMap::new();
        for id in select.reachable_relations() {
            if state.kept.contains(&id)
                || self.placed.contains(&id)
                || self.info.scopes().atomic_root(select, id).is_none()
            {
                continue;
            }
            let Some(rel) = select.relation(id) else { continue };
            if !repo.schema().is_final(&rel.rtype) || matches!(rel.rtype.as_str(), "eid" | "has_text") {
                continue;
            }
            if !state.bound.contains(&rel.lhs) || !state.step.terms.contains(&Term::Var(rel.lhs.clone())) {
                continue;
            }
            let supported = state
                .step
                .sources
                .iter()
                .all(|s| repo.source(*s).support_relation(&rel.rtype, false));
            if !supported {
                continue;
            }
            let var = self.value_var(id);
            let value = Relation::new(rel.lhs.clone(), rel.rtype.clone(), Operand::var(var.clone()))
                .with_optional(Optional::Right);
            roots.push(state.out.rel(value));
            values.insert(id, var);
        }
        values
    }

    fn value_var(&self, id: NodeId) -> String {
        let existing = self.info.select().variables();
        let mut name = format!("A{}", id.0);
        while existing.contains(&name) {
            name.push('_');
        }
        name
    }

    /// The relation as emitted, comparing a selected value when one stands
    /// for it
    fn emitted(&self, id: NodeId, rel: &Relation) -> Relation {
        match self.values.get(&id) {
            Some(var) => Relation::new(var.clone(), "identity", rel.rhs.clone()).with_op(rel.op),
            None => rel.clone(),
        }
    }

    fn keeps(&self, id: NodeId, rel: &Relation, step: &StepDef) -> bool {
        if self.placed.contains(&id) {
            return false;
        }
        if !step.is_final {
            match self.info.owner(id) {
                Some(owner) if step.terms.contains(owner) => {}
                _ => return false,
            }
        }
        let repo = self.info.repo();
        step.sources
            .iter()
            .all(|s| repo.source(*s).support_relation(&rel.rtype, false))
    }

    /// Variables bound by kept relations outside any OR / NOT / EXISTS
    fn plainly_bound(&self, step: &StepDef) -> BTreeSet<String> {
        let select = self.info.select();
        let mut bound = BTreeSet::new();
        for id in select.reachable_relations() {
            let Some(rel) = select.relation(id) else { continue };
            if self.info.scopes().atomic_root(select, id).is_none() && self.keeps(id, rel, step) {
                bound.extend(rel.variables());
            }
        }
        bound
    }

    fn visit(&self, id: NodeId, state: &mut FilterState<'_>) -> Filtered {
        let select = self.info.select();
        match select.node(id) {
            Node::Relation(rel) => {
                if !self.keeps(id, rel, state.step) {
                    return Filtered::Unsupported;
                }
                state.kept.insert(id);
                Filtered::Kept(state.out.rel(self.emitted(id, rel)))
            }
            Node::And(children) => {
                let kept: Vec<NodeId> = children
                    .iter()
                    .filter_map(|c| match self.visit(*c, state) {
                        Filtered::Kept(k) => Some(k),
                        Filtered::Unsupported => None,
                    })
                    .collect();
                match kept.len() {
                    0 => Filtered::Unsupported,
                    1 => Filtered::Kept(kept[0]),
                    _ => Filtered::Kept(state.out.and(kept)),
                }
            }
            Node::Or(_) | Node::Not(_) => self.visit_atomic(id, state),
            Node::Exists(child) => match self.visit_atomic(id, state) {
                Filtered::Unsupported => self.hoist_exists(id, *child, state),
                kept => kept,
            },
        }
    }

    fn visit_atomic(&self, id: NodeId, state: &mut FilterState<'_>) -> Filtered {
        let select = self.info.select();
        let mut relations = Vec::new();
        select.collect_relations(id, &mut relations);
        let all_kept = relations.iter().all(|r| {
            select
                .relation(*r)
                .map(|rel| self.keeps(*r, rel, state.step))
                .unwrap_or(false)
        });
        if !all_kept {
            return Filtered::Unsupported;
        }
        let nested = matches!(select.node(id), Node::Not(_) | Node::Exists(_));
        // left to the final step, which reads every temp table
        if nested && !state.step.is_final && !self.outer_vars(id).is_subset(&state.bound) {
            return Filtered::Unsupported;
        }
        state.kept.extend(relations);
        Filtered::Kept(self.copy(id, &BTreeMap::new(), &mut state.out))
    }

    /// EXISTS over an unbound outer variable in a non-final step
    ///
    /// The subtree is inlined with the variable renamed to a fresh `V<n>`,
    /// selected and re-attached by equality downstream.
    fn hoist_exists(&self, id: NodeId, child: NodeId, state: &mut FilterState<'_>) -> Filtered {
        if state.step.is_final {
            return Filtered::Unsupported;
        }
        let select = self.info.select();
        let mut relations = Vec::new();
        select.collect_relations(id, &mut relations);
        let all_kept = relations.iter().all(|r| {
            select
                .relation(*r)
                .map(|rel| self.keeps(*r, rel, state.step))
                .unwrap_or(false)
        });
        if !all_kept {
            return Filtered::Unsupported;
        }
        let mut renames = BTreeMap::new();
        for var in self.outer_vars(id) {
            if state.bound.contains(&var) {
                continue;
            }
            let fresh = self.fresh_var(&state.out, state.inserted.len());
            state.inserted.push((var.clone(), fresh.clone()));
            renames.insert(var, fresh);
        }
        state.kept.extend(relations);
        Filtered::Kept(self.copy(child, &renames, &mut state.out))
    }

    fn fresh_var(&self, out: &Select, taken: usize) -> String {
        let existing = self.info.select().variables();
        let mut n = taken;
        loop {
            let name = format!("V{}", n);
            if !existing.contains(&name) && !out.variables().contains(&name) {
                return name;
            }
            n += 1;
        }
    }

    /// Variables used below `id` but living in an enclosing scope
    fn outer_vars(&self, id: NodeId) -> BTreeSet<String> {
        let select = self.info.select();
        let scopes = self.info.scopes();
        let own = ScopeId::Nested(id);
        let mut relations = Vec::new();
        select.collect_relations(id, &mut relations);
        relations
            .into_iter()
            .filter_map(|r| select.relation(r))
            .flat_map(|rel| rel.variables())
            .filter(|v| !scopes.is_within(scopes.var_scope(v), own))
            .collect()
    }

    fn copy(&self, id: NodeId, renames: &BTreeMap<String, String>, out: &mut Select) -> NodeId {
        let select = self.info.select();
        match select.node(id) {
            Node::Relation(rel) => {
                let mut rel = self.emitted(id, rel);
                if let Some(to) = renames.get(&rel.lhs) {
                    rel.lhs = to.clone();
                }
                for (from, to) in renames {
                    rel.rhs.rename(from, to);
                }
                out.rel(rel)
            }
            Node::And(children) => {
                let ids = children.iter().map(|c| self.copy(*c, renames, out)).collect();
                out.and(ids)
            }
            Node::Or(children) => {
                let ids = children.iter().map(|c| self.copy(*c, renames, out)).collect();
                out.or(ids)
            }
            Node::Not(child) => {
                let inner = self.copy(*child, renames, out);
                out.not(inner)
            }
            Node::Exists(child) => {
                let inner = self.copy(*child, renames, out);
                out.exists(inner)
            }
        }
    }

    /// Solutions of the step restricted to the variables left in `out`
    fn step_solutions(&self, out: &Select, step: &StepDef) -> Vec<Solution> {
        let branch = &self.info.select().solutions;
        let vars = out.variables();
        let mut solutions: Vec<Solution> = Vec::new();
        for index in &step.solindices {
            let Some(solution) = branch.get(*index) else { continue };
            let restricted: Solution = solution
                .iter()
                .filter(|(var, _)| vars.contains(*var))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !solutions.contains(&restricted) {
                solutions.push(restricted);
            }
        }
        solutions
    }
}

/// `var is T`, or an OR of them over several types
fn type_restriction(out: &mut Select, var: &str, etypes: &[String]) -> NodeId {
    let ids: Vec<NodeId> = etypes
        .iter()
        .map(|etype| out.rel(Relation::new(var, "is", Operand::etype(etype.clone()))))
        .collect();
    if ids.len() == 1 {
        ids[0]
    } else {
        out.or(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::annotator::Annotator;
    use crate::planner::partinfo::Term;
    use crate::schema::{RelationDef, Schema};
    use crate::source::{MemorySource, Repository, SourceDescriptor, SourceId};
    use crate::syntax::{solution, Relation};
    use std::rc::Rc;

    fn schema() -> Schema {
        Schema::new()
            .with_relation("login", RelationDef::attribute())
            .with_relation("name", RelationDef::attribute())
            .with_relation("in_group", RelationDef::relation())
    }

    fn repo() -> Repository {
        let mut repo = Repository::new(
            schema(),
            Rc::new(MemorySource::new(SourceDescriptor::system(), schema())),
        );
        let ldap = SourceDescriptor::new("ldap")
            .with_entity("User", false)
            .with_relation("login", false);
        repo.add_source(Rc::new(MemorySource::new(ldap, schema())));
        repo
    }

    fn users_in_group() -> Select {
        Select::any(&["X", "L"])
            .with_relations(vec![
                Relation::new("X", "is", Operand::etype("User")),
                Relation::new("X", "login", Operand::var("L")),
                Relation::new("X", "in_group", Operand::var("G")),
                Relation::new("G", "name", Operand::string("users")),
            ])
            .with_solutions(vec![solution(&[
                ("X", "User"),
                ("L", "String"),
                ("G", "Group"),
            ])])
            .with_limit(5)
    }

    #[test]
    fn test_split_branch_filters_per_step() {
        let repo = repo();
        let select = users_in_group();
        let ann = Annotator::new(repo.schema()).annotate(std::slice::from_ref(&select));
        let info = PartPlanInformation::new(&repo, &select, ann.branch(0));
        let steps = info.part_steps();
        assert_eq!(steps.len(), 2);

        let mut placed = BTreeSet::new();
        let first = TermsFiltererVisitor::new(&info, &placed).filter(&steps[0]);
        assert_eq!(first.select.to_string(), "Any L,X WHERE X is User, X login L");
        assert_eq!(
            first.select.solutions,
            vec![solution(&[("L", "String"), ("X", "User")])]
        );
        placed.extend(first.kept.iter().copied());

        let last = TermsFiltererVisitor::new(&info, &placed)
            .keep_modifiers(true)
            .filter(&steps[1]);
        assert_eq!(
            last.select.to_string(),
            "Any X,L LIMIT 5 WHERE X in_group G, G name \"users\""
        );
        assert!(last.inserted.is_empty());
    }

    #[test]
    fn test_modifiers_dropped_without_sole_producer() {
        let repo = repo();
        let select = users_in_group();
        let ann = Annotator::new(repo.schema()).annotate(std::slice::from_ref(&select));
        let info = PartPlanInformation::new(&repo, &select, ann.branch(0));
        let steps = info.part_steps();
        let placed: BTreeSet<NodeId> = BTreeSet::from([NodeId(0), NodeId(1)]);
        let last = TermsFiltererVisitor::new(&info, &placed).filter(&steps[1]);
        assert_eq!(last.select.limit, None);
    }

    #[test]
    fn test_negation_deferred_when_outer_variable_unbound() {
        let repo = repo();
        let mut select = Select::any(&["X"]);
        let owned = select.rel(Relation::new("X", "in_group", Operand::var("G")));
        let not = select.not(owned);
        let root = select.and(vec![not]);
        select.set_restriction(root);
        let select = select.with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])]);

        let ann = Annotator::new(repo.schema()).annotate(std::slice::from_ref(&select));
        let info = PartPlanInformation::new(&repo, &select, ann.branch(0));
        let step = StepDef {
            sources: vec![SourceId::SYSTEM],
            terms: BTreeSet::from([Term::Rel(NodeId(0)), Term::Var("G".into())]),
            solindices: BTreeSet::from([0]),
            scope: ScopeId::Root,
            needsel: vec!["G".into()],
            is_final: false,
        };
        let placed = BTreeSet::new();
        let filtered = TermsFiltererVisitor::new(&info, &placed).filter(&step);
        assert!(filtered.kept.is_empty());
        assert_eq!(filtered.select.restriction, None);
    }

    #[test]
    fn test_exists_hoists_outer_variable() {
        let repo = repo();
        let mut select = Select::any(&["X"]);
        let is = select.rel(Relation::new("X", "is", Operand::etype("User")));
        let member = select.rel(Relation::new("X", "in_group", Operand::var("G")));
        let exists = select.exists(member);
        let root = select.and(vec![is, exists]);
        select.set_restriction(root);
        let select = select.with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])]);

        let ann = Annotator::new(repo.schema()).annotate(std::slice::from_ref(&select));
        let info = PartPlanInformation::new(&repo, &select, ann.branch(0));
        let step = StepDef {
            sources: vec![SourceId::SYSTEM],
            terms: BTreeSet::from([Term::Rel(NodeId(1)), Term::Var("G".into())]),
            solindices: BTreeSet::from([0]),
            scope: ScopeId::Nested(NodeId(2)),
            needsel: vec![],
            is_final: false,
        };
        let placed = BTreeSet::new();
        let filtered = TermsFiltererVisitor::new(&info, &placed).filter(&step);
        assert_eq!(
            filtered.inserted,
            vec![("X".to_string(), "V0".to_string())]
        );
        assert_eq!(filtered.select.to_string(), "DISTINCT Any V0 WHERE V0 in_group G");
        assert_eq!(filtered.kept, BTreeSet::from([NodeId(1)]));
    }

    #[test]
    fn test_unbound_held_variable_is_typed() {
        let repo = repo();
        let mut select = Select::any(&["X"]);
        let member = select.rel(Relation::new("X", "in_group", Operand::var("G")));
        let bob = select.rel(Relation::new("X", "login", Operand::string("bob")));
        let not = select.not(bob);
        let root = select.and(vec![member, not]);
        select.set_restriction(root);
        let select = select.with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])]);

        let ann = Annotator::new(repo.schema()).annotate(std::slice::from_ref(&select));
        let info = PartPlanInformation::new(&repo, &select, ann.branch(0));
        let steps = info.part_steps();
        assert_eq!(steps[0].terms, BTreeSet::from([Term::Var("X".into())]));

        let placed = BTreeSet::new();
        let first = TermsFiltererVisitor::new(&info, &placed).filter(&steps[0]);
        assert_eq!(
            first.select.to_string(),
            "Any X WHERE X is User, NOT X login \"bob\""
        );
        assert_eq!(first.kept, BTreeSet::from([bob]));
        assert!(first.values.is_empty());
    }

    #[test]
    fn test_deferred_or_reads_selected_value() {
        let repo = repo();
        let mut select = Select::any(&["X"]);
        let is = select.rel(Relation::new("X", "is", Operand::etype("User")));
        let bob = select.rel(Relation::new("X", "login", Operand::string("bob")));
        let member = select.rel(Relation::new("X", "in_group", Operand::var("G")));
        let or = select.or(vec![bob, member]);
        let root = select.and(vec![is, or]);
        select.set_restriction(root);
        let select = select.with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])]);

        let ann = Annotator::new(repo.schema()).annotate(std::slice::from_ref(&select));
        let info = PartPlanInformation::new(&repo, &select, ann.branch(0));
        assert!(info.needsplit());
        let steps = info.part_steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].sources.len(), 2);

        let mut placed = BTreeSet::new();
        let first = TermsFiltererVisitor::new(&info, &placed).filter(&steps[0]);
        assert_eq!(
            first.select.to_string(),
            "Any X,A1 WHERE X is User, X login A1?"
        );
        assert_eq!(first.values, BTreeMap::from([(bob, "A1".to_string())]));
        placed.extend(first.kept.iter().copied());

        let last = TermsFiltererVisitor::new(&info, &placed)
            .with_values(first.values.clone())
            .filter(&steps[1]);
        assert_eq!(
            last.select.to_string(),
            "Any X WHERE (A1 identity \"bob\") OR (X in_group G)"
        );
    }
}
