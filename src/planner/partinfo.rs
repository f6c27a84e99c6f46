//! Per-branch source coverage analysis
//!
//! `PartPlanInformation` maps every source to the terms (variables,
//! non-final relations, eid constants) it can answer, per solution index. The
//! map decides whether a branch can be sent as a whole to its sources or must
//! be decomposed, and drives the greedy decomposition into part steps.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::schema::is_final_type;
use crate::source::{Repository, Source, SourceId};
use crate::syntax::{Constant, NodeId, Operand, Relation, ScopeId, ScopeMap, Select, Solution};

use super::annotator::BranchAnnotations;

/// Unit of source coverage
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Term {
    Var(String),
    /// Non-final relation node
    Rel(NodeId),
    /// Eid constant on the right of the relation node
    Const(NodeId),
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(name) => write!(f, "{}", name),
            Term::Rel(id) => write!(f, "R{}", id.0),
            Term::Const(id) => write!(f, "C{}", id.0),
        }
    }
}

/// Source -> term -> solution indices
pub type SourceTerms = BTreeMap<SourceId, BTreeMap<Term, BTreeSet<usize>>>;

/// One step of a decomposed branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDef {
    pub sources: Vec<SourceId>,
    pub terms: BTreeSet<Term>,
    pub solindices: BTreeSet<usize>,
    pub scope: ScopeId,
    /// Variables a non-final step must output for later steps
    pub needsel: Vec<String>,
    pub is_final: bool,
}

pub struct PartPlanInformation<'a> {
    repo: &'a Repository,
    select: &'a Select,
    annotations: &'a BranchAnnotations,
    scopes: ScopeMap,
    solutions: Vec<Solution>,
    entity_vars: BTreeSet<String>,
    owners: BTreeMap<NodeId, Term>,
    terms: BTreeSet<Term>,
    links: BTreeSet<(Term, Term)>,
    sourcesterms: SourceTerms,
    crossed: BTreeSet<Term>,
    split_hint: bool,
    needsplit: bool,
    empty: bool,
}

impl<'a> PartPlanInformation<'a> {
    pub fn new(
        repo: &'a Repository,
        select: &'a Select,
        annotations: &'a BranchAnnotations,
    ) -> Self {
        let solutions = if select.solutions.is_empty() {
            vec![Solution::new()]
        } else {
            select.solutions.clone()
        };
        let mut info = Self {
            repo,
            select,
            annotations,
            scopes: ScopeMap::build(select),
            solutions,
            entity_vars: BTreeSet::new(),
            owners: BTreeMap::new(),
            terms: BTreeSet::new(),
            links: BTreeSet::new(),
            sourcesterms: SourceTerms::new(),
            crossed: BTreeSet::new(),
            split_hint: false,
            needsplit: false,
            empty: false,
        };
        info.collect_entity_vars();
        info.collect_owners();
        if !info.collect_terms() {
            info.empty = true;
            return info;
        }
        loop {
            let pruned = info.remove_invalid_sources();
            let grouped = info.restrict_atomic_groups();
            if !pruned && !grouped {
                break;
            }
        }
        info.system_fallback();
        info.collect_crossed();
        info.compute_needsplit();
        info
    }

    /// Branch proven empty (unknown eid): nothing must be fetched
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn needsplit(&self) -> bool {
        self.needsplit
    }

    pub fn sourcesterms(&self) -> &SourceTerms {
        &self.sourcesterms
    }

    pub fn select(&self) -> &'a Select {
        self.select
    }

    pub fn repo(&self) -> &'a Repository {
        self.repo
    }

    pub fn scopes(&self) -> &ScopeMap {
        &self.scopes
    }

    /// Term a relation node belongs to
    pub fn owner(&self, id: NodeId) -> Option<&Term> {
        self.owners.get(&id)
    }

    /// Sources holding at least one term, in id order
    pub fn sources(&self) -> Vec<SourceId> {
        let active: Vec<SourceId> = self
            .sourcesterms
            .iter()
            .filter(|(_, terms)| !terms.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if active.is_empty() {
            vec![SourceId::SYSTEM]
        } else {
            active
        }
    }

    /// `uri: term{solutions},...` per source
    pub fn coverage(&self) -> Vec<String> {
        self.sourcesterms
            .iter()
            .map(|(source, terms)| {
                let listed: Vec<String> = terms
                    .iter()
                    .map(|(term, sols)| {
                        let sols: Vec<String> = sols.iter().map(|s| s.to_string()).collect();
                        format!("{}{{{}}}", term, sols.join(","))
                    })
                    .collect();
                format!("{}: {}", self.repo.uri(*source), listed.join(","))
            })
            .collect()
    }

    fn relations(&self) -> impl Iterator<Item = (NodeId, &'a Relation)> + '_ {
        let select = self.select;
        select
            .reachable_relations()
            .into_iter()
            .filter_map(move |id| select.relation(id).map(|rel| (id, rel)))
    }

    fn collect_entity_vars(&mut self) {
        let schema = self.repo.schema();
        for var in self.select.variables() {
            let types = self.select.var_types(&var);
            let entity = if types.is_empty() {
                self.relations().any(|(_, rel)| {
                    rel.lhs == var
                        || (rel.rhs_var() == Some(var.as_str())
                            && rel.rtype != "is"
                            && !schema.is_final(&rel.rtype))
                })
            } else {
                types.iter().any(|t| !is_final_type(t))
            };
            if entity {
                self.entity_vars.insert(var);
            }
        }
    }

    fn collect_owners(&mut self) {
        let schema = self.repo.schema();
        let owners: Vec<(NodeId, Term)> = self
            .relations()
            .map(|(id, rel)| {
                let owner = if is_join_relation(schema.is_final(&rel.rtype), &rel.rtype) {
                    Term::Rel(id)
                } else {
                    Term::Var(rel.lhs.clone())
                };
                (id, owner)
            })
            .collect();
        self.owners.extend(owners);
    }

    /// Builds the initial coverage; false when an eid cannot be located
    fn collect_terms(&mut self) -> bool {
        let all: BTreeSet<usize> = (0..self.solutions.len()).collect();
        let mut fixed: BTreeMap<String, SourceId> = BTreeMap::new();
        for (id, rel) in self.relations() {
            if let Some(eid) = rel.fixed_eid() {
                if self.scopes.is_negated(self.select, id) {
                    continue;
                }
                match self.repo.source_from_eid(eid) {
                    Some(source) => {
                        fixed.insert(rel.lhs.clone(), source);
                    }
                    None => return false,
                }
            }
        }

        let repo = self.repo;
        let select = self.select;
        let vars: Vec<String> = self.entity_vars.iter().cloned().collect();
        for var in vars {
            let term = Term::Var(var.clone());
            self.terms.insert(term.clone());
            if self.lacks_relation(&var) {
                self.split_hint = true;
            }
            for source in repo.source_ids() {
                let sols: BTreeSet<usize> = all
                    .iter()
                    .copied()
                    .filter(|i| match fixed.get(&var) {
                        Some(owner) => *owner == source,
                        None => self.var_supported(source, &var, *i),
                    })
                    .collect();
                if !sols.is_empty() {
                    self.sourcesterms
                        .entry(source)
                        .or_default()
                        .insert(term.clone(), sols);
                }
            }
        }

        let owned: Vec<(NodeId, Term)> = self
            .owners
            .iter()
            .map(|(id, t)| (*id, t.clone()))
            .collect();
        for (id, owner) in owned {
            let Term::Rel(_) = owner else { continue };
            let Some(rel) = select.relation(id) else { continue };
            self.terms.insert(owner.clone());
            for source in self.repo.rel_type_sources(&rel.rtype) {
                self.sourcesterms
                    .entry(source)
                    .or_default()
                    .insert(owner.clone(), all.clone());
            }
            for var in rel.variables() {
                if self.entity_vars.contains(&var) {
                    self.links.insert((Term::Var(var), owner.clone()));
                }
            }
            if let Operand::Const(Constant::Int(eid)) = &rel.rhs {
                let Some(source) = self.repo.source_from_eid(*eid) else {
                    return false;
                };
                let constant = Term::Const(id);
                self.terms.insert(constant.clone());
                self.sourcesterms
                    .entry(source)
                    .or_default()
                    .insert(constant.clone(), all.clone());
                self.links.insert((constant, owner.clone()));
            }
        }
        true
    }

    /// Whether `source` can answer `var` under solution `index`
    ///
    /// The type must be supported, as must every attribute read on `var`.
    /// Non-invariant variables also need one supported relation besides
    /// `eid` / `identity`.
    fn var_supported(&self, source: SourceId, var: &str, index: usize) -> bool {
        let src = self.repo.source(source);
        match self.solutions[index].get(var) {
            Some(etype) => {
                if !src.support_entity(etype, false) {
                    return false;
                }
            }
            None => {
                if !source.is_system() {
                    return false;
                }
            }
        }

        let schema = self.repo.schema();
        let mut used = Vec::new();
        for (_, rel) in self.relations() {
            if rel.lhs != var && rel.rhs_var() != Some(var) {
                continue;
            }
            let attribute = rel.lhs == var && schema.is_final(&rel.rtype) && rel.rtype != "eid";
            if attribute && !src.support_relation(&rel.rtype, false) {
                return false;
            }
            if !matches!(rel.rtype.as_str(), "eid" | "identity") {
                used.push(rel.rtype.clone());
            }
        }
        if self.annotations.is_invariant(var) {
            return true;
        }
        used.is_empty() || used.iter().any(|r| src.support_relation(r, false))
    }

    /// A non-invariant variable uses a relation some type-matching source lacks
    fn lacks_relation(&self, var: &str) -> bool {
        if self.annotations.is_invariant(var) {
            return false;
        }
        let types = self.select.var_types(var);
        self.repo.source_ids().any(|id| {
            let src = self.repo.source(id);
            types.iter().any(|t| src.support_entity(t, false))
                && self.relations().any(|(_, rel)| {
                    (rel.lhs == var || rel.rhs_var() == Some(var))
                        && !matches!(rel.rtype.as_str(), "eid" | "identity")
                        && !src.support_relation(&rel.rtype, false)
                })
        })
    }

    /// Endpoints of a non-crossable relation must share a source
    fn remove_invalid_sources(&mut self) -> bool {
        let repo = self.repo;
        let select = self.select;
        let mut changed_any = false;
        loop {
            let mut changed = false;
            for (term, rel_term) in self.links.clone() {
                let Term::Rel(id) = rel_term else { continue };
                let Some(rel) = select.relation(id) else { continue };
                if repo.can_cross_relation(&rel.rtype) || self.scopes.is_negated(select, id)
                {
                    continue;
                }
                for source in repo.source_ids() {
                    let a = self.solutions_at(source, &term);
                    let b = self.solutions_at(source, &rel_term);
                    let both: BTreeSet<usize> = a.intersection(&b).copied().collect();
                    if both != a {
                        self.set_solutions(source, &term, both.clone());
                        changed = true;
                    }
                    if both != b {
                        self.set_solutions(source, &rel_term, both);
                        changed = true;
                    }
                }
            }
            if !changed {
                return changed_any;
            }
            changed_any = true;
        }
    }

    /// Relations under one OR / NOT / EXISTS subtree stay on common sources
    ///
    /// Variables keep their coverage: a subtree no single source answers is
    /// left to the final step, fed with the variables fetched from each source.
    fn restrict_atomic_groups(&mut self) -> bool {
        let repo = self.repo;
        let mut changed = false;
        for group in self.atomic_groups().into_values() {
            for source in repo.source_ids() {
                let present = group
                    .iter()
                    .all(|t| !self.solutions_at(source, t).is_empty());
                if present {
                    continue;
                }
                for term in &group {
                    if matches!(term, Term::Var(_)) {
                        continue;
                    }
                    if !self.solutions_at(source, term).is_empty() {
                        self.set_solutions(source, term, BTreeSet::new());
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// Atomic subtree root -> terms owning its relations
    fn atomic_groups(&self) -> BTreeMap<NodeId, BTreeSet<Term>> {
        let mut groups: BTreeMap<NodeId, BTreeSet<Term>> = BTreeMap::new();
        for (id, owner) in &self.owners {
            if let Some(root) = self.scopes.atomic_root(self.select, *id) {
                if !self.terms.contains(owner) {
                    continue;
                }
                let group = groups.entry(root).or_default();
                group.insert(owner.clone());
                if self.terms.contains(&Term::Const(*id)) {
                    group.insert(Term::Const(*id));
                }
            }
        }
        groups
    }

    /// Every (term, solution) no source kept goes to the system source
    fn system_fallback(&mut self) {
        let all: BTreeSet<usize> = (0..self.solutions.len()).collect();
        for term in self.terms.clone() {
            let mut covered = BTreeSet::new();
            for terms in self.sourcesterms.values() {
                if let Some(sols) = terms.get(&term) {
                    covered.extend(sols.iter().copied());
                }
            }
            let missing: BTreeSet<usize> = all.difference(&covered).copied().collect();
            if !missing.is_empty() {
                let mut sols = self.solutions_at(SourceId::SYSTEM, &term);
                sols.extend(missing);
                self.set_solutions(SourceId::SYSTEM, &term, sols);
            }
        }
    }

    fn collect_crossed(&mut self) {
        for (var_term, rel_term) in &self.links {
            let Term::Rel(id) = rel_term else { continue };
            let Some(rel) = self.select.relation(*id) else { continue };
            if self.repo.can_cross_relation(&rel.rtype)
                && self.term_sources(var_term) != self.term_sources(rel_term)
            {
                self.crossed.insert(rel_term.clone());
            }
        }
    }

    fn compute_needsplit(&mut self) {
        let active = self.sources();
        if active.len() < 2 {
            self.needsplit = false;
            return;
        }
        let coverage = |source: &SourceId| -> BTreeMap<&Term, &BTreeSet<usize>> {
            self.sourcesterms
                .get(source)
                .map(|terms| {
                    terms
                        .iter()
                        .filter(|(t, _)| !matches!(t, Term::Const(_)))
                        .collect()
                })
                .unwrap_or_default()
        };
        let first = coverage(&active[0]);
        let split = self.split_hint || active[1..].iter().any(|s| coverage(s) != first);
        self.needsplit = split;
    }

    fn solutions_at(&self, source: SourceId, term: &Term) -> BTreeSet<usize> {
        self.sourcesterms
            .get(&source)
            .and_then(|terms| terms.get(term))
            .cloned()
            .unwrap_or_default()
    }

    fn set_solutions(&mut self, source: SourceId, term: &Term, sols: BTreeSet<usize>) {
        let terms = self.sourcesterms.entry(source).or_default();
        if sols.is_empty() {
            terms.remove(term);
        } else {
            terms.insert(term.clone(), sols);
        }
    }

    fn term_sources(&self, term: &Term) -> BTreeSet<SourceId> {
        self.sourcesterms
            .iter()
            .filter(|(_, terms)| terms.contains_key(term))
            .map(|(id, _)| *id)
            .collect()
    }

    fn term_scope(&self, term: &Term) -> ScopeId {
        match term {
            Term::Var(name) => self.scopes.var_scope(name),
            Term::Rel(id) | Term::Const(id) => self.scopes.scope_of(*id),
        }
    }

    /// Terms linked to `term` through a relation or a shared atomic subtree
    fn neighbours(&self, term: &Term, groups: &BTreeMap<NodeId, BTreeSet<Term>>) -> BTreeSet<Term> {
        let mut out = BTreeSet::new();
        for (a, b) in &self.links {
            if a == term {
                out.insert(b.clone());
            } else if b == term {
                out.insert(a.clone());
            }
        }
        for group in groups.values() {
            if group.contains(term) {
                out.extend(group.iter().cloned());
            }
        }
        out.remove(term);
        out
    }

    fn choose_term(&self, terms: &BTreeMap<Term, BTreeSet<usize>>) -> Option<Term> {
        terms
            .iter()
            .min_by_key(|(term, sols)| {
                let rank = match term {
                    Term::Var(name)
                        if !self.annotations.is_invariant(name)
                            && self.links.iter().any(|(a, r)| a == *term && self.crossed.contains(r)) =>
                    {
                        0
                    }
                    Term::Rel(_) if self.crossed.contains(*term) => 1,
                    _ if self.term_scope(term) != ScopeId::Root => 2,
                    Term::Var(_) => 3,
                    Term::Const(_) => 4,
                    Term::Rel(_) => 5,
                };
                let weight = if rank == 3 { sols.len() } else { 0 };
                (rank, weight, (*term).clone())
            })
            .map(|(term, _)| term.clone())
    }

    /// Greedy decomposition of a split branch
    ///
    /// Non-system sources are drained first; the last step is final and
    /// touches the system source only, which can read every temp table.
    pub fn part_steps(&self) -> Vec<StepDef> {
        let all: BTreeSet<usize> = (0..self.solutions.len()).collect();
        if !self.needsplit {
            return vec![StepDef {
                sources: self.sources(),
                terms: self.terms.clone(),
                solindices: all,
                scope: ScopeId::Root,
                needsel: Vec::new(),
                is_final: true,
            }];
        }

        let groups = self.atomic_groups();
        let mut order: Vec<SourceId> = self
            .repo
            .source_ids()
            .filter(|s| !s.is_system())
            .collect();
        order.push(SourceId::SYSTEM);

        let mut remaining = self.sourcesterms.clone();
        let mut steps: Vec<StepDef> = Vec::new();
        while let Some(source) = order
            .iter()
            .copied()
            .find(|s| remaining.get(s).map(|t| !t.is_empty()).unwrap_or(false))
        {
            let Some(term) = remaining.get(&source).and_then(|t| self.choose_term(t)) else {
                break;
            };
            let holders = |remaining: &SourceTerms, term: &Term| -> Vec<SourceId> {
                remaining
                    .iter()
                    .filter(|(_, terms)| terms.contains_key(term))
                    .map(|(id, _)| *id)
                    .collect()
            };
            let sources = holders(&remaining, &term);

            let mut terms: BTreeSet<Term> = BTreeSet::from([term.clone()]);
            loop {
                let candidates: BTreeSet<Term> = terms
                    .iter()
                    .flat_map(|t| self.neighbours(t, &groups))
                    .filter(|t| !terms.contains(t))
                    .collect();
                let added: Vec<Term> = candidates
                    .into_iter()
                    .filter(|c| holders(&remaining, c) == sources)
                    .collect();
                if added.is_empty() {
                    break;
                }
                terms.extend(added);
            }

            let mut solindices = BTreeSet::new();
            for s in &sources {
                if let Some(held) = remaining.get_mut(s) {
                    for t in &terms {
                        if let Some(sols) = held.remove(t) {
                            solindices.extend(sols);
                        }
                    }
                }
            }
            steps.push(StepDef {
                sources,
                scope: self.term_scope(&term),
                terms,
                solindices,
                needsel: Vec::new(),
                is_final: false,
            });
        }

        let closes_on_system = steps
            .last()
            .map(|s| s.sources == [SourceId::SYSTEM])
            .unwrap_or(false);
        if closes_on_system || steps.len() == 1 {
            if let Some(last) = steps.last_mut() {
                last.is_final = true;
                last.solindices = all.clone();
            }
        } else {
            steps.push(StepDef {
                sources: vec![SourceId::SYSTEM],
                terms: BTreeSet::new(),
                solindices: all,
                scope: ScopeId::Root,
                needsel: Vec::new(),
                is_final: true,
            });
        }

        let needsel: Vec<Vec<String>> = (0..steps.len())
            .map(|k| self.needed_outputs(&steps, k))
            .collect();
        for (step, needed) in steps.iter_mut().zip(needsel) {
            if !step.is_final {
                step.needsel = needed;
            }
        }
        steps
    }

    /// Variables computed by the terms of a step
    pub fn owned_vars(&self, terms: &BTreeSet<Term>) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        for term in terms {
            if let Term::Var(name) = term {
                vars.insert(name.clone());
            }
        }
        for (id, owner) in &self.owners {
            if !terms.contains(owner) {
                continue;
            }
            if let Some(rel) = self.select.relation(*id) {
                vars.extend(rel.variables());
            }
        }
        vars
    }

    fn needed_outputs(&self, steps: &[StepDef], k: usize) -> Vec<String> {
        let owned = self.owned_vars(&steps[k].terms);
        let mut wanted: BTreeSet<String> = BTreeSet::new();
        for term in &self.select.selection {
            term.variables(&mut wanted);
        }
        wanted.extend(self.select.groupby.iter().cloned());
        for sort in &self.select.orderby {
            sort.term.variables(&mut wanted);
        }
        for (other, step) in steps.iter().enumerate() {
            if other == k {
                continue;
            }
            for (id, owner) in &self.owners {
                if step.terms.contains(owner) {
                    if let Some(rel) = self.select.relation(*id) {
                        wanted.extend(rel.variables());
                    }
                }
            }
        }
        let owned: BTreeSet<String> = owned
            .into_iter()
            .filter(|v| self.scopes.var_scope(v) == ScopeId::Root)
            .collect();
        let mut needed: Vec<String> = owned.intersection(&wanted).cloned().collect();
        if needed.is_empty() {
            needed = owned
                .into_iter()
                .filter(|v| self.entity_vars.contains(v))
                .collect();
        }
        needed
    }
}

fn is_join_relation(is_final: bool, rtype: &str) -> bool {
    !is_final && !matches!(rtype, "is" | "eid" | "identity")
}
