//! Variable annotation
//!
//! Decides, per variable of every branch, whether it is invariant (its type
//! is fully determined without joining its entity table) and which relation
//! is its principal. Annotations live in a side table; the statement itself
//! is never modified.

use std::collections::BTreeMap;

use crate::schema::Schema;
use crate::syntax::{Node, NodeId, ScopeId, ScopeMap, Select, Union};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarInfo {
    pub invariant: bool,
    pub principal: Option<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchAnnotations {
    pub vars: BTreeMap<String, VarInfo>,
    pub need_distinct: bool,
    /// Negation over a type-ambiguous variable: steps answering the branch
    /// are intersected instead of unioned
    pub need_intersect: bool,
    /// Type-ambiguous variables local to a negation, with their NOT node
    pub intersect_on: BTreeMap<String, NodeId>,
}

impl BranchAnnotations {
    pub fn is_invariant(&self, var: &str) -> bool {
        self.vars.get(var).map(|v| v.invariant).unwrap_or(false)
    }

    pub fn principal(&self, var: &str) -> Option<NodeId> {
        self.vars.get(var).and_then(|v| v.principal)
    }

    /// Invariant variable names, sorted
    pub fn invariants(&self) -> Vec<String> {
        self.vars
            .iter()
            .filter(|(_, v)| v.invariant)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations {
    pub branches: Vec<BranchAnnotations>,
    pub has_text_query: bool,
}

impl Annotations {
    pub fn branch(&self, index: usize) -> &BranchAnnotations {
        &self.branches[index]
    }

    /// `union` with DISTINCT set on the branches needing deduplication
    pub fn deduplicated(&self, union: &Union) -> Union {
        let children = union
            .children
            .iter()
            .zip(&self.branches)
            .map(|(select, branch)| {
                let mut select = select.clone();
                select.distinct |= branch.need_distinct;
                select
            })
            .collect();
        Union::new(children)
    }
}

pub struct Annotator<'a> {
    schema: &'a Schema,
}

impl<'a> Annotator<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    pub fn annotate(&self, branches: &[Select]) -> Annotations {
        let mut annotations = Annotations::default();
        for select in branches {
            let scopes = ScopeMap::build(select);
            annotations.has_text_query |= select
                .reachable_relations()
                .into_iter()
                .filter_map(|id| select.relation(id))
                .any(|rel| rel.rtype == "has_text");
            annotations
                .branches
                .push(self.annotate_branch(select, &scopes));
        }
        annotations
    }

    fn annotate_branch(&self, select: &Select, scopes: &ScopeMap) -> BranchAnnotations {
        let mut branch = BranchAnnotations::default();
        for var in scopes.variables() {
            let info = self.annotate_var(select, scopes, var);
            branch.vars.insert(var.clone(), info);
        }

        for id in select.reachable_relations() {
            if !scopes.is_negated(select, id) {
                continue;
            }
            let Some(rel) = select.relation(id) else { continue };
            for v in rel.variables() {
                if select.var_types(&v).len() < 2 || branch.is_invariant(&v) {
                    continue;
                }
                if let ScopeId::Nested(scope) = scopes.var_scope(&v) {
                    if matches!(select.node(scope), Node::Not(_)) {
                        branch.intersect_on.insert(v, scope);
                    }
                }
            }
        }
        branch.need_intersect = !branch.intersect_on.is_empty();

        // an OR child binding extra variables duplicates rows
        branch.need_distinct = select.distinct
            || branch.vars.values().any(|info| {
                info.principal
                    .map(|p| under_or(select, scopes, p))
                    .unwrap_or(false)
            });
        branch
    }

    fn annotate_var(&self, select: &Select, scopes: &ScopeMap, var: &str) -> VarInfo {
        let refs = scopes.references(var);
        let not_invariant = VarInfo::default();

        for id in refs {
            let Some(rel) = select.relation(*id) else { continue };
            let lhs = rel.lhs == var;
            if lhs && (self.schema.is_final(&rel.rtype) || self.schema.is_inlined(&rel.rtype)) {
                return not_invariant;
            }
            if rel.is_optional_for(var) {
                return not_invariant;
            }
            if rel.rhs_var() == Some(var)
                && refs.len() > 1
                && self.schema.is_inlined(&rel.rtype)
                && scopes.is_negated(select, *id)
            {
                return not_invariant;
            }
        }

        let var_scope = scopes.var_scope(var);
        let mut best: Option<(u8, NodeId)> = None;
        for id in refs {
            let Some(rel) = select.relation(*id) else { continue };
            if rel.rtype == "is" {
                continue;
            }
            let same_scope = scopes.scope_of(*id) == var_scope;
            let tier = match (same_scope, rel.rtype.as_str()) {
                (true, "eid" | "identity") => 1,
                (true, _) => 0,
                (false, _) if select.distinct => 2,
                (false, _) => continue,
            };
            if best.map(|b| (tier, *id) < b).unwrap_or(true) {
                best = Some((tier, *id));
            }
        }

        match best {
            Some((_, principal)) => VarInfo {
                invariant: true,
                principal: Some(principal),
            },
            None => {
                let foreign_only = refs.iter().any(|id| {
                    select.relation(*id).map_or(false, |rel| rel.rtype != "is")
                        && scopes.scope_of(*id) != var_scope
                });
                if foreign_only || select.var_types(var).len() > 1 {
                    not_invariant
                } else {
                    VarInfo {
                        invariant: true,
                        principal: None,
                    }
                }
            }
        }
    }
}

fn under_or(select: &Select, scopes: &ScopeMap, id: NodeId) -> bool {
    let mut current = id;
    while let Some(parent) = scopes.parent(current) {
        if matches!(select.node(parent), Node::Or(_)) {
            return true;
        }
        current = parent;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RelationDef;
    use crate::syntax::{solution, Operand, Optional, Relation};

    fn schema() -> Schema {
        Schema::new()
            .with_relation("login", RelationDef::attribute())
            .with_relation("name", RelationDef::attribute())
            .with_relation("in_group", RelationDef::relation())
            .with_relation("owned_by", RelationDef::inlined())
    }

    fn annotate(select: Select) -> Annotations {
        let schema = schema();
        Annotator::new(&schema).annotate(&[select])
    }

    #[test]
    fn test_attribute_subject_not_invariant() {
        let select = Select::any(&["X"])
            .with_relations(vec![
                Relation::new("X", "in_group", Operand::var("G")),
                Relation::new("G", "name", Operand::string("users")),
            ])
            .with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])]);
        let ann = annotate(select);
        let branch = ann.branch(0);
        assert!(branch.is_invariant("X"));
        assert_eq!(branch.principal("X"), Some(NodeId(0)));
        assert!(!branch.is_invariant("G"));
    }

    #[test]
    fn test_type_restriction_only_is_invariant() {
        let select = Select::any(&["X"])
            .with_relations(vec![Relation::new("X", "is", Operand::etype("User"))])
            .with_solutions(vec![solution(&[("X", "User")])]);
        let ann = annotate(select);
        assert_eq!(
            ann.branch(0).vars["X"],
            VarInfo {
                invariant: true,
                principal: None
            }
        );
    }

    #[test]
    fn test_optional_disqualifies() {
        let select = Select::any(&["X", "G"])
            .with_relations(vec![
                Relation::new("X", "in_group", Operand::var("G")).with_optional(Optional::Right),
            ])
            .with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])]);
        let ann = annotate(select);
        assert!(!ann.branch(0).is_invariant("G"));
        assert!(ann.branch(0).is_invariant("X"));
    }

    #[test]
    fn test_ambiguous_without_principal() {
        let select = Select::any(&["X"]).with_solutions(vec![
            solution(&[("X", "User")]),
            solution(&[("X", "Group")]),
        ]);
        let ann = annotate(select);
        assert!(!ann.branch(0).is_invariant("X"));
    }

    #[test]
    fn test_cross_scope_principal_requires_distinct() {
        let build = |distinct: bool| {
            let mut select = Select::any(&["X"]);
            let is = select.rel(Relation::new("X", "is", Operand::etype("User")));
            let inner = select.rel(Relation::new("X", "in_group", Operand::var("G")));
            let exists = select.exists(inner);
            let root = select.and(vec![is, exists]);
            select.set_restriction(root);
            select.distinct = distinct;
            select.with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])])
        };
        assert!(!annotate(build(false)).branch(0).is_invariant("X"));
        let ann = annotate(build(true));
        assert_eq!(ann.branch(0).principal("X"), Some(NodeId(1)));
        assert!(ann.branch(0).need_distinct);
    }

    #[test]
    fn test_need_intersect_and_has_text() {
        let mut select = Select::any(&["Y"]);
        let text = select.rel(Relation::new("Y", "has_text", Operand::string("bob")));
        let owned = select.rel(Relation::new("X", "owned_by", Operand::var("Y")));
        let not = select.not(owned);
        let root = select.and(vec![text, not]);
        select.set_restriction(root);
        let select = select.with_solutions(vec![
            solution(&[("Y", "User"), ("X", "Card")]),
            solution(&[("Y", "User"), ("X", "Note")]),
        ]);
        let ann = annotate(select);
        assert!(ann.has_text_query);
        assert!(ann.branch(0).need_intersect);
        assert_eq!(ann.branch(0).intersect_on.get("X"), Some(&not));
    }

    #[test]
    fn test_selected_ambiguous_negation_not_intersected() {
        let mut select = Select::any(&["X"]);
        let login = select.rel(Relation::new("X", "login", Operand::var("L")));
        let bob = select.rel(Relation::new("X", "login", Operand::string("bob")));
        let not = select.not(bob);
        let root = select.and(vec![login, not]);
        select.set_restriction(root);
        let select = select.with_solutions(vec![
            solution(&[("X", "User")]),
            solution(&[("X", "Group")]),
        ]);
        let ann = annotate(select);
        assert!(!ann.branch(0).is_invariant("X"));
        assert!(!ann.branch(0).need_intersect);
    }

    #[test]
    fn test_negated_inlined_object_revokes_invariance() {
        let build = |negated: bool| {
            let mut select = Select::any(&["X"]);
            let member = select.rel(Relation::new("X", "in_group", Operand::var("G")));
            let mut owned = select.rel(Relation::new("Y", "owned_by", Operand::var("X")));
            if negated {
                owned = select.not(owned);
            }
            let root = select.and(vec![member, owned]);
            select.set_restriction(root);
            select.with_solutions(vec![solution(&[("X", "User"), ("G", "Group"), ("Y", "Card")])])
        };
        let plain = annotate(build(false));
        assert!(plain.branch(0).is_invariant("X"));
        assert_eq!(plain.branch(0).principal("X"), Some(NodeId(0)));
        let negated = annotate(build(true));
        assert!(!negated.branch(0).is_invariant("X"));
    }

    #[test]
    fn test_unselected_principal_inside_or_needs_distinct() {
        let mut select = Select::any(&["X"]);
        let is = select.rel(Relation::new("X", "is", Operand::etype("User")));
        let a = select.rel(Relation::new("X", "login", Operand::string("bob")));
        let b = select.rel(Relation::new("X", "in_group", Operand::var("G")));
        let or = select.or(vec![a, b]);
        let root = select.and(vec![is, or]);
        select.set_restriction(root);
        let select = select.with_solutions(vec![solution(&[("X", "User"), ("G", "Group")])]);
        let ann = annotate(select);
        assert!(!ann.branch(0).is_invariant("X"));
        assert_eq!(ann.branch(0).principal("G"), Some(b));
        assert!(ann.branch(0).need_distinct);
    }

    #[test]
    fn test_principal_inside_or_needs_distinct() {
        let mut select = Select::any(&["X"]);
        let a = select.rel(Relation::new("X", "in_group", Operand::var("G")));
        let b = select.rel(Relation::new("Y", "owned_by", Operand::var("X")));
        let or = select.or(vec![a, b]);
        select.set_restriction(or);
        let select = select.with_solutions(vec![solution(&[("X", "User"), ("G", "Group"), ("Y", "Card")])]);
        let ann = annotate(select);
        assert!(ann.branch(0).need_distinct);
    }
}
