//! Scope and parent lookup maps
//!
//! Built once per branch after the tree is complete. NOT and EXISTS open a
//! nested scope; a variable belongs to the outermost scope referencing it.

use std::collections::{BTreeMap, BTreeSet};

use super::nodes::{Node, NodeId, Select};

/// Lexical scope of a node or variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeId {
    Root,
    /// Scope opened by the NOT / EXISTS node
    Nested(NodeId),
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeId::Root => write!(f, "root"),
            ScopeId::Nested(id) => write!(f, "scope{}", id.0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScopeMap {
    parents: BTreeMap<NodeId, NodeId>,
    node_scope: BTreeMap<NodeId, ScopeId>,
    scope_parent: BTreeMap<ScopeId, ScopeId>,
    scope_depth: BTreeMap<ScopeId, usize>,
    var_scope: BTreeMap<String, ScopeId>,
    references: BTreeMap<String, Vec<NodeId>>,
}

impl ScopeMap {
    pub fn build(select: &Select) -> Self {
        let mut map = ScopeMap::default();
        map.scope_depth.insert(ScopeId::Root, 0);
        if let Some(root) = select.restriction {
            map.walk(select, root, ScopeId::Root, 0);
        }

        for (var, refs) in &map.references {
            let scope = refs
                .iter()
                .map(|r| map.scope_of(*r))
                .min_by_key(|s| (map.depth(*s), *s))
                .unwrap_or(ScopeId::Root);
            map.var_scope.insert(var.clone(), scope);
        }
        for var in select.selected_variables() {
            map.var_scope.insert(var, ScopeId::Root);
        }
        for var in &select.groupby {
            map.var_scope.insert(var.clone(), ScopeId::Root);
        }
        for term in &select.orderby {
            let mut vars = BTreeSet::new();
            term.term.variables(&mut vars);
            for var in vars {
                map.var_scope.insert(var, ScopeId::Root);
            }
        }
        map
    }

    fn walk(&mut self, select: &Select, id: NodeId, scope: ScopeId, depth: usize) {
        self.node_scope.insert(id, scope);
        match select.node(id) {
            Node::And(children) | Node::Or(children) => {
                for child in children {
                    self.parents.insert(*child, id);
                    self.walk(select, *child, scope, depth);
                }
            }
            Node::Not(child) | Node::Exists(child) => {
                let nested = ScopeId::Nested(id);
                self.scope_parent.insert(nested, scope);
                self.scope_depth.insert(nested, depth + 1);
                self.parents.insert(*child, id);
                self.walk(select, *child, nested, depth + 1);
            }
            Node::Relation(rel) => {
                for var in rel.variables() {
                    self.references.entry(var).or_default().push(id);
                }
            }
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(&id).copied()
    }

    pub fn scope_of(&self, id: NodeId) -> ScopeId {
        self.node_scope.get(&id).copied().unwrap_or(ScopeId::Root)
    }

    pub fn depth(&self, scope: ScopeId) -> usize {
        self.scope_depth.get(&scope).copied().unwrap_or(0)
    }

    pub fn var_scope(&self, var: &str) -> ScopeId {
        self.var_scope.get(var).copied().unwrap_or(ScopeId::Root)
    }

    /// Relation nodes referencing `var`, in arena order
    pub fn references(&self, var: &str) -> &[NodeId] {
        self.references.get(var).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn variables(&self) -> impl Iterator<Item = &String> {
        self.var_scope.keys()
    }

    /// True if `inner` is `outer` or nested below it
    pub fn is_within(&self, inner: ScopeId, outer: ScopeId) -> bool {
        let mut current = inner;
        loop {
            if current == outer {
                return true;
            }
            match self.scope_parent.get(&current) {
                Some(parent) => current = *parent,
                None => return false,
            }
        }
    }

    /// True if some NOT node encloses `id`
    pub fn is_negated(&self, select: &Select, id: NodeId) -> bool {
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            if matches!(select.node(parent), Node::Not(_)) {
                return true;
            }
            current = parent;
        }
        false
    }

    /// Outermost OR / NOT / EXISTS ancestor of `id`, if any
    ///
    /// Relations below such a node are kept or dropped together.
    pub fn atomic_root(&self, select: &Select, id: NodeId) -> Option<NodeId> {
        let mut found = None;
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            if matches!(
                select.node(parent),
                Node::Or(_) | Node::Not(_) | Node::Exists(_)
            ) {
                found = Some(parent);
            }
            current = parent;
        }
        found
    }
}
