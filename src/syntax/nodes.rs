//! Statement tree node types
//!
//! A branch owns its restriction nodes in an arena (`Select::nodes`); nodes
//! only hold child indices, never back-pointers. Parent and scope lookups are
//! built on demand by `ScopeMap`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Index of a node inside a branch arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// One type assignment for the variables of a branch
pub type Solution = BTreeMap<String, String>;

/// Literal values appearing in a statement
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Constant {
    Int(i64),
    String(String),
    Boolean(bool),
    Null,
    /// Query argument reference, rendered `%(name)s`
    Substitute(String),
    /// Entity type name (right-hand side of `is`)
    Etype(String),
}

impl Constant {
    /// Resolves substitutions against query arguments
    pub fn resolve(&self, args: &BTreeMap<String, serde_json::Value>) -> serde_json::Value {
        match self {
            Constant::Int(i) => serde_json::Value::from(*i),
            Constant::String(s) | Constant::Etype(s) => serde_json::Value::from(s.clone()),
            Constant::Boolean(b) => serde_json::Value::from(*b),
            Constant::Null => serde_json::Value::Null,
            Constant::Substitute(key) => args.get(key).cloned().unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Right-hand side of a relation, or a selection term
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Var(String),
    Const(Constant),
    Func(String, Vec<Operand>),
}

impl Operand {
    pub fn var(name: impl Into<String>) -> Self {
        Operand::Var(name.into())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Operand::Const(Constant::String(value.into()))
    }

    pub fn int(value: i64) -> Self {
        Operand::Const(Constant::Int(value))
    }

    pub fn etype(name: impl Into<String>) -> Self {
        Operand::Const(Constant::Etype(name.into()))
    }

    pub fn substitute(key: impl Into<String>) -> Self {
        Operand::Const(Constant::Substitute(key.into()))
    }

    pub fn func(name: impl Into<String>, args: Vec<Operand>) -> Self {
        Operand::Func(name.into(), args)
    }

    /// Name of the variable if this operand is a plain variable
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Operand::Var(name) => Some(name),
            _ => None,
        }
    }

    /// Every variable referenced by this operand
    pub fn variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Operand::Var(name) => {
                out.insert(name.clone());
            }
            Operand::Const(_) => {}
            Operand::Func(_, args) => {
                for arg in args {
                    arg.variables(out);
                }
            }
        }
    }

    /// True for COUNT/MIN/MAX/SUM/AVG
    pub fn is_aggregate(&self) -> bool {
        match self {
            Operand::Func(name, _) => is_aggregate_function(name),
            _ => false,
        }
    }

    /// Renames variables in place
    pub fn rename(&mut self, from: &str, to: &str) {
        match self {
            Operand::Var(name) if name == from => *name = to.to_string(),
            Operand::Func(_, args) => {
                for arg in args {
                    arg.rename(from, to);
                }
            }
            _ => {}
        }
    }
}

pub fn is_aggregate_function(name: &str) -> bool {
    matches!(
        name.to_ascii_uppercase().as_str(),
        "COUNT" | "MIN" | "MAX" | "SUM" | "AVG"
    )
}

/// Comparison operator of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    ILike,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Like => "LIKE",
            CmpOp::ILike => "ILIKE",
        }
    }
}

/// Outer-join marker on a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optional {
    #[default]
    No,
    /// Left side optional (`X? rel Y`)
    Left,
    /// Right side optional (`X rel Y?`)
    Right,
}

/// `lhs rtype [op] rhs`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub rtype: String,
    pub lhs: String,
    #[serde(default = "default_op")]
    pub op: CmpOp,
    pub rhs: Operand,
    #[serde(default)]
    pub optional: Optional,
}

fn default_op() -> CmpOp {
    CmpOp::Eq
}

impl Relation {
    pub fn new(lhs: impl Into<String>, rtype: impl Into<String>, rhs: Operand) -> Self {
        Self {
            rtype: rtype.into(),
            lhs: lhs.into(),
            op: CmpOp::Eq,
            rhs,
            optional: Optional::No,
        }
    }

    pub fn with_op(mut self, op: CmpOp) -> Self {
        self.op = op;
        self
    }

    pub fn with_optional(mut self, optional: Optional) -> Self {
        self.optional = optional;
        self
    }

    /// Right-hand variable, when the rhs is a bare variable
    pub fn rhs_var(&self) -> Option<&str> {
        self.rhs.as_var()
    }

    /// Both variables, lhs first
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        out.insert(self.lhs.clone());
        self.rhs.variables(&mut out);
        out
    }

    /// True if `var` is on the optional side of an outer join
    pub fn is_optional_for(&self, var: &str) -> bool {
        match self.optional {
            Optional::No => false,
            Optional::Left => self.lhs == var,
            Optional::Right => self.rhs_var() == Some(var),
        }
    }

    /// `X eid <int>` returns the fixed eid
    pub fn fixed_eid(&self) -> Option<i64> {
        if self.rtype == "eid" && self.op == CmpOp::Eq {
            if let Operand::Const(Constant::Int(eid)) = self.rhs {
                return Some(eid);
            }
        }
        None
    }
}

/// Restriction tree node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    And(Vec<NodeId>),
    Or(Vec<NodeId>),
    Not(NodeId),
    Exists(NodeId),
    Relation(Relation),
}

/// ORDER BY entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortTerm {
    pub term: Operand,
    #[serde(default = "default_asc")]
    pub asc: bool,
}

fn default_asc() -> bool {
    true
}

impl SortTerm {
    pub fn asc(term: Operand) -> Self {
        Self { term, asc: true }
    }

    pub fn desc(term: Operand) -> Self {
        Self { term, asc: false }
    }
}

/// One SELECT branch
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Select {
    #[serde(default)]
    pub distinct: bool,
    pub selection: Vec<Operand>,
    #[serde(default)]
    pub groupby: Vec<String>,
    #[serde(default)]
    pub orderby: Vec<SortTerm>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub restriction: Option<NodeId>,
    #[serde(default)]
    pub solutions: Vec<Solution>,
}

impl Select {
    /// `Any <vars>` with no restriction yet
    pub fn any(vars: &[&str]) -> Self {
        Self {
            selection: vars.iter().map(|v| Operand::var(*v)).collect(),
            ..Self::default()
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// The relation at `id`, if that node is a relation
    pub fn relation(&self, id: NodeId) -> Option<&Relation> {
        match self.nodes.get(id.index()) {
            Some(Node::Relation(rel)) => Some(rel),
            _ => None,
        }
    }

    /// Pushes a node into the arena
    pub fn add(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId((self.nodes.len() - 1) as u32)
    }

    pub fn rel(&mut self, relation: Relation) -> NodeId {
        self.add(Node::Relation(relation))
    }

    pub fn and(&mut self, children: Vec<NodeId>) -> NodeId {
        self.add(Node::And(children))
    }

    pub fn or(&mut self, children: Vec<NodeId>) -> NodeId {
        self.add(Node::Or(children))
    }

    pub fn not(&mut self, child: NodeId) -> NodeId {
        self.add(Node::Not(child))
    }

    pub fn exists(&mut self, child: NodeId) -> NodeId {
        self.add(Node::Exists(child))
    }

    /// Sets the root of the restriction tree
    pub fn set_restriction(&mut self, root: NodeId) {
        self.restriction = Some(root);
    }

    /// Restricts with the conjunction of `relations`
    pub fn with_relations(mut self, relations: Vec<Relation>) -> Self {
        let ids: Vec<NodeId> = relations.into_iter().map(|r| self.rel(r)).collect();
        let root = self.and(ids);
        self.set_restriction(root);
        self
    }

    pub fn with_solutions(mut self, solutions: Vec<Solution>) -> Self {
        self.solutions = solutions;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_orderby(mut self, term: SortTerm) -> Self {
        self.orderby.push(term);
        self
    }

    pub fn with_groupby(mut self, var: impl Into<String>) -> Self {
        self.groupby.push(var.into());
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Appends a conjunct to the existing restriction
    pub fn push_restriction(&mut self, id: NodeId) {
        match self.restriction {
            None => self.restriction = Some(id),
            Some(root) => {
                if let Node::And(children) = &mut self.nodes[root.index()] {
                    children.push(id);
                } else {
                    let and = self.and(vec![root, id]);
                    self.restriction = Some(and);
                }
            }
        }
    }

    /// Relation nodes in arena order
    pub fn relations(&self) -> impl Iterator<Item = (NodeId, &Relation)> {
        self.nodes.iter().enumerate().filter_map(|(i, n)| match n {
            Node::Relation(r) => Some((NodeId(i as u32), r)),
            _ => None,
        })
    }

    /// Relation nodes reachable from the restriction root
    pub fn reachable_relations(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        if let Some(root) = self.restriction {
            self.collect_relations(root, &mut out);
        }
        out
    }

    pub fn collect_relations(&self, id: NodeId, out: &mut Vec<NodeId>) {
        match self.node(id) {
            Node::And(children) | Node::Or(children) => {
                for child in children {
                    self.collect_relations(*child, out);
                }
            }
            Node::Not(child) | Node::Exists(child) => self.collect_relations(*child, out),
            Node::Relation(_) => out.push(id),
        }
    }

    /// Every variable appearing in selection, sort keys and restriction
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for term in &self.selection {
            term.variables(&mut out);
        }
        for var in &self.groupby {
            out.insert(var.clone());
        }
        for term in &self.orderby {
            term.term.variables(&mut out);
        }
        for id in self.reachable_relations() {
            if let Node::Relation(rel) = self.node(id) {
                out.extend(rel.variables());
            }
        }
        out
    }

    /// Variables used by the selection list
    pub fn selected_variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for term in &self.selection {
            term.variables(&mut out);
        }
        out
    }

    pub fn has_aggregate(&self) -> bool {
        self.selection.iter().any(Operand::is_aggregate)
    }

    /// GROUP BY or aggregate functions present
    pub fn is_aggregated(&self) -> bool {
        !self.groupby.is_empty() || self.has_aggregate()
    }

    /// Distinct types a variable takes across solutions
    pub fn var_types(&self, var: &str) -> BTreeSet<String> {
        self.solutions
            .iter()
            .filter_map(|sol| sol.get(var).cloned())
            .collect()
    }
}

/// UNION of branches
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Union {
    pub children: Vec<Select>,
}

impl Union {
    pub fn new(children: Vec<Select>) -> Self {
        Self { children }
    }

    pub fn single(select: Select) -> Self {
        Self {
            children: vec![select],
        }
    }
}

/// `lhs rtype rhs` assignment of a mutation statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainRelation {
    pub lhs: String,
    pub rtype: String,
    pub rhs: Operand,
}

impl MainRelation {
    pub fn new(lhs: impl Into<String>, rtype: impl Into<String>, rhs: Operand) -> Self {
        Self {
            lhs: lhs.into(),
            rtype: rtype.into(),
            rhs,
        }
    }
}

/// Entity designated by a mutation statement (`INSERT User X`, `DELETE User X`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainEntity {
    pub etype: String,
    pub var: String,
}

impl MainEntity {
    pub fn new(etype: impl Into<String>, var: impl Into<String>) -> Self {
        Self {
            etype: etype.into(),
            var: var.into(),
        }
    }
}

/// `INSERT <entities>: <relations> [WHERE <select>]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insert {
    pub entities: Vec<MainEntity>,
    #[serde(default)]
    pub relations: Vec<MainRelation>,
    #[serde(default)]
    pub select: Option<Select>,
}

/// `SET <relations> WHERE <select>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub relations: Vec<MainRelation>,
    pub select: Select,
}

/// `DELETE <entities>, <relations> WHERE <select>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delete {
    #[serde(default)]
    pub entities: Vec<MainEntity>,
    #[serde(default)]
    pub relations: Vec<MainRelation>,
    pub select: Select,
}

/// Top-level statement handed to the planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "statement", rename_all = "snake_case")]
pub enum Statement {
    Select(Union),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Statement {
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Select(_) => "SELECT",
            Statement::Insert(_) => "INSERT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
        }
    }
}

/// Builds a solution from `(var, type)` pairs
pub fn solution(pairs: &[(&str, &str)]) -> Solution {
    pairs
        .iter()
        .map(|(v, t)| (v.to_string(), t.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_building() {
        let select = Select::any(&["X"]).with_relations(vec![
            Relation::new("X", "is", Operand::etype("User")),
            Relation::new("X", "in_group", Operand::var("G")),
        ]);
        assert_eq!(select.nodes.len(), 3);
        assert_eq!(select.restriction, Some(NodeId(2)));
        assert_eq!(select.reachable_relations(), vec![NodeId(0), NodeId(1)]);
    }

    #[test]
    fn test_variables_collected() {
        let select = Select::any(&["X"]).with_relations(vec![
            Relation::new("X", "in_group", Operand::var("G")),
            Relation::new("G", "name", Operand::string("users")),
        ]);
        let vars: Vec<_> = select.variables().into_iter().collect();
        assert_eq!(vars, vec!["G".to_string(), "X".to_string()]);
    }

    #[test]
    fn test_push_restriction_wraps_non_and_root() {
        let mut select = Select::any(&["X"]);
        let a = select.rel(Relation::new("X", "is", Operand::etype("User")));
        select.set_restriction(a);
        let b = select.rel(Relation::new("X", "eid", Operand::int(42)));
        select.push_restriction(b);
        assert!(matches!(select.node(select.restriction.unwrap()), Node::And(c) if c.len() == 2));
    }

    #[test]
    fn test_fixed_eid() {
        assert_eq!(Relation::new("X", "eid", Operand::int(42)).fixed_eid(), Some(42));
        assert_eq!(
            Relation::new("X", "eid", Operand::int(42)).with_op(CmpOp::Gt).fixed_eid(),
            None
        );
    }

    #[test]
    fn test_aggregate_detection() {
        let mut select = Select::any(&[]);
        select.selection.push(Operand::func("COUNT", vec![Operand::var("X")]));
        assert!(select.has_aggregate());
        assert!(select.is_aggregated());
    }
}
