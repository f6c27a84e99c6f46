//! In-memory source
//!
//! Holds entities and relation tuples and evaluates sub-statements directly
//! against them. Entities owned by other sources may appear as relation
//! endpoints or as input values; they are never type checked here.
//!
//! Every search and mutation is recorded, so callers can observe exactly
//! which sub-statements reached the source.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executor::{ExecutorError, ResultShape, ValueFilter};
use crate::schema::{is_final_type, Schema};
use crate::syntax::{CmpOp, Constant, Node, NodeId, Operand, Optional, Relation, Select, Union};

use super::descriptor::SourceDescriptor;
use super::errors::{SourceError, SourceResult};
use super::repository::Session;
use super::tables::SearchInputs;
use super::{QueryArgs, Row, Source};

type Binding = BTreeMap<String, Value>;

/// Stored entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub etype: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct Store {
    entities: BTreeMap<i64, Entity>,
    relations: BTreeSet<(String, i64, i64)>,
}

pub struct MemorySource {
    descriptor: SourceDescriptor,
    schema: Schema,
    store: RefCell<Store>,
    calls: RefCell<Vec<String>>,
}

impl MemorySource {
    pub fn new(descriptor: SourceDescriptor, schema: Schema) -> Self {
        Self {
            descriptor,
            schema,
            store: RefCell::new(Store::default()),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Adds an entity with `(attribute, value)` pairs
    pub fn with_entity(self, eid: i64, etype: &str, attributes: &[(&str, Value)]) -> Self {
        self.insert_entity(
            eid,
            Entity {
                etype: etype.to_string(),
                attributes: attributes
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            },
        );
        self
    }

    pub fn with_relation(self, subject: i64, rtype: &str, object: i64) -> Self {
        self.insert_relation(subject, rtype, object);
        self
    }

    pub fn insert_entity(&self, eid: i64, entity: Entity) {
        self.store.borrow_mut().entities.insert(eid, entity);
    }

    pub fn insert_relation(&self, subject: i64, rtype: &str, object: i64) {
        self.store
            .borrow_mut()
            .relations
            .insert((rtype.to_string(), subject, object));
    }

    /// Eids of locally stored entities
    pub fn eids(&self) -> Vec<i64> {
        self.store.borrow().entities.keys().copied().collect()
    }

    pub fn entity(&self, eid: i64) -> Option<Entity> {
        self.store.borrow().entities.get(&eid).cloned()
    }

    pub fn has_relation(&self, subject: i64, rtype: &str, object: i64) -> bool {
        self.store
            .borrow()
            .relations
            .contains(&(rtype.to_string(), subject, object))
    }

    /// Searches and mutations received so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn record(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }

    fn search_branch(
        &self,
        select: &Select,
        args: &QueryArgs,
        inputs: Option<SearchInputs<'_>>,
    ) -> SourceResult<Vec<Row>> {
        let store = self.store.borrow();
        let eval = Evaluator {
            store: &store,
            schema: &self.schema,
            select,
            args,
        };

        let mut bindings = match inputs {
            Some(inputs) => self.input_bindings(inputs)?,
            None => vec![Binding::new()],
        };
        if let Some(root) = select.restriction {
            bindings = eval.node(root, bindings);
        }

        let shape = ResultShape::of(select);
        let bindings = eval.complete(bindings, &shape.variables());

        shape.apply(bindings, args).map_err(|err| match err {
            ExecutorError::Source(source) => source,
            other => SourceError::unsupported(self.uri(), other.to_string()),
        })
    }

    /// Cartesian product of the referenced temp tables, joined on repeated variables
    fn input_bindings(&self, inputs: SearchInputs<'_>) -> SourceResult<Vec<Binding>> {
        let tables: BTreeSet<&str> = inputs
            .map
            .values()
            .flatten()
            .map(|c| c.table.as_str())
            .collect();

        let mut combos: Vec<BTreeMap<&str, &Row>> = vec![BTreeMap::new()];
        for name in tables {
            let table = inputs
                .tables
                .get(name)
                .ok_or_else(|| SourceError::backend(self.uri(), format!("no temp table {}", name)))?;
            let mut next = Vec::new();
            for combo in &combos {
                for row in &table.rows {
                    let mut extended = combo.clone();
                    extended.insert(name, row);
                    next.push(extended);
                }
            }
            combos = next;
        }

        let null = Value::Null;
        let mut bindings = Vec::new();
        'combo: for combo in combos {
            let mut binding = Binding::new();
            for (var, columns) in inputs.map {
                let mut value: Option<&Value> = None;
                for column in columns {
                    let cell = combo
                        .get(column.table.as_str())
                        .and_then(|row| row.get(column.column))
                        .unwrap_or(&null);
                    match value {
                        None => value = Some(cell),
                        Some(v) if v != cell => continue 'combo,
                        Some(_) => {}
                    }
                }
                if let Some(v) = value {
                    binding.insert(var.clone(), v.clone());
                }
            }
            bindings.push(binding);
        }
        Ok(bindings)
    }
}

impl Source for MemorySource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn syntax_tree_search(
        &self,
        _session: &Session<'_>,
        union: &Union,
        args: &QueryArgs,
        _cache_key: Option<&str>,
        inputs: Option<SearchInputs<'_>>,
    ) -> SourceResult<Vec<Row>> {
        self.record(union.to_string());
        let mut rows = Vec::new();
        for select in &union.children {
            rows.extend(self.search_branch(select, args, inputs)?);
        }
        Ok(rows)
    }

    fn add_entity(
        &self,
        _session: &Session<'_>,
        eid: i64,
        etype: &str,
        attributes: &BTreeMap<String, Value>,
    ) -> SourceResult<()> {
        if !self.support_entity(etype, true) {
            return Err(SourceError::unsupported(self.uri(), format!("writing {}", etype)));
        }
        self.record(format!("add_entity {} {}", etype, eid));
        self.insert_entity(
            eid,
            Entity {
                etype: etype.to_string(),
                attributes: attributes.clone(),
            },
        );
        Ok(())
    }

    fn update_entity(
        &self,
        _session: &Session<'_>,
        eid: i64,
        attributes: &BTreeMap<String, Value>,
    ) -> SourceResult<()> {
        let mut store = self.store.borrow_mut();
        let entity = store
            .entities
            .get_mut(&eid)
            .ok_or_else(|| SourceError::unknown_entity(self.uri(), eid))?;
        for (key, value) in attributes {
            entity.attributes.insert(key.clone(), value.clone());
        }
        drop(store);
        let keys: Vec<&str> = attributes.keys().map(String::as_str).collect();
        self.record(format!("update_entity {} {}", eid, keys.join(",")));
        Ok(())
    }

    fn delete_entity(&self, _session: &Session<'_>, eid: i64) -> SourceResult<()> {
        let mut store = self.store.borrow_mut();
        if store.entities.remove(&eid).is_none() {
            return Err(SourceError::unknown_entity(self.uri(), eid));
        }
        store.relations.retain(|(_, s, o)| *s != eid && *o != eid);
        drop(store);
        self.record(format!("delete_entity {}", eid));
        Ok(())
    }

    fn add_relation(
        &self,
        _session: &Session<'_>,
        subject: i64,
        rtype: &str,
        object: i64,
    ) -> SourceResult<()> {
        if !self.support_relation(rtype, true) {
            return Err(SourceError::unsupported(self.uri(), format!("writing {}", rtype)));
        }
        self.record(format!("add_relation {} {} {}", subject, rtype, object));
        self.insert_relation(subject, rtype, object);
        Ok(())
    }

    fn delete_relation(
        &self,
        _session: &Session<'_>,
        subject: i64,
        rtype: &str,
        object: i64,
    ) -> SourceResult<()> {
        self.record(format!("delete_relation {} {} {}", subject, rtype, object));
        self.store
            .borrow_mut()
            .relations
            .remove(&(rtype.to_string(), subject, object));
        Ok(())
    }
}

impl std::fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.store.borrow();
        f.debug_struct("MemorySource")
            .field("uri", &self.descriptor.uri)
            .field("entities", &store.entities.len())
            .field("relations", &store.relations.len())
            .finish()
    }
}

/// Restriction evaluation over one store
struct Evaluator<'a> {
    store: &'a Store,
    schema: &'a Schema,
    select: &'a Select,
    args: &'a QueryArgs,
}

impl<'a> Evaluator<'a> {
    fn node(&self, id: NodeId, bindings: Vec<Binding>) -> Vec<Binding> {
        match self.select.node(id) {
            Node::Relation(rel) => bindings
                .into_iter()
                .flat_map(|b| self.relation(rel, b))
                .collect(),
            Node::And(children) => {
                let mut ordered = children.clone();
                ordered.sort_by_key(|c| self.evaluation_rank(*c));
                ordered
                    .into_iter()
                    .fold(bindings, |acc, child| self.node(child, acc))
            }
            Node::Or(children) => {
                let mut out: Vec<Binding> = Vec::new();
                for child in children {
                    for binding in self.node(*child, bindings.clone()) {
                        if !out.contains(&binding) {
                            out.push(binding);
                        }
                    }
                }
                out
            }
            Node::Not(child) => bindings
                .into_iter()
                .filter(|b| self.node(*child, vec![b.clone()]).is_empty())
                .collect(),
            Node::Exists(child) => bindings
                .into_iter()
                .filter(|b| !self.node(*child, vec![b.clone()]).is_empty())
                .collect(),
        }
    }

    /// Binding relations first, outer joins next, filters last
    fn evaluation_rank(&self, id: NodeId) -> u8 {
        match self.select.node(id) {
            Node::Relation(rel) if rel.optional != Optional::No => 1,
            Node::Not(_) | Node::Exists(_) => 2,
            _ => 0,
        }
    }

    fn relation(&self, rel: &Relation, binding: Binding) -> Vec<Binding> {
        if binding.get(&rel.lhs).map(Value::is_null).unwrap_or(false)
            && rel.optional == Optional::No
        {
            return Vec::new();
        }
        match rel.rtype.as_str() {
            "is" => self.is_relation(rel, binding),
            "eid" | "identity" => self.identity_relation(rel, binding),
            "has_text" => self.has_text(rel, binding),
            rtype if self.schema.is_final(rtype) => self.attribute(rel, binding),
            _ => self.tuples(rel, binding),
        }
    }

    fn rhs_value(&self, rhs: &Operand, binding: &Binding) -> Option<Value> {
        match rhs {
            Operand::Var(name) => binding.get(name).cloned(),
            Operand::Const(constant) => Some(constant.resolve(self.args)),
            Operand::Func(name, args) => {
                let value = self.rhs_value(args.first()?, binding)?;
                match (name.to_ascii_uppercase().as_str(), value) {
                    ("UPPER", Value::String(s)) => Some(Value::String(s.to_uppercase())),
                    ("LOWER", Value::String(s)) => Some(Value::String(s.to_lowercase())),
                    _ => None,
                }
            }
        }
    }

    /// Local entities `var` may denote under `binding`
    fn local_entities(&self, var: &str, binding: &Binding) -> Vec<(i64, &'a Entity)> {
        match binding.get(var) {
            Some(value) => value
                .as_i64()
                .and_then(|eid| self.store.entities.get(&eid).map(|e| (eid, e)))
                .into_iter()
                .collect(),
            None => self.store.entities.iter().map(|(k, v)| (*k, v)).collect(),
        }
    }

    fn bind(binding: &Binding, var: &str, value: Value) -> Binding {
        let mut out = binding.clone();
        out.insert(var.to_string(), value);
        out
    }

    fn is_relation(&self, rel: &Relation, binding: Binding) -> Vec<Binding> {
        let expected = match &rel.rhs {
            Operand::Const(Constant::Etype(name)) | Operand::Const(Constant::String(name)) => {
                Some(name.clone())
            }
            Operand::Var(v) => binding.get(v).and_then(|x| x.as_str().map(String::from)),
            _ => None,
        };
        let rhs_var = rel.rhs_var().filter(|v| !binding.contains_key(*v));

        if let Some(eid) = binding.get(&rel.lhs).and_then(Value::as_i64) {
            return match self.store.entities.get(&eid) {
                Some(entity) => {
                    if expected.as_deref().map(|t| t == entity.etype).unwrap_or(true) {
                        match rhs_var {
                            Some(v) => vec![Self::bind(&binding, v, Value::from(entity.etype.clone()))],
                            None => vec![binding],
                        }
                    } else {
                        Vec::new()
                    }
                }
                None => vec![binding],
            };
        }
        if binding.contains_key(&rel.lhs) {
            return Vec::new();
        }

        self.store
            .entities
            .iter()
            .filter(|(_, e)| expected.as_deref().map(|t| t == e.etype).unwrap_or(true))
            .map(|(eid, e)| {
                let mut out = Self::bind(&binding, &rel.lhs, Value::from(*eid));
                if let Some(v) = rhs_var {
                    out.insert(v.to_string(), Value::from(e.etype.clone()));
                }
                out
            })
            .collect()
    }

    fn identity_relation(&self, rel: &Relation, binding: Binding) -> Vec<Binding> {
        let lhs = binding.get(&rel.lhs).cloned();
        let rhs = self.rhs_value(&rel.rhs, &binding);
        match (lhs, rhs) {
            (Some(l), Some(r)) => {
                if ValueFilter::matches(rel.op, &l, &r) {
                    vec![binding]
                } else {
                    Vec::new()
                }
            }
            (Some(l), None) => match rel.rhs_var() {
                Some(v) => vec![Self::bind(&binding, v, l)],
                None => Vec::new(),
            },
            (None, Some(r)) if rel.op == CmpOp::Eq => {
                let local = r
                    .as_i64()
                    .map(|eid| self.store.entities.contains_key(&eid))
                    .unwrap_or(false);
                if local || rel.rtype == "identity" {
                    vec![Self::bind(&binding, &rel.lhs, r)]
                } else {
                    Vec::new()
                }
            }
            (None, rhs) => self
                .store
                .entities
                .keys()
                .filter(|eid| {
                    rhs.as_ref()
                        .map(|r| ValueFilter::matches(rel.op, &Value::from(**eid), r))
                        .unwrap_or(true)
                })
                .map(|eid| {
                    let mut out = Self::bind(&binding, &rel.lhs, Value::from(*eid));
                    if rhs.is_none() {
                        if let Some(v) = rel.rhs_var() {
                            out.insert(v.to_string(), Value::from(*eid));
                        }
                    }
                    out
                })
                .collect(),
        }
    }

    fn has_text(&self, rel: &Relation, binding: Binding) -> Vec<Binding> {
        let needle = match self.rhs_value(&rel.rhs, &binding) {
            Some(Value::String(s)) => s.to_lowercase(),
            _ => return Vec::new(),
        };
        self.local_entities(&rel.lhs, &binding)
            .into_iter()
            .filter(|(_, e)| {
                e.attributes.values().any(|v| {
                    v.as_str()
                        .map(|s| s.to_lowercase().contains(&needle))
                        .unwrap_or(false)
                })
            })
            .map(|(eid, _)| Self::bind(&binding, &rel.lhs, Value::from(eid)))
            .collect()
    }

    fn attribute(&self, rel: &Relation, binding: Binding) -> Vec<Binding> {
        let mut out = Vec::new();
        for (eid, entity) in self.local_entities(&rel.lhs, &binding) {
            let value = entity
                .attributes
                .get(&rel.rtype)
                .cloned()
                .unwrap_or(Value::Null);
            let base = Self::bind(&binding, &rel.lhs, Value::from(eid));
            match self.rhs_value(&rel.rhs, &base) {
                Some(expected) => {
                    if ValueFilter::matches(rel.op, &value, &expected) {
                        out.push(base);
                    }
                }
                None => {
                    let Some(var) = rel.rhs_var() else { continue };
                    if !value.is_null() || rel.optional == Optional::Right {
                        out.push(Self::bind(&base, var, value));
                    }
                }
            }
        }
        out
    }

    fn tuples(&self, rel: &Relation, binding: Binding) -> Vec<Binding> {
        let lhs = binding.get(&rel.lhs).and_then(Value::as_i64);
        let rhs_bound = self.rhs_value(&rel.rhs, &binding);
        let rhs = rhs_bound.as_ref().and_then(Value::as_i64);
        if (binding.contains_key(&rel.lhs) && lhs.is_none() && rel.optional == Optional::No)
            || (rhs_bound.is_some() && rhs.is_none() && rel.optional == Optional::No)
        {
            return Vec::new();
        }

        let symmetric = self.schema.is_symmetric(&rel.rtype);
        let mut pairs: Vec<(i64, i64)> = Vec::new();
        for (rtype, s, o) in &self.store.relations {
            if *rtype != rel.rtype {
                continue;
            }
            pairs.push((*s, *o));
            if symmetric {
                pairs.push((*o, *s));
            }
        }

        let mut out = Vec::new();
        for (s, o) in pairs {
            if lhs.map(|l| l != s).unwrap_or(false) || rhs.map(|r| r != o).unwrap_or(false) {
                continue;
            }
            if binding.contains_key(&rel.lhs) && lhs.is_none() {
                continue;
            }
            let mut extended = Self::bind(&binding, &rel.lhs, Value::from(s));
            if rhs_bound.is_none() {
                if let Some(var) = rel.rhs_var() {
                    extended.insert(var.to_string(), Value::from(o));
                }
            }
            if !out.contains(&extended) {
                out.push(extended);
            }
        }

        if out.is_empty() {
            match rel.optional {
                Optional::Right if lhs.is_some() => {
                    let mut kept = binding;
                    if let Some(var) = rel.rhs_var() {
                        kept.entry(var.to_string()).or_insert(Value::Null);
                    }
                    out.push(kept);
                }
                Optional::Left if rhs.is_some() => {
                    let mut kept = binding;
                    kept.entry(rel.lhs.clone()).or_insert(Value::Null);
                    out.push(kept);
                }
                _ => {}
            }
        }
        out
    }

    /// Entity types `var` may take across the branch solutions
    fn entity_types(&self, var: &str) -> Option<BTreeSet<String>> {
        let types = self.select.var_types(var);
        if types.is_empty() || types.iter().any(|t| is_final_type(t)) {
            None
        } else {
            Some(types)
        }
    }

    /// Binds remaining output variables and enforces solution types
    fn complete(&self, bindings: Vec<Binding>, vars: &[String]) -> Vec<Binding> {
        let mut current = bindings;
        for var in vars {
            let types = self.entity_types(var);
            let mut next = Vec::new();
            for binding in current {
                if binding.contains_key(var) {
                    next.push(binding);
                    continue;
                }
                for (eid, entity) in &self.store.entities {
                    if types.as_ref().map(|t| t.contains(&entity.etype)).unwrap_or(true) {
                        next.push(Self::bind(&binding, var, Value::from(*eid)));
                    }
                }
            }
            current = next;
        }

        let typed: Vec<(String, BTreeSet<String>)> = self
            .select
            .variables()
            .into_iter()
            .filter_map(|v| self.entity_types(&v).map(|t| (v, t)))
            .collect();
        current
            .into_iter()
            .filter(|binding| {
                typed.iter().all(|(var, types)| {
                    match binding
                        .get(var)
                        .and_then(Value::as_i64)
                        .and_then(|eid| self.store.entities.get(&eid))
                    {
                        Some(entity) => types.contains(&entity.etype),
                        None => true,
                    }
                })
            })
            .collect()
    }
}
