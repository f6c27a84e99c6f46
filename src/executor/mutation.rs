//! Mutation steps
//!
//! A mutation consumes the rows of its child fetch (or a single empty row
//! when there is none) and applies its operations once per row. Every call is
//! routed to the source owning the entity involved.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::Value;

use crate::observability::TraceEvent;
use crate::source::{Row, SourceId};
use crate::syntax::Operand;

use super::errors::{ExecutorError, ExecutorResult};
use super::plan::ExecContext;
use super::steps::operand_value;

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOp {
    /// Creates the entity bound to `var` in `source`
    AddEntity {
        var: String,
        etype: String,
        source: SourceId,
        attributes: Vec<(String, Operand)>,
    },
    UpdateEntity {
        var: String,
        attributes: Vec<(String, Operand)>,
    },
    DeleteEntity {
        var: String,
    },
    AddRelation {
        lhs: Operand,
        rtype: String,
        rhs: Operand,
    },
    DeleteRelation {
        lhs: Operand,
        rtype: String,
        rhs: Operand,
    },
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attrs = |attributes: &[(String, Operand)]| {
            attributes
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",")
        };
        match self {
            MutationOp::AddEntity {
                var,
                etype,
                attributes,
                ..
            } => write!(f, "add {} {} [{}]", etype, var, attrs(attributes)),
            MutationOp::UpdateEntity { var, attributes } => {
                write!(f, "update {} [{}]", var, attrs(attributes))
            }
            MutationOp::DeleteEntity { var } => write!(f, "delete {}", var),
            MutationOp::AddRelation { lhs, rtype, rhs } => {
                write!(f, "add relation {} {} {}", lhs, rtype, rhs)
            }
            MutationOp::DeleteRelation { lhs, rtype, rhs } => {
                write!(f, "delete relation {} {} {}", lhs, rtype, rhs)
            }
        }
    }
}

/// Operations applied per input row; input rows are laid out as `columns`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mutation {
    pub columns: Vec<String>,
    pub ops: Vec<MutationOp>,
}

impl Mutation {
    pub fn new(columns: Vec<String>, ops: Vec<MutationOp>) -> Self {
        Self { columns, ops }
    }

    /// Applies every operation for every row
    ///
    /// Returns the input rows, extended with the eids of created entities.
    pub fn apply(&self, ctx: &ExecContext<'_>, input: Option<Vec<Row>>) -> ExecutorResult<Vec<Row>> {
        let rows = input.unwrap_or_else(|| vec![Vec::new()]);
        let mut deleted = BTreeSet::new();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut binding: BTreeMap<String, Value> =
                self.columns.iter().cloned().zip(row.iter().cloned()).collect();
            let mut produced = row;
            for op in &self.ops {
                if let Some(eid) = self.apply_op(ctx, op, &mut binding, &mut deleted)? {
                    produced.push(Value::from(eid));
                }
            }
            out.push(produced);
        }
        Ok(out)
    }

    fn apply_op(
        &self,
        ctx: &ExecContext<'_>,
        op: &MutationOp,
        binding: &mut BTreeMap<String, Value>,
        deleted: &mut BTreeSet<i64>,
    ) -> ExecutorResult<Option<i64>> {
        let repo = ctx.session.repo;
        match op {
            MutationOp::AddEntity {
                var,
                etype,
                source,
                attributes,
            } => {
                let values = resolve_attributes(attributes, binding, ctx)?;
                let eid = repo.allocate_eid();
                let target = repo.source(*source);
                target.add_entity(&ctx.session, eid, etype, &values)?;
                repo.register_eid(eid, *source);
                binding.insert(var.clone(), Value::from(eid));
                self.applied(ctx, *source, op);
                Ok(Some(eid))
            }
            MutationOp::UpdateEntity { var, attributes } => {
                let Some(eid) = entity(binding, var)? else {
                    return Ok(None);
                };
                let values = resolve_attributes(attributes, binding, ctx)?;
                let owner = repo.source_from_eid(eid).unwrap_or(SourceId::SYSTEM);
                repo.source(owner).update_entity(&ctx.session, eid, &values)?;
                self.applied(ctx, owner, op);
                Ok(None)
            }
            MutationOp::DeleteEntity { var } => {
                let Some(eid) = entity(binding, var)? else {
                    return Ok(None);
                };
                if !deleted.insert(eid) {
                    return Ok(None);
                }
                let owner = repo.source_from_eid(eid).unwrap_or(SourceId::SYSTEM);
                repo.source(owner).delete_entity(&ctx.session, eid)?;
                repo.forget_eid(eid);
                self.applied(ctx, owner, op);
                Ok(None)
            }
            MutationOp::AddRelation { lhs, rtype, rhs }
            | MutationOp::DeleteRelation { lhs, rtype, rhs } => {
                let (Some(subject), Some(object)) = (
                    endpoint(lhs, binding, ctx)?,
                    endpoint(rhs, binding, ctx)?,
                ) else {
                    return Ok(None);
                };
                let owner = repo.source_from_eid(subject).unwrap_or(SourceId::SYSTEM);
                let target = if repo.source(owner).support_relation(rtype, true) {
                    owner
                } else {
                    SourceId::SYSTEM
                };
                let source = repo.source(target);
                if matches!(op, MutationOp::AddRelation { .. }) {
                    source.add_relation(&ctx.session, subject, rtype, object)?;
                } else {
                    source.delete_relation(&ctx.session, subject, rtype, object)?;
                }
                self.applied(ctx, target, op);
                Ok(None)
            }
        }
    }

    fn applied(&self, ctx: &ExecContext<'_>, source: SourceId, op: &MutationOp) {
        ctx.observer.emit(TraceEvent::MutationApplied {
            source: ctx.session.repo.uri(source).to_string(),
            operation: op.to_string(),
        });
    }
}

fn resolve_attributes(
    attributes: &[(String, Operand)],
    binding: &BTreeMap<String, Value>,
    ctx: &ExecContext<'_>,
) -> ExecutorResult<BTreeMap<String, Value>> {
    attributes
        .iter()
        .map(|(name, operand)| {
            operand_value(operand, binding, ctx.args)
                .map(|value| (name.clone(), value))
                .ok_or_else(|| ExecutorError::mutation(format!("no value for {}", operand)))
        })
        .collect()
}

/// Eid bound to `var`; `None` for outer-join nulls
fn entity(binding: &BTreeMap<String, Value>, var: &str) -> ExecutorResult<Option<i64>> {
    match binding.get(var) {
        None => Err(ExecutorError::mutation(format!("{} is not bound", var))),
        Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| ExecutorError::mutation(format!("{} is not an entity", var))),
    }
}

fn endpoint(
    operand: &Operand,
    binding: &BTreeMap<String, Value>,
    ctx: &ExecContext<'_>,
) -> ExecutorResult<Option<i64>> {
    match operand {
        Operand::Var(var) => entity(binding, var),
        other => match operand_value(other, binding, ctx.args) {
            Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_i64()
                .map(Some)
                .ok_or_else(|| ExecutorError::mutation(format!("{} is not an entity", other))),
            None => Err(ExecutorError::mutation(format!("{} is not an entity", other))),
        },
    }
}
