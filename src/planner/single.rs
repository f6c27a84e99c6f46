//! Single-source planning and mutation steps
//!
//! With one source nothing needs to be decomposed: a SELECT becomes one fetch
//! addressed to every registered source. Mutations are shared with the
//! multi-source planner, which only differs in how the feeding SELECT is
//! planned.

use std::collections::BTreeSet;
use std::rc::Rc;

use crate::executor::{ExecutionPlan, FetchQuery, Mutation, MutationOp, Step};
use crate::schema::is_readonly_relation;
use crate::source::{Repository, SourceId};
use crate::syntax::{Delete, Insert, MainRelation, Operand, Relation, Select, Statement, Union};

use super::annotator::Annotator;
use super::errors::{PlannerError, PlannerResult};

/// Plans the steps producing the rows of a SELECT
pub trait SelectPlanner {
    fn plan_select(&self, plan: &mut ExecutionPlan, union: &Union) -> PlannerResult<Vec<Rc<Step>>>;
}

pub struct SinglesourcePlanner<'r> {
    repo: &'r Repository,
}

impl<'r> SinglesourcePlanner<'r> {
    pub fn new(repo: &'r Repository) -> Self {
        Self { repo }
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
}

impl SelectPlanner for SinglesourcePlanner<'_> {
    fn plan_select(&self, _plan: &mut ExecutionPlan, union: &Union) -> PlannerResult<Vec<Rc<Step>>> {
        let sources: Vec<SourceId> = self.repo.source_ids().collect();
        let annotations = Annotator::new(self.repo.schema()).annotate(&union.children);
        Ok(vec![Step::one_fetch(
            FetchQuery::new(annotations.deduplicated(union), sources),
            Vec::new(),
        )])
    }
}

/// Builds the mutation step of an INSERT / UPDATE / DELETE
///
/// Variables the operations read are enumerated by a SELECT planned through
/// `selects`; its rows feed the mutation step.
pub fn plan_mutation(
    repo: &Repository,
    selects: &dyn SelectPlanner,
    plan: &mut ExecutionPlan,
    statement: &Statement,
) -> PlannerResult<Rc<Step>> {
    let (ops, select, distinct) = match statement {
        Statement::Insert(insert) => (insert_ops(repo, insert)?, insert.select.clone(), false),
        Statement::Update(update) => (
            update_ops(repo, &update.relations)?,
            Some(update.select.clone()),
            true,
        ),
        Statement::Delete(delete) => (delete_ops(repo, delete)?, Some(delete_select(delete)), true),
        Statement::Select(_) => return Err(PlannerError::query_shape("SELECT is not a mutation")),
    };

    let columns = read_variables(&ops);
    if columns.is_empty() {
        return Ok(Step::mutation(Mutation::new(columns, ops), None));
    }
    let Some(mut select) = select else {
        return Err(PlannerError::query_shape(format!(
            "unbound variables {}",
            columns.join(",")
        )));
    };
    select.selection = columns.iter().map(Operand::var).collect();
    select.distinct = select.distinct || distinct;

    let mut steps = selects.plan_select(plan, &Union::single(select))?;
    let child = if steps.len() == 1 {
        steps.remove(0)
    } else {
        Step::union(steps, distinct)
    };
    Ok(Step::mutation(Mutation::new(columns, ops), Some(child)))
}

fn check_writable(repo: &Repository, rtype: &str) -> PlannerResult<()> {
    if is_readonly_relation(rtype) {
        return Err(PlannerError::read_only(rtype));
    }
    if !repo.source_ids().any(|s| repo.source(s).support_relation(rtype, true)) {
        return Err(PlannerError::unsupported_write(rtype));
    }
    Ok(())
}

/// First non-system source able to write the entity and its attributes
fn insert_target(repo: &Repository, etype: &str, attributes: &[&str]) -> PlannerResult<SourceId> {
    let writable = |id: SourceId| {
        let source = repo.source(id);
        source.support_entity(etype, true)
            && attributes.iter().all(|a| source.support_relation(a, true))
    };
    repo.source_ids()
        .filter(|s| !s.is_system())
        .find(|s| writable(*s))
        .or_else(|| writable(SourceId::SYSTEM).then_some(SourceId::SYSTEM))
        .ok_or_else(|| PlannerError::unsupported_write(etype))
}

fn insert_ops(repo: &Repository, insert: &Insert) -> PlannerResult<Vec<MutationOp>> {
    let schema = repo.schema();
    let mut ops = Vec::new();
    for entity in &insert.entities {
        let attributes: Vec<&MainRelation> = insert
            .relations
            .iter()
            .filter(|r| r.lhs == entity.var && schema.is_final(&r.rtype))
            .collect();
        for attr in &attributes {
            check_writable(repo, &attr.rtype)?;
        }
        let names: Vec<&str> = attributes.iter().map(|a| a.rtype.as_str()).collect();
        ops.push(MutationOp::AddEntity {
            var: entity.var.clone(),
            etype: entity.etype.clone(),
            source: insert_target(repo, &entity.etype, &names)?,
            attributes: attributes
                .iter()
                .map(|a| (a.rtype.clone(), a.rhs.clone()))
                .collect(),
        });
    }
    let created: BTreeSet<&str> = insert.entities.iter().map(|e| e.var.as_str()).collect();
    for rel in &insert.relations {
        if created.contains(rel.lhs.as_str()) && schema.is_final(&rel.rtype) {
            continue;
        }
        check_writable(repo, &rel.rtype)?;
        if schema.is_final(&rel.rtype) {
            ops.push(MutationOp::UpdateEntity {
                var: rel.lhs.clone(),
                attributes: vec![(rel.rtype.clone(), rel.rhs.clone())],
            });
        } else {
            ops.push(MutationOp::AddRelation {
                lhs: Operand::var(rel.lhs.clone()),
                rtype: rel.rtype.clone(),
                rhs: rel.rhs.clone(),
            });
        }
    }
    Ok(ops)
}

fn update_ops(repo: &Repository, relations: &[MainRelation]) -> PlannerResult<Vec<MutationOp>> {
    let schema = repo.schema();
    let mut ops: Vec<MutationOp> = Vec::new();
    for rel in relations {
        check_writable(repo, &rel.rtype)?;
        if !schema.is_final(&rel.rtype) {
            ops.push(MutationOp::AddRelation {
                lhs: Operand::var(rel.lhs.clone()),
                rtype: rel.rtype.clone(),
                rhs: rel.rhs.clone(),
            });
            continue;
        }
        let existing = ops.iter_mut().find_map(|op| match op {
            MutationOp::UpdateEntity { var, attributes } if *var == rel.lhs => Some(attributes),
            _ => None,
        });
        match existing {
            Some(attributes) => attributes.push((rel.rtype.clone(), rel.rhs.clone())),
            None => ops.push(MutationOp::UpdateEntity {
                var: rel.lhs.clone(),
                attributes: vec![(rel.rtype.clone(), rel.rhs.clone())],
            }),
        }
    }
    Ok(ops)
}

fn delete_ops(repo: &Repository, delete: &Delete) -> PlannerResult<Vec<MutationOp>> {
    let mut ops = Vec::new();
    for rel in &delete.relations {
        check_writable(repo, &rel.rtype)?;
        ops.push(MutationOp::DeleteRelation {
            lhs: Operand::var(rel.lhs.clone()),
            rtype: rel.rtype.clone(),
            rhs: rel.rhs.clone(),
        });
    }
    for entity in &delete.entities {
        let writable = entity.etype == "Any"
            || repo
                .source_ids()
                .any(|s| repo.source(s).support_entity(&entity.etype, true));
        if !writable {
            return Err(PlannerError::unsupported_write(entity.etype.clone()));
        }
        ops.push(MutationOp::DeleteEntity {
            var: entity.var.clone(),
        });
    }
    Ok(ops)
}

/// DELETE restriction, typed by the deleted entities
fn delete_select(delete: &Delete) -> Select {
    let mut select = delete.select.clone();
    for entity in &delete.entities {
        if entity.etype == "Any" {
            continue;
        }
        let typed = select
            .relations()
            .any(|(_, r)| r.lhs == entity.var && r.rtype == "is");
        if !typed {
            let id = select.rel(Relation::new(
                entity.var.clone(),
                "is",
                Operand::etype(entity.etype.clone()),
            ));
            select.push_restriction(id);
        }
    }
    select
}

/// Variables read by `ops` and not created by them, sorted
fn read_variables(ops: &[MutationOp]) -> Vec<String> {
    let mut read = BTreeSet::new();
    let mut created = BTreeSet::new();
    for op in ops {
        match op {
            MutationOp::AddEntity {
                var, attributes, ..
            } => {
                created.insert(var.clone());
                for (_, value) in attributes {
                    value.variables(&mut read);
                }
            }
            MutationOp::UpdateEntity { var, attributes } => {
                read.insert(var.clone());
                for (_, value) in attributes {
                    value.variables(&mut read);
                }
            }
            MutationOp::DeleteEntity { var } => {
                read.insert(var.clone());
            }
            MutationOp::AddRelation { lhs, rhs, .. } | MutationOp::DeleteRelation { lhs, rhs, .. } => {
                lhs.variables(&mut read);
                rhs.variables(&mut read);
            }
        }
    }
    read.difference(&created).cloned().collect()
}
