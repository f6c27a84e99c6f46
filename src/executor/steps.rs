//! Step algebra of an execution plan
//!
//! Steps form a DAG through `Rc` children. A step is executed at most once:
//! children run first in declaration order, the produced rows are cached and
//! handed to every later parent sharing the step.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;

use crate::observability::TraceEvent;
use crate::source::{InputMap, Row, SearchInputs, SourceId};
use crate::syntax::{Operand, Union};

use super::errors::{ExecutorError, ExecutorResult};
use super::mutation::Mutation;
use super::plan::ExecContext;
use super::shape::{apply_window, dedup_rows, Binding, ResultShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Executing,
    Produced,
    Failed,
}

/// Sub-statement sent to one or more sources
#[derive(Debug, Clone, PartialEq)]
pub struct FetchQuery {
    pub union: Union,
    pub sources: Vec<SourceId>,
    /// Variables read from temp tables written by earlier steps
    pub inputs: InputMap,
    /// Window re-applied locally when several sources answer
    pub limit: Option<u64>,
    pub offset: u64,
}

impl FetchQuery {
    pub fn new(union: Union, sources: Vec<SourceId>) -> Self {
        Self {
            union,
            sources,
            inputs: InputMap::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn with_inputs(mut self, inputs: InputMap) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_window(mut self, limit: Option<u64>, offset: u64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Temp table written by a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOutput {
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug)]
pub enum StepKind {
    /// Final fetch returning rows to the caller
    OneFetch(FetchQuery),
    /// Non-final fetch writing a temp table
    Fetch(FetchQuery, TableOutput),
    /// Concatenation of children
    Union {
        distinct: bool,
        output: Option<TableOutput>,
    },
    /// Rows present in every child
    Intersect,
    /// Re-applies a branch shape over children rows laid out as `columns`
    Aggr {
        columns: Vec<String>,
        shape: ResultShape,
    },
    Mutation(Mutation),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::OneFetch(_) => "OneFetchStep",
            StepKind::Fetch(..) => "FetchStep",
            StepKind::Union { .. } => "UnionStep",
            StepKind::Intersect => "IntersectStep",
            StepKind::Aggr { .. } => "AggrStep",
            StepKind::Mutation(_) => "MutationStep",
        }
    }
}

#[derive(Debug)]
pub struct Step {
    kind: StepKind,
    children: Vec<Rc<Step>>,
    state: Cell<StepState>,
    produced: RefCell<Vec<Row>>,
}

impl Step {
    pub fn new(kind: StepKind, children: Vec<Rc<Step>>) -> Rc<Self> {
        Rc::new(Self {
            kind,
            children,
            state: Cell::new(StepState::Pending),
            produced: RefCell::new(Vec::new()),
        })
    }

    pub fn one_fetch(query: FetchQuery, children: Vec<Rc<Step>>) -> Rc<Self> {
        Self::new(StepKind::OneFetch(query), children)
    }

    pub fn fetch(query: FetchQuery, output: TableOutput, children: Vec<Rc<Step>>) -> Rc<Self> {
        Self::new(StepKind::Fetch(query, output), children)
    }

    pub fn union(children: Vec<Rc<Step>>, distinct: bool) -> Rc<Self> {
        Self::new(
            StepKind::Union {
                distinct,
                output: None,
            },
            children,
        )
    }

    pub fn intersect(children: Vec<Rc<Step>>) -> Rc<Self> {
        Self::new(StepKind::Intersect, children)
    }

    pub fn aggr(children: Vec<Rc<Step>>, columns: Vec<String>, shape: ResultShape) -> Rc<Self> {
        Self::new(StepKind::Aggr { columns, shape }, children)
    }

    pub fn mutation(mutation: Mutation, child: Option<Rc<Step>>) -> Rc<Self> {
        Self::new(StepKind::Mutation(mutation), child.into_iter().collect())
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn children(&self) -> &[Rc<Step>] {
        &self.children
    }

    pub fn state(&self) -> StepState {
        self.state.get()
    }

    /// Fetch query of fetch steps
    pub fn query(&self) -> Option<&FetchQuery> {
        match &self.kind {
            StepKind::OneFetch(q) | StepKind::Fetch(q, _) => Some(q),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&TableOutput> {
        match &self.kind {
            StepKind::Fetch(_, output) => Some(output),
            StepKind::Union { output, .. } => output.as_ref(),
            _ => None,
        }
    }

    /// Runs children then this step; shared steps answer from cache
    pub fn execute(&self, ctx: &ExecContext<'_>) -> ExecutorResult<Vec<Row>> {
        match self.state.get() {
            StepState::Produced => return Ok(self.produced.borrow().clone()),
            StepState::Executing | StepState::Failed => {
                return Err(ExecutorError::AlreadyExecuted {
                    step: self.name().to_string(),
                })
            }
            StepState::Pending => {}
        }
        self.state.set(StepState::Executing);
        match self.run(ctx) {
            Ok(rows) => {
                self.state.set(StepState::Produced);
                *self.produced.borrow_mut() = rows.clone();
                ctx.observer.emit(TraceEvent::StepExecuted {
                    step: self.name().to_string(),
                    rows: rows.len(),
                });
                Ok(rows)
            }
            Err(err) => {
                self.state.set(StepState::Failed);
                Err(err)
            }
        }
    }

    fn run(&self, ctx: &ExecContext<'_>) -> ExecutorResult<Vec<Row>> {
        let mut children_rows = Vec::with_capacity(self.children.len());
        for child in &self.children {
            children_rows.push(child.execute(ctx)?);
        }

        match &self.kind {
            StepKind::OneFetch(query) => fetch(ctx, query),
            StepKind::Fetch(query, output) => {
                let rows = fetch(ctx, query)?;
                ctx.tables
                    .borrow_mut()
                    .append(&output.table, &output.columns, rows.clone());
                Ok(rows)
            }
            StepKind::Union { distinct, output } => {
                let mut rows: Vec<Row> = children_rows.into_iter().flatten().collect();
                if *distinct {
                    rows = dedup_rows(rows);
                }
                if let Some(output) = output {
                    ctx.tables
                        .borrow_mut()
                        .append(&output.table, &output.columns, rows.clone());
                }
                Ok(rows)
            }
            StepKind::Intersect => {
                let mut children_rows = children_rows.into_iter();
                let first = children_rows.next().unwrap_or_default();
                let others: Vec<Vec<Row>> = children_rows.collect();
                let kept = first
                    .into_iter()
                    .filter(|row| others.iter().all(|rows| rows.contains(row)))
                    .collect();
                Ok(dedup_rows(kept))
            }
            StepKind::Aggr { columns, shape } => {
                let bindings: Vec<Binding> = children_rows
                    .into_iter()
                    .flatten()
                    .map(|row| columns.iter().cloned().zip(row).collect())
                    .collect();
                shape.apply(bindings, ctx.args)
            }
            StepKind::Mutation(mutation) => {
                let input = children_rows.into_iter().next();
                mutation.apply(ctx, input)
            }
        }
    }
}

fn fetch(ctx: &ExecContext<'_>, query: &FetchQuery) -> ExecutorResult<Vec<Row>> {
    let text = query.union.to_string();
    let tables = ctx.tables.borrow();
    for column in query.inputs.values().flatten() {
        if !tables.contains(&column.table) {
            return Err(ExecutorError::MissingTempTable {
                table: column.table.clone(),
            });
        }
    }
    let inputs = if query.inputs.is_empty() {
        None
    } else {
        Some(SearchInputs {
            map: &query.inputs,
            tables: &tables,
        })
    };

    let mut rows = Vec::new();
    for source_id in &query.sources {
        let source = ctx.session.repo.source(*source_id);
        let found =
            source.syntax_tree_search(&ctx.session, &query.union, ctx.args, Some(&text), inputs)?;
        ctx.observer.emit(TraceEvent::SourceSearch {
            source: source.uri().to_string(),
            query: text.clone(),
            rows: found.len(),
        });
        rows.extend(found);
    }
    if query.sources.len() > 1 {
        rows = apply_window(rows, query.limit, query.offset);
    }
    Ok(rows)
}

/// Value an operand takes under `binding`, if known
pub(crate) fn operand_value(
    operand: &Operand,
    binding: &BTreeMap<String, Value>,
    args: &BTreeMap<String, Value>,
) -> Option<Value> {
    match operand {
        Operand::Var(name) => binding.get(name).cloned(),
        Operand::Const(constant) => Some(constant.resolve(args)),
        Operand::Func(..) => None,
    }
}
