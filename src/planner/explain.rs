//! Explain output
//!
//! Deterministic, human-readable rendering of a plan's step tree, or of the
//! error that rejected the statement.

use std::fmt;

use serde::Serialize;

use crate::executor::{ExecutionPlan, StepRepr};
use crate::source::Session;

use super::errors::PlannerError;

#[derive(Debug, Clone, Serialize)]
pub struct ExplainPlan {
    pub accepted: bool,
    /// Statement text as received
    pub statement: String,
    pub steps: Vec<StepRepr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl ExplainPlan {
    pub fn from_plan(statement: impl Into<String>, plan: &ExecutionPlan, session: &Session<'_>) -> Self {
        Self {
            accepted: true,
            statement: statement.into(),
            steps: plan.test_repr(session),
            rejection_code: None,
            rejection_reason: None,
        }
    }

    pub fn from_error(statement: impl Into<String>, err: &PlannerError) -> Self {
        Self {
            accepted: false,
            statement: statement.into(),
            steps: Vec::new(),
            rejection_code: Some(err.code().to_string()),
            rejection_reason: Some(err.to_string()),
        }
    }

    /// Number of steps, children included
    pub fn step_count(&self) -> usize {
        fn count(repr: &StepRepr) -> usize {
            1 + repr.children.iter().map(count).sum::<usize>()
        }
        self.steps.iter().map(count).sum()
    }
}

fn write_step(f: &mut fmt::Formatter<'_>, repr: &StepRepr, depth: usize) -> fmt::Result {
    let indent = "  ".repeat(depth);
    write!(f, "{}- {}", indent, repr.step)?;
    if !repr.sources.is_empty() {
        write!(f, " [{}]", repr.sources.join(", "))?;
    }
    if let Some(table) = &repr.output {
        write!(f, " -> {}", table)?;
    }
    writeln!(f)?;
    for (query, solutions) in &repr.queries {
        writeln!(f, "{}    {}", indent, query)?;
        if !solutions.is_empty() {
            let rendered: Vec<String> = solutions
                .iter()
                .map(|s| {
                    let pairs: Vec<String> =
                        s.iter().map(|(var, etype)| format!("{}: {}", var, etype)).collect();
                    format!("{{{}}}", pairs.join(", "))
                })
                .collect();
            writeln!(f, "{}    solutions: {}", indent, rendered.join(" "))?;
        }
    }
    for (var, columns) in &repr.inputs {
        writeln!(f, "{}    input {} = {}", indent, var, columns.join(" = "))?;
    }
    if repr.limit.is_some() || repr.offset > 0 {
        let limit = repr
            .limit
            .map(|l| l.to_string())
            .unwrap_or_else(|| "none".to_string());
        writeln!(f, "{}    window: limit {} offset {}", indent, limit, repr.offset)?;
    }
    for child in &repr.children {
        write_step(f, child, depth + 1)?;
    }
    Ok(())
}

impl fmt::Display for ExplainPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== EXPLAIN PLAN ===")?;
        writeln!(f, "Statement: {}", self.statement)?;

        if self.accepted {
            writeln!(f, "Status: ACCEPTED")?;
            writeln!(f, "Steps: {}", self.step_count())?;
            for step in &self.steps {
                write_step(f, step, 0)?;
            }
        } else {
            writeln!(f, "Status: REJECTED")?;
            if let Some(code) = &self.rejection_code {
                writeln!(f, "Error Code: {}", code)?;
            }
            if let Some(reason) = &self.rejection_reason {
                writeln!(f, "Reason: {}", reason)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{FetchQuery, Step, TableOutput};
    use crate::observability::Observer;
    use crate::schema::Schema;
    use crate::source::{ColumnRef, InputMap, MemorySource, Repository, SourceDescriptor, SourceId};
    use crate::syntax::{solution, Operand, Relation, Select, Union};
    use std::rc::Rc;

    fn repo() -> Repository {
        let system = MemorySource::new(SourceDescriptor::system(), Schema::new());
        Repository::new(Schema::new(), Rc::new(system))
    }

    fn plan() -> ExecutionPlan {
        let users = Select::any(&["X"])
            .with_relations(vec![Relation::new("X", "is", Operand::etype("User"))])
            .with_solutions(vec![solution(&[("X", "User")])]);
        let fetch = Step::fetch(
            FetchQuery::new(Union::single(users), vec![SourceId::SYSTEM]),
            TableOutput {
                table: "table0".to_string(),
                columns: vec!["X".to_string()],
            },
            Vec::new(),
        );
        let mut inputs = InputMap::new();
        inputs.insert("X".to_string(), vec![ColumnRef::new("table0", 0)]);
        let last = Select::any(&["X"])
            .with_relations(vec![Relation::new("X", "in_group", Operand::var("G"))]);
        let mut plan = ExecutionPlan::new(Observer::silent());
        plan.add_step(Step::one_fetch(
            FetchQuery::new(Union::single(last), vec![SourceId::SYSTEM]).with_inputs(inputs),
            vec![fetch],
        ));
        plan
    }

    #[test]
    fn test_explain_accepted_plan() {
        let repo = repo();
        let session = Session::new(&repo);
        let explain = ExplainPlan::from_plan("Any X WHERE X in_group G", &plan(), &session);

        assert!(explain.accepted);
        assert_eq!(explain.step_count(), 2);
        let output = explain.to_string();
        assert!(output.starts_with("=== EXPLAIN PLAN ===\n"));
        assert!(output.contains("Status: ACCEPTED"));
        assert!(output.contains("- OneFetchStep [system]"));
        assert!(output.contains("  - FetchStep [system] -> table0"));
        assert!(output.contains("input X = table0.C0"));
        assert!(output.contains("solutions: {X: User}"));
    }

    #[test]
    fn test_explain_rejected_plan() {
        let err = PlannerError::read_only("eid");
        let explain = ExplainPlan::from_error("SET X eid 3 WHERE X eid 1", &err);

        assert!(!explain.accepted);
        assert_eq!(
            explain.rejection_code,
            Some("AERO_PLAN_READONLY_RELATION".into())
        );
        let output = explain.to_string();
        assert!(output.contains("REJECTED"));
        assert!(output.contains("Error Code: AERO_PLAN_READONLY_RELATION"));
    }

    #[test]
    fn test_explain_deterministic() {
        let repo = repo();
        let session = Session::new(&repo);
        let plan = plan();
        let first = ExplainPlan::from_plan("q", &plan, &session).to_string();
        let second = ExplainPlan::from_plan("q", &plan, &session).to_string();
        assert_eq!(first, second);
    }
}
