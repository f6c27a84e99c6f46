//! CLI command implementations
//!
//! Each command loads the repository, reads one statement from stdin and
//! writes one JSON response to stdout. Planning errors are reported before
//! any source is contacted.

use std::path::Path;

use serde_json::{json, Value};

use crate::planner::{ExplainPlan, PlannerConfig, QueryPlanner};
use crate::source::{QueryArgs, Repository, Session};
use crate::syntax::Statement;

use super::args::{Cli, Command, CommonArgs};
use super::config::load_repository;
use super::errors::{CliError, CliResult};
use super::io::{read_statement, write_error, write_response};

pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}

pub fn run_command(cmd: Command) -> CliResult<()> {
    let result = match cmd {
        Command::Explain(common) => explain(&common),
        Command::Run { common, args } => execute(&common, args.as_deref()),
    };
    match result {
        Ok(data) => write_response(data),
        Err(err) => {
            write_error(err.code(), &err.to_string())?;
            Err(err)
        }
    }
}

fn planner_config(base: &PlannerConfig, common: &CommonArgs) -> PlannerConfig {
    base.clone()
        .with_logging(base.log_events || common.verbose)
        .with_force_multisource(base.force_multisource || common.force_multisource)
}

/// Plans the statement read from stdin and returns its explain output
pub fn explain(common: &CommonArgs) -> CliResult<Value> {
    let (config, repo) = load_repository(&common.config, common.verbose)?;
    let statement = read_statement()?;
    explain_statement(&repo, planner_config(&config.planner, common), &statement)
}

/// Plans and executes the statement read from stdin
pub fn execute(common: &CommonArgs, args: Option<&str>) -> CliResult<Value> {
    let (config, repo) = load_repository(&common.config, common.verbose)?;
    let args = parse_args(args)?;
    let statement = read_statement()?;
    run_statement(
        &repo,
        planner_config(&config.planner, common),
        &statement,
        &args,
    )
}

fn parse_args(args: Option<&str>) -> CliResult<QueryArgs> {
    match args {
        Some(text) => Ok(serde_json::from_str(text)?),
        None => Ok(QueryArgs::new()),
    }
}

/// A rejected statement is still a successful explain
pub fn explain_statement(
    repo: &Repository,
    config: PlannerConfig,
    statement: &Statement,
) -> CliResult<Value> {
    let text = statement.to_string();
    let explain = match QueryPlanner::new(repo, config).build_plan(statement) {
        Ok(plan) => ExplainPlan::from_plan(text, &plan, &Session::new(repo)),
        Err(err) => ExplainPlan::from_error(text, &err),
    };
    Ok(json!({
        "explain": explain.to_string(),
        "plan": serde_json::to_value(&explain)?,
    }))
}

pub fn run_statement(
    repo: &Repository,
    config: PlannerConfig,
    statement: &Statement,
    args: &QueryArgs,
) -> CliResult<Value> {
    let plan = QueryPlanner::new(repo, config).build_plan(statement)?;
    let rows = plan.execute(Session::new(repo), args)?;
    Ok(json!({
        "statement": statement.kind(),
        "rows": rows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::RepositoryConfig;
    use crate::syntax::{solution, MainRelation, Operand, Relation, Select, Union, Update};

    fn repo() -> Repository {
        let config = json!({
            "schema": { "relations": {
                "login": { "final": true },
                "name": { "final": true },
                "in_group": {}
            } },
            "sources": [
                { "uri": "system", "all_types": true,
                  "data": {
                    "entities": [
                      { "eid": 1, "etype": "User", "attributes": { "login": "admin" } },
                      { "eid": 10, "etype": "Group", "attributes": { "name": "users" } }
                    ],
                    "relations": [
                      { "subject": 1, "rtype": "in_group", "object": 10 },
                      { "subject": 7, "rtype": "in_group", "object": 10 }
                    ] } },
                { "uri": "ldap", "entities": { "User": false }, "relations": { "login": false },
                  "data": { "entities": [
                      { "eid": 7, "etype": "User", "attributes": { "login": "bob" } }
                  ] } }
            ]
        });
        RepositoryConfig::parse(&config.to_string())
            .unwrap()
            .build_repository()
            .unwrap()
    }

    fn members() -> Statement {
        Statement::Select(Union::single(
            Select::any(&["L"])
                .with_relations(vec![
                    Relation::new("X", "login", Operand::var("L")),
                    Relation::new("X", "in_group", Operand::var("G")),
                    Relation::new("G", "name", Operand::string("users")),
                ])
                .with_solutions(vec![solution(&[
                    ("X", "User"),
                    ("L", "String"),
                    ("G", "Group"),
                ])]),
        ))
    }

    #[test]
    fn test_explain_statement() {
        let repo = repo();
        let value = explain_statement(&repo, PlannerConfig::new(), &members()).unwrap();
        let text = value["explain"].as_str().unwrap();
        assert!(text.starts_with("=== EXPLAIN PLAN ==="));
        assert!(text.contains("Status: ACCEPTED"));
        assert!(text.contains("FetchStep [system, ldap] -> table0"));
        assert_eq!(value["plan"]["accepted"], json!(true));
    }

    #[test]
    fn test_explain_rejected_statement() {
        let repo = repo();
        let update = Statement::Update(Update {
            relations: vec![MainRelation::new("X", "eid", Operand::int(2))],
            select: Select::any(&["X"])
                .with_relations(vec![Relation::new("X", "eid", Operand::int(1))]),
        });
        let value = explain_statement(&repo, PlannerConfig::new(), &update).unwrap();
        assert_eq!(value["plan"]["accepted"], json!(false));
        assert_eq!(
            value["plan"]["rejection_code"],
            json!("AERO_PLAN_READONLY_RELATION")
        );
    }

    #[test]
    fn test_run_statement() {
        let repo = repo();
        let value =
            run_statement(&repo, PlannerConfig::new(), &members(), &QueryArgs::new()).unwrap();
        assert_eq!(value["statement"], json!("SELECT"));
        let mut rows: Vec<String> = value["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r[0].as_str().unwrap().to_string())
            .collect();
        rows.sort();
        assert_eq!(rows, vec!["admin".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_demo_files() {
        let (_, repo) = load_repository(Path::new("demos/repository.json"), false).unwrap();
        let text = std::fs::read_to_string("demos/members.json").unwrap();
        let statement = crate::cli::io::parse_statement(&text).unwrap();
        assert_eq!(statement, members());

        let value =
            run_statement(&repo, PlannerConfig::new(), &statement, &QueryArgs::new()).unwrap();
        assert_eq!(value["rows"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_parse_args() {
        let args = parse_args(Some("{\"login\": \"bob\"}")).unwrap();
        assert_eq!(args["login"], json!("bob"));
        assert!(parse_args(None).unwrap().is_empty());
        assert!(parse_args(Some("not json")).is_err());
    }
}
