//! Mutation Routing Tests
//!
//! Every mutation reaches the source owning the entity involved:
//! - DELETE of an eid only ever addresses its owner
//! - New entities go to the first source able to write them
//! - Read-only relations and unwritable types are rejected before any source
//!   is contacted

use std::rc::Rc;

use aeroplan::planner::{PlannerConfig, QueryPlanner};
use aeroplan::schema::{RelationDef, Schema};
use aeroplan::source::{MemorySource, QueryArgs, Repository, Session, SourceDescriptor, SourceId};
use aeroplan::syntax::{
    solution, Delete, Insert, MainEntity, MainRelation, Operand, Relation, Select, Statement,
    Update,
};
use serde_json::json;

// =============================================================================
// Helper Functions
// =============================================================================

fn schema() -> Schema {
    Schema::new()
        .with_relation("login", RelationDef::attribute())
        .with_relation("in_group", RelationDef::relation())
}

struct Fixture {
    repo: Repository,
    system: Rc<MemorySource>,
    ldap: Rc<MemorySource>,
}

fn fixture(ldap_writable: bool) -> Fixture {
    let system = Rc::new(
        MemorySource::new(SourceDescriptor::system(), schema())
            .with_entity(1, "User", &[("login", json!("admin"))])
            .with_entity(10, "Group", &[]),
    );
    let ldap = Rc::new(
        MemorySource::new(
            SourceDescriptor::new("ldap")
                .with_entity("User", ldap_writable)
                .with_relation("login", ldap_writable),
            schema(),
        )
        .with_entity(42, "User", &[("login", json!("bob"))]),
    );
    let mut repo = Repository::new(schema(), system.clone());
    let ldap_id = repo.add_source(ldap.clone());
    repo.register_eid(1, SourceId::SYSTEM);
    repo.register_eid(10, SourceId::SYSTEM);
    repo.register_eid(42, ldap_id);
    Fixture { repo, system, ldap }
}

fn user(eid: i64) -> Select {
    Select::any(&["X"])
        .with_relations(vec![
            Relation::new("X", "is", Operand::etype("User")),
            Relation::new("X", "eid", Operand::int(eid)),
        ])
        .with_solutions(vec![solution(&[("X", "User")])])
}

fn execute(fixture: &Fixture, statement: &Statement) -> Vec<Vec<serde_json::Value>> {
    let plan = QueryPlanner::new(&fixture.repo, PlannerConfig::new())
        .build_plan(statement)
        .unwrap();
    plan.execute(Session::new(&fixture.repo), &QueryArgs::new())
        .unwrap()
}

// =============================================================================
// Deletion
// =============================================================================

/// `DELETE X WHERE X is User, X eid 42` never addresses the system source.
#[test]
fn test_delete_reaches_owner_only() {
    let fixture = fixture(true);
    let delete = Statement::Delete(Delete {
        entities: vec![MainEntity::new("User", "X")],
        relations: Vec::new(),
        select: user(42),
    });
    execute(&fixture, &delete);

    assert!(fixture.system.calls().is_empty());
    let calls = fixture.ldap.calls();
    assert_eq!(calls.last().map(String::as_str), Some("delete_entity 42"));
    assert!(fixture.ldap.entity(42).is_none());
    assert_eq!(fixture.repo.source_from_eid(42), None);
}

/// Deleting a system entity leaves the ldap source untouched.
#[test]
fn test_delete_system_entity() {
    let fixture = fixture(true);
    let delete = Statement::Delete(Delete {
        entities: vec![MainEntity::new("User", "X")],
        relations: Vec::new(),
        select: user(1),
    });
    execute(&fixture, &delete);
    assert!(fixture.ldap.calls().is_empty());
    assert!(fixture.system.entity(1).is_none());
}

// =============================================================================
// Insertion and Update
// =============================================================================

/// A writable ldap source receives new users; the relation goes to system.
#[test]
fn test_insert_routed_to_writable_source() {
    let fixture = fixture(true);
    let lookup = Select::any(&[])
        .with_relations(vec![Relation::new("G", "eid", Operand::int(10))])
        .with_solutions(vec![solution(&[("G", "Group")])]);
    let insert = Statement::Insert(Insert {
        entities: vec![MainEntity::new("User", "X")],
        relations: vec![
            MainRelation::new("X", "login", Operand::string("carol")),
            MainRelation::new("X", "in_group", Operand::var("G")),
        ],
        select: Some(lookup),
    });
    let rows = execute(&fixture, &insert);

    let eid = rows[0].last().and_then(|v| v.as_i64()).unwrap();
    assert_eq!(fixture.repo.source_from_eid(eid), Some(SourceId(1)));
    assert_eq!(
        fixture.ldap.entity(eid).unwrap().attributes["login"],
        json!("carol")
    );
    assert!(fixture.system.has_relation(eid, "in_group", 10));
    assert!(fixture.system.entity(eid).is_none());
}

/// Without write support on ldap, new users land on the system source.
#[test]
fn test_insert_falls_back_to_system() {
    let fixture = fixture(false);
    let insert = Statement::Insert(Insert {
        entities: vec![MainEntity::new("User", "X")],
        relations: vec![MainRelation::new("X", "login", Operand::string("dave"))],
        select: None,
    });
    let rows = execute(&fixture, &insert);
    let eid = rows[0][0].as_i64().unwrap();
    assert_eq!(fixture.repo.source_from_eid(eid), Some(SourceId::SYSTEM));
    assert!(fixture.ldap.calls().is_empty());
}

/// Updates go to the owner of each selected entity.
#[test]
fn test_update_routed_to_owner() {
    let fixture = fixture(true);
    let update = Statement::Update(Update {
        relations: vec![MainRelation::new("X", "login", Operand::string("robert"))],
        select: user(42),
    });
    execute(&fixture, &update);
    assert_eq!(
        fixture.ldap.entity(42).unwrap().attributes["login"],
        json!("robert")
    );
    assert!(fixture.system.calls().is_empty());
}

// =============================================================================
// Rejections
// =============================================================================

/// Assigning `eid` is rejected before any source is contacted.
#[test]
fn test_readonly_assignment_rejected() {
    let fixture = fixture(true);
    let update = Statement::Update(Update {
        relations: vec![MainRelation::new("X", "eid", Operand::int(5))],
        select: user(42),
    });
    let err = QueryPlanner::new(&fixture.repo, PlannerConfig::new())
        .build_plan(&update)
        .unwrap_err();
    assert_eq!(err.code(), "AERO_PLAN_READONLY_RELATION");
    assert!(fixture.system.calls().is_empty());
    assert!(fixture.ldap.calls().is_empty());
}

/// With a read-only mirror as system source, no source can take new users.
#[test]
fn test_unwritable_entity_rejected() {
    let mirror = MemorySource::new(
        SourceDescriptor::new("system").with_entity("User", false),
        schema(),
    );
    let repo = Repository::new(schema(), Rc::new(mirror));
    let insert = Statement::Insert(Insert {
        entities: vec![MainEntity::new("User", "X")],
        relations: Vec::new(),
        select: None,
    });
    let err = QueryPlanner::new(&repo, PlannerConfig::new())
        .build_plan(&insert)
        .unwrap_err();
    assert_eq!(err.code(), "AERO_PLAN_UNSUPPORTED_WRITE");
}
