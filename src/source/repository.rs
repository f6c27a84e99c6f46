//! Repository of sources and planning session
//!
//! The repository is immutable during planning except for eid bookkeeping,
//! which only mutation steps touch.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use uuid::Uuid;

use crate::schema::Schema;

use super::descriptor::SourceId;
use super::Source;

pub struct Repository {
    schema: Schema,
    sources: Vec<Rc<dyn Source>>,
    eid_owner: RefCell<BTreeMap<i64, SourceId>>,
    next_eid: Cell<i64>,
}

impl Repository {
    /// Creates a repository around its authoritative system source
    pub fn new(schema: Schema, system: Rc<dyn Source>) -> Self {
        Self {
            schema,
            sources: vec![system],
            eid_owner: RefCell::new(BTreeMap::new()),
            next_eid: Cell::new(1),
        }
    }

    /// Registers an additional source
    pub fn add_source(&mut self, source: Rc<dyn Source>) -> SourceId {
        self.sources.push(source);
        SourceId(self.sources.len() - 1)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn system(&self) -> SourceId {
        SourceId::SYSTEM
    }

    pub fn source(&self, id: SourceId) -> &dyn Source {
        self.sources[id.0].as_ref()
    }

    pub fn uri(&self, id: SourceId) -> &str {
        self.source(id).uri()
    }

    pub fn source_ids(&self) -> impl Iterator<Item = SourceId> + '_ {
        (0..self.sources.len()).map(SourceId)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn source_by_uri(&self, uri: &str) -> Option<SourceId> {
        self.source_ids().find(|id| self.uri(*id) == uri)
    }

    /// Records that `eid` lives in `source`
    pub fn register_eid(&self, eid: i64, source: SourceId) {
        self.eid_owner.borrow_mut().insert(eid, source);
        if eid >= self.next_eid.get() {
            self.next_eid.set(eid + 1);
        }
    }

    pub fn source_from_eid(&self, eid: i64) -> Option<SourceId> {
        self.eid_owner.borrow().get(&eid).copied()
    }

    pub fn forget_eid(&self, eid: i64) {
        self.eid_owner.borrow_mut().remove(&eid);
    }

    /// Next free eid, unique across all sources
    pub fn allocate_eid(&self) -> i64 {
        let eid = self.next_eid.get();
        self.next_eid.set(eid + 1);
        eid
    }

    /// Sources able to read relations of type `rtype`
    pub fn rel_type_sources(&self, rtype: &str) -> BTreeSet<SourceId> {
        self.source_ids()
            .filter(|id| self.source(*id).support_relation(rtype, false))
            .collect()
    }

    /// Whether endpoints of `rtype` may come from different sources
    ///
    /// Relations only the system source stores can link entities of any
    /// source, unless a source explicitly refuses the crossing.
    pub fn can_cross_relation(&self, rtype: &str) -> bool {
        let sources: Vec<SourceId> = self.source_ids().collect();
        if sources
            .iter()
            .any(|id| self.source(*id).dont_cross_relations().contains(rtype))
        {
            return false;
        }
        if sources
            .iter()
            .any(|id| self.source(*id).cross_relations().contains(rtype))
        {
            return true;
        }
        let supporting = self.rel_type_sources(rtype);
        supporting.len() == 1 && supporting.contains(&SourceId::SYSTEM)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let uris: Vec<&str> = self.source_ids().map(|id| self.uri(id)).collect();
        f.debug_struct("Repository").field("sources", &uris).finish()
    }
}

/// Planning/execution context handed to sources
#[derive(Debug, Clone, Copy)]
pub struct Session<'a> {
    pub repo: &'a Repository,
    pub id: Uuid,
}

impl<'a> Session<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            id: Uuid::new_v4(),
        }
    }

    pub fn source_from_eid(&self, eid: i64) -> Option<SourceId> {
        self.repo.source_from_eid(eid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, SourceDescriptor};

    fn repo() -> Repository {
        let schema = Schema::new();
        let system = Rc::new(MemorySource::new(SourceDescriptor::system(), schema.clone()));
        let mut repo = Repository::new(schema.clone(), system);
        let ldap = SourceDescriptor::new("ldap")
            .with_entity("User", false)
            .with_relation("login", false)
            .with_dont_cross_relation("owned_by");
        repo.add_source(Rc::new(MemorySource::new(ldap, schema)));
        repo
    }

    #[test]
    fn test_rel_type_sources() {
        let repo = repo();
        let login: Vec<_> = repo.rel_type_sources("login").into_iter().collect();
        assert_eq!(login, vec![SourceId(0), SourceId(1)]);
        let group: Vec<_> = repo.rel_type_sources("in_group").into_iter().collect();
        assert_eq!(group, vec![SourceId(0)]);
    }

    #[test]
    fn test_can_cross_relation() {
        let repo = repo();
        assert!(repo.can_cross_relation("in_group"));
        assert!(!repo.can_cross_relation("login"));
        assert!(!repo.can_cross_relation("owned_by"));
    }

    #[test]
    fn test_declared_cross_relation() {
        let schema = Schema::new();
        let system = Rc::new(MemorySource::new(SourceDescriptor::system(), schema.clone()));
        let mut repo = Repository::new(schema.clone(), system);
        let cards = SourceDescriptor::new("cards")
            .with_entity("Card", false)
            .with_relation("see_also", false)
            .with_cross_relation("see_also");
        repo.add_source(Rc::new(MemorySource::new(cards, schema)));
        assert!(repo.can_cross_relation("see_also"));
    }

    #[test]
    fn test_eid_allocation_skips_registered() {
        let repo = repo();
        repo.register_eid(10, SourceId(1));
        assert_eq!(repo.source_from_eid(10), Some(SourceId(1)));
        assert_eq!(repo.allocate_eid(), 11);
        assert_eq!(repo.source_from_eid(99), None);
    }
}
