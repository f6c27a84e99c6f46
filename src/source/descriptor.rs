//! Source descriptors
//!
//! Immutable description of what a source can serve. Loaded from the
//! repository configuration or built in code.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a source in the repository; `SourceId(0)` is the system source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(pub usize);

impl SourceId {
    pub const SYSTEM: SourceId = SourceId(0);

    pub fn is_system(&self) -> bool {
        *self == Self::SYSTEM
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Supported tables of a source, with their write flag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub uri: String,
    /// Supports every entity type and relation (the system source)
    #[serde(default)]
    pub all_types: bool,
    /// Entity type -> writable
    #[serde(default)]
    pub entities: BTreeMap<String, bool>,
    /// Relation type -> writable
    #[serde(default)]
    pub relations: BTreeMap<String, bool>,
    #[serde(default)]
    pub cross_relations: BTreeSet<String>,
    #[serde(default)]
    pub dont_cross_relations: BTreeSet<String>,
}

impl SourceDescriptor {
    /// Descriptor of the authoritative system source
    pub fn system() -> Self {
        Self {
            uri: "system".to_string(),
            all_types: true,
            ..Self::default()
        }
    }

    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn with_entity(mut self, etype: impl Into<String>, write: bool) -> Self {
        self.entities.insert(etype.into(), write);
        self
    }

    pub fn with_relation(mut self, rtype: impl Into<String>, write: bool) -> Self {
        self.relations.insert(rtype.into(), write);
        self
    }

    pub fn with_cross_relation(mut self, rtype: impl Into<String>) -> Self {
        self.cross_relations.insert(rtype.into());
        self
    }

    pub fn with_dont_cross_relation(mut self, rtype: impl Into<String>) -> Self {
        self.dont_cross_relations.insert(rtype.into());
        self
    }

    pub fn support_entity(&self, etype: &str, write: bool) -> bool {
        if self.all_types {
            return true;
        }
        match self.entities.get(etype) {
            Some(writable) => !write || *writable,
            None => false,
        }
    }

    /// `is`, `eid` and `identity` are readable wherever entities are
    pub fn support_relation(&self, rtype: &str, write: bool) -> bool {
        if self.all_types {
            return true;
        }
        if matches!(rtype, "is" | "eid" | "identity") {
            return !write && !self.entities.is_empty();
        }
        match self.relations.get(rtype) {
            Some(writable) => !write || *writable,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_supports_everything() {
        let system = SourceDescriptor::system();
        assert!(system.support_entity("Anything", true));
        assert!(system.support_relation("anything", true));
    }

    #[test]
    fn test_partial_source_support() {
        let ldap = SourceDescriptor::new("ldap")
            .with_entity("User", false)
            .with_relation("login", false);
        assert!(ldap.support_entity("User", false));
        assert!(!ldap.support_entity("User", true));
        assert!(!ldap.support_entity("Group", false));
        assert!(ldap.support_relation("is", false));
        assert!(ldap.support_relation("login", false));
        assert!(!ldap.support_relation("in_group", false));
        assert!(!ldap.support_relation("eid", true));
    }
}
