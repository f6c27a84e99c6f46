//! Repository configuration file
//!
//! ```json
//! {
//!   "schema": { "relations": { "login": { "final": true } } },
//!   "sources": [
//!     { "uri": "system", "all_types": true,
//!       "data": { "entities": [ { "eid": 10, "etype": "Group" } ] } },
//!     { "uri": "ldap", "entities": { "User": false }, "relations": { "login": false } }
//!   ],
//!   "eids": { "7": "ldap" }
//! }
//! ```
//!
//! Every source is served by an in-memory store seeded from `data`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::observability::{log_event_with_fields, Event};
use crate::planner::PlannerConfig;
use crate::schema::Schema;
use crate::source::{Entity, MemorySource, Repository, SourceDescriptor, SourceId};

use super::errors::{CliError, CliResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub eid: i64,
    pub etype: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredRelation {
    pub subject: i64,
    pub rtype: String,
    pub object: i64,
}

/// Seed data of one in-memory source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceData {
    #[serde(default)]
    pub entities: Vec<StoredEntity>,
    #[serde(default)]
    pub relations: Vec<StoredRelation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(flatten)]
    pub descriptor: SourceDescriptor,
    #[serde(default)]
    pub data: SourceData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub schema: Schema,
    pub sources: Vec<SourceConfig>,
    /// Eid -> uri of the owning source, on top of the seeded entities
    #[serde(default)]
    pub eids: BTreeMap<i64, String>,
    #[serde(default)]
    pub planner: PlannerConfig,
}

impl RepositoryConfig {
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> CliResult<Self> {
        let config: RepositoryConfig = serde_json::from_str(content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> CliResult<()> {
        let systems = self
            .sources
            .iter()
            .filter(|s| s.descriptor.all_types)
            .count();
        if systems != 1 {
            return Err(CliError::config_error(format!(
                "exactly one source must support every type, found {}",
                systems
            )));
        }

        let mut uris = BTreeSet::new();
        for source in &self.sources {
            if source.descriptor.uri.is_empty() {
                return Err(CliError::config_error("source uri must not be empty"));
            }
            if !uris.insert(source.descriptor.uri.as_str()) {
                return Err(CliError::config_error(format!(
                    "duplicate source uri '{}'",
                    source.descriptor.uri
                )));
            }
        }

        for (eid, uri) in &self.eids {
            if !uris.contains(uri.as_str()) {
                return Err(CliError::config_error(format!(
                    "eid {} owned by unknown source '{}'",
                    eid, uri
                )));
            }
        }
        Ok(())
    }

    /// Builds the repository, the system source first
    pub fn build_repository(&self) -> CliResult<Repository> {
        let (system, others): (Vec<&SourceConfig>, Vec<&SourceConfig>) =
            self.sources.iter().partition(|s| s.descriptor.all_types);
        let system = system
            .first()
            .ok_or_else(|| CliError::config_error("no system source"))?;

        let mut repo = Repository::new(self.schema.clone(), Rc::new(self.memory_source(system)));
        register_data(&repo, SourceId::SYSTEM, &system.data);
        for source in others {
            let id = repo.add_source(Rc::new(self.memory_source(source)));
            register_data(&repo, id, &source.data);
        }

        for (eid, uri) in &self.eids {
            let id = repo
                .source_by_uri(uri)
                .ok_or_else(|| CliError::config_error(format!("unknown source '{}'", uri)))?;
            repo.register_eid(*eid, id);
        }
        Ok(repo)
    }

    fn memory_source(&self, config: &SourceConfig) -> MemorySource {
        let source = MemorySource::new(config.descriptor.clone(), self.schema.clone());
        for stored in &config.data.entities {
            source.insert_entity(
                stored.eid,
                Entity {
                    etype: stored.etype.clone(),
                    attributes: stored.attributes.clone(),
                },
            );
        }
        for rel in &config.data.relations {
            source.insert_relation(rel.subject, &rel.rtype, rel.object);
        }
        source
    }
}

fn register_data(repo: &Repository, id: SourceId, data: &SourceData) {
    for stored in &data.entities {
        repo.register_eid(stored.eid, id);
    }
}

/// Loads, validates and builds the repository described by `path`
pub fn load_repository(path: &Path, verbose: bool) -> CliResult<(RepositoryConfig, Repository)> {
    let config = RepositoryConfig::load(path)?;
    let repo = config.build_repository()?;
    if verbose {
        log_event_with_fields(
            Event::ConfigLoaded,
            &[
                ("path", &path.display().to_string()),
                ("sources", &repo.len().to_string()),
            ],
        );
    }
    Ok((config, repo))
}
