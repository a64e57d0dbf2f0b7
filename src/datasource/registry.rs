//! Datasource registry: logical-database routing and validation
//!
//! Owns every physical datasource handle and the mapping from logical
//! database names to the datasource hosting them. The single-datasource
//! invariant for a plan is enforced here, before any SQL generation is
//! attempted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::DatasourcesConfig;
use crate::datasource::{DataSource, PostgresDataSource, QueryResult};
use crate::error::{EngineError, Result};

/// Outcome of checking that a set of logical databases resolves to exactly
/// one datasource
#[derive(Debug, Clone, Serialize)]
pub struct DatasourceValidation {
    pub valid: bool,
    /// The single datasource name, when valid
    pub datasource: Option<String>,
    pub error: Option<String>,
    /// Per-database mapping resolved so far
    pub database_sources: BTreeMap<String, String>,
}

impl DatasourceValidation {
    fn invalid(error: impl Into<String>, database_sources: BTreeMap<String, String>) -> Self {
        Self {
            valid: false,
            datasource: None,
            error: Some(error.into()),
            database_sources,
        }
    }
}

#[derive(Default)]
pub struct DatasourceRegistry {
    datasources: HashMap<String, Arc<dyn DataSource>>,
    /// Logical database name -> owning datasource name
    database_to_datasource: HashMap<String, String>,
}

impl DatasourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from config, instantiating one backend per enabled
    /// entry. Unknown `type` tags are skipped with a warning; a logical
    /// database claimed by two datasources is a configuration error.
    pub fn from_config(config: &DatasourcesConfig) -> Result<Self> {
        let mut registry = Self::new();

        for (name, datasource_config) in &config.datasources {
            if !datasource_config.enabled {
                info!("Skipping disabled datasource: {name}");
                continue;
            }

            match datasource_config.kind.to_ascii_lowercase().as_str() {
                "postgresql" => {
                    let datasource = PostgresDataSource::new(name.clone(), datasource_config);
                    registry.register(Arc::new(datasource))?;
                    info!("Registered PostgreSQL datasource: {name}");
                }
                other => {
                    warn!("Unknown datasource type '{other}' for: {name}");
                }
            }
        }

        info!(
            "Loaded {} datasources and {} database mappings",
            registry.datasources.len(),
            registry.database_to_datasource.len()
        );

        Ok(registry)
    }

    /// Register a datasource handle and claim its logical databases
    pub fn register(&mut self, datasource: Arc<dyn DataSource>) -> Result<()> {
        let name = datasource.name().to_string();

        if self.datasources.contains_key(&name) {
            return Err(EngineError::Configuration(format!(
                "datasource '{name}' registered twice"
            )));
        }

        for database in datasource.databases() {
            if let Some(existing) = self.database_to_datasource.get(database) {
                return Err(EngineError::Configuration(format!(
                    "logical database '{database}' claimed by both '{existing}' and '{name}'"
                )));
            }
            self.database_to_datasource
                .insert(database.clone(), name.clone());
        }

        self.datasources.insert(name, datasource);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.datasources.get(name).cloned()
    }

    /// Find the datasource hosting a logical database
    pub fn resolve(&self, database: &str) -> Option<Arc<dyn DataSource>> {
        let name = self.database_to_datasource.get(database)?;
        self.datasources.get(name).cloned()
    }

    /// Check that every named database is known and all map to the same
    /// datasource. Runs once per plan, before SQL generation.
    pub fn validate(&self, databases: &[String]) -> DatasourceValidation {
        if databases.is_empty() {
            return DatasourceValidation::invalid("No databases specified", BTreeMap::new());
        }

        let mut database_sources = BTreeMap::new();
        let mut unique: BTreeSet<String> = BTreeSet::new();

        for db in databases {
            let Some(datasource_name) = self.database_to_datasource.get(db) else {
                return DatasourceValidation::invalid(
                    format!("Database '{db}' not found in any datasource"),
                    database_sources,
                );
            };

            if !self.datasources.contains_key(datasource_name) {
                return DatasourceValidation::invalid(
                    format!("Datasource '{datasource_name}' for database '{db}' is not available"),
                    database_sources,
                );
            }

            database_sources.insert(db.clone(), datasource_name.clone());
            unique.insert(datasource_name.clone());
        }

        if unique.len() > 1 {
            let span = unique.iter().cloned().collect::<Vec<_>>().join(", ");
            return DatasourceValidation::invalid(
                format!("Cannot query across different datasources. Databases span: {span}"),
                database_sources,
            );
        }

        let datasource = unique.into_iter().next();
        DatasourceValidation {
            valid: true,
            datasource,
            error: None,
            database_sources,
        }
    }

    /// Execute a statement against the datasource owning `database`
    pub async fn execute(
        &self,
        sql: &str,
        database: &str,
        params: Option<&[Value]>,
    ) -> QueryResult {
        let Some(datasource) = self.resolve(database) else {
            return QueryResult::failed(format!(
                "No datasource found for database '{database}'"
            ));
        };

        datasource.execute_query(sql, database, params).await
    }

    /// Connect every registered datasource; returns per-datasource success
    pub async fn connect_all(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for (name, datasource) in &self.datasources {
            match datasource.connect().await {
                Ok(()) => {
                    info!("Successfully connected to: {name}");
                    results.insert(name.clone(), true);
                }
                Err(e) => {
                    error!("Failed to connect to {name}: {e}");
                    results.insert(name.clone(), false);
                }
            }
        }
        results
    }

    pub async fn disconnect_all(&self) {
        for datasource in self.datasources.values() {
            datasource.disconnect().await;
        }
    }
}
