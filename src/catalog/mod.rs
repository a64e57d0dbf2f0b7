//! Data-source catalog and schema documents
//!
//! Read-only inputs describing what data exists: a top-level catalog listing
//! each logical database (id, display name, description, owning datasource)
//! and one schema document per database (schemas, tables, columns, foreign
//! keys). The engine loads these once at startup and renders them into the
//! prompt blocks the LLM stages consume; it never validates or mutates them.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Top-level catalog document (`summary.yaml` in the knowledge directory)
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub data_sources: Vec<CatalogEntry>,
}

/// One logical database as presented to the validation stage
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Name of the physical datasource hosting this database
    pub datasource: String,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Render the catalog for the validation prompt:
    /// `- {name} ({id}): {description}` per line.
    pub fn format_data_sources(&self) -> String {
        self.data_sources
            .iter()
            .map(|entry| format!("- {} ({}): {}", entry.name, entry.id, entry.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Per-database schema document: databases -> schemas -> tables -> columns
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseSchema>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSchema {
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaInfo {
    #[serde(default)]
    pub tables: BTreeMap<String, TableInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    pub foreign_key: Option<ForeignKeyRef>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

/// All loaded schema documents, keyed by logical database name
#[derive(Debug, Default)]
pub struct SchemaStore {
    databases: BTreeMap<String, DatabaseSchema>,
}

impl SchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.yaml` schema document in a directory. The catalog file
    /// itself (`summary.yaml`) is skipped.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut store = Self::new();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            EngineError::Configuration(format!("cannot read schema dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            let is_summary = path
                .file_stem()
                .is_some_and(|stem| stem == "summary");
            if !is_yaml || is_summary {
                continue;
            }

            match std::fs::read_to_string(&path) {
                Ok(text) => store.add_document_yaml(&text)?,
                Err(e) => {
                    tracing::error!("Failed to load schema from {}: {e}", path.display());
                }
            }
        }

        Ok(store)
    }

    pub fn add_document_yaml(&mut self, text: &str) -> Result<()> {
        let document: SchemaDocument = serde_yaml::from_str(text)?;
        for (name, schema) in document.databases {
            self.databases.insert(name, schema);
        }
        Ok(())
    }

    pub fn contains(&self, database: &str) -> bool {
        self.databases.contains_key(database)
    }

    /// Render the schema block for the SQL generation and error analysis
    /// prompts. Unknown databases get a placeholder section rather than an
    /// error so one missing document does not sink the whole step.
    pub fn format_for_databases(&self, databases: &[String]) -> String {
        let mut lines = Vec::new();

        for db_name in databases {
            let Some(db_info) = self.databases.get(db_name) else {
                lines.push(format!("### {db_name}\n(Schema information not available)\n"));
                continue;
            };

            lines.push(format!("### {db_name}\n"));

            for (schema_name, schema_info) in &db_info.schemas {
                for (table_name, table_info) in &schema_info.tables {
                    lines.push(format!("\n**Table: {db_name}.{schema_name}.{table_name}**"));
                    let description = if table_info.description.is_empty() {
                        "N/A"
                    } else {
                        &table_info.description
                    };
                    lines.push(format!("Description: {description}"));
                    lines.push("Columns:".to_string());

                    for col in &table_info.columns {
                        let nullable = if col.nullable { "NULL" } else { "NOT NULL" };
                        lines.push(format!(
                            "  - {} ({}, {}): {}",
                            col.name, col.data_type, nullable, col.description
                        ));
                        if let Some(fk) = &col.foreign_key {
                            lines.push(format!("    FK -> {}.{}", fk.table, fk.column));
                        }
                    }
                }
            }
        }

        lines.join("\n")
    }
}
