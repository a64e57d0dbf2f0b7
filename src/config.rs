//! Datasource configuration loading
//!
//! Parses the `datasources.yaml` document that names each physical backend,
//! its connection settings, and the logical databases it hosts. Connection
//! values support `${ENV_VAR:default}` placeholders so credentials stay out
//! of the file.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Top-level datasources document
#[derive(Debug, Clone, Deserialize)]
pub struct DatasourcesConfig {
    #[serde(default)]
    pub datasources: BTreeMap<String, DatasourceConfig>,
}

/// One named physical backend
#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceConfig {
    /// Backend type tag; selects the implementation at registry load time
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    /// Logical databases hosted by this backend
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

fn default_enabled() -> bool {
    true
}

/// Connection settings with pool bounds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    /// Pool acquire timeout in seconds
    pub connect_timeout: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: "5432".to_string(),
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            min_pool_size: 2,
            max_pool_size: 10,
            connect_timeout: 10,
        }
    }
}

impl ConnectionConfig {
    /// Resolve `${ENV_VAR}` / `${ENV_VAR:default}` placeholders in every
    /// string field.
    pub fn resolve_env(&mut self) {
        for field in [
            &mut self.host,
            &mut self.port,
            &mut self.database,
            &mut self.user,
            &mut self.password,
        ] {
            *field = resolve_placeholder(field);
        }
    }

    /// Build a PostgreSQL connection URL
    pub fn connection_url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

fn resolve_placeholder(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return value.to_string();
    };

    match inner.split_once(':') {
        Some((var, default)) => std::env::var(var).unwrap_or_else(|_| default.to_string()),
        None => std::env::var(inner).unwrap_or_default(),
    }
}

impl DatasourcesConfig {
    /// Load and parse the datasources document, resolving env placeholders
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!(
                "cannot read datasources config {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut config: DatasourcesConfig = serde_yaml::from_str(text)?;
        for datasource in config.datasources.values_mut() {
            datasource.connection.resolve_env();
        }
        Ok(config)
    }
}
