//! Datasource abstraction
//!
//! A datasource is one physical backend (connection pool + driver) hosting
//! one or more logical databases. Backends implement the [`DataSource`]
//! capability trait; new backend kinds are added as new implementations
//! selected by the `type` tag in the datasource config.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

pub mod postgres;
pub mod registry;

pub use postgres::PostgresDataSource;
pub use registry::{DatasourceRegistry, DatasourceValidation};

/// One result row: column name -> JSON value, in statement column order
/// (serde_json's `preserve_order` keeps the map insertion-ordered)
pub type Row = serde_json::Map<String, Value>;

/// Result of a SQL execution. Execution never returns `Err`; every failure
/// surfaces here as `success = false` with a human-readable message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub success: bool,
    pub data: Option<Vec<Row>>,
    pub columns: Option<Vec<String>>,
    pub row_count: usize,
    pub error: Option<String>,
    pub elapsed_ms: Option<u64>,
}

impl QueryResult {
    pub fn rows(data: Vec<Row>, columns: Vec<String>, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            row_count: data.len(),
            data: Some(data),
            columns: Some(columns),
            error: None,
            elapsed_ms: Some(elapsed_ms),
        }
    }

    /// Successful statement that produced no row set (INSERT/UPDATE/DELETE)
    pub fn affected(row_count: usize, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            row_count,
            elapsed_ms: Some(elapsed_ms),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn failed_after(error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            elapsed_ms: Some(elapsed_ms),
            ..Self::failed(error)
        }
    }
}

/// Capability interface for a physical backend
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Datasource name as registered in the config
    fn name(&self) -> &str;

    /// Logical databases hosted by this backend
    fn databases(&self) -> &[String];

    fn supports_database(&self, database: &str) -> bool {
        self.databases().iter().any(|db| db == database)
    }

    /// Establish the connection pool
    async fn connect(&self) -> Result<()>;

    /// Close the connection pool
    async fn disconnect(&self);

    /// Check whether the backend is reachable
    async fn test_connection(&self) -> bool;

    /// Execute one statement scoped to a logical database. Optional params
    /// bind positionally as `$1..$n`.
    async fn execute_query(
        &self,
        sql: &str,
        database: &str,
        params: Option<&[Value]>,
    ) -> QueryResult;

    /// Introspect live table/column structure for a logical database
    async fn get_schema_info(&self, database: &str) -> Result<Value>;
}
