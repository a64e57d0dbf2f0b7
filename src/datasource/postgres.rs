//! PostgreSQL datasource backed by a sqlx connection pool
//!
//! Each logical database maps onto a schema in the physical database;
//! statements are scoped by setting the connection's search path before
//! execution. One pooled connection is held for the duration of a single
//! statement and released on every exit path.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row as SqlxRow, TypeInfo};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::{ConnectionConfig, DatasourceConfig};
use crate::datasource::{DataSource, QueryResult, Row};
use crate::error::{EngineError, Result};

pub struct PostgresDataSource {
    name: String,
    databases: Vec<String>,
    connection: ConnectionConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresDataSource {
    pub fn new(name: impl Into<String>, config: &DatasourceConfig) -> Self {
        Self {
            name: name.into(),
            databases: config.databases.clone(),
            connection: config.connection.clone(),
            pool: RwLock::new(None),
        }
    }

    /// Logical database names double as schema names in `SET search_path`,
    /// so anything that is not a plain identifier is rejected outright.
    fn valid_schema_name(database: &str) -> bool {
        !database.is_empty()
            && database
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !database.starts_with(|c: char| c.is_ascii_digit())
    }

    fn is_row_returning(sql: &str) -> bool {
        let head = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        matches!(head.as_str(), "select" | "with" | "show" | "explain" | "values")
    }

    fn bind_params<'q>(
        mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        params: &'q [Value],
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        for param in params {
            query = match param {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
                Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
                Value::String(s) => query.bind(s.as_str()),
                other => query.bind(other.clone()),
            };
        }
        query
    }

    fn row_to_json(row: &PgRow) -> Row {
        let mut map = serde_json::Map::new();

        for column in row.columns() {
            let name = column.name();
            let type_name = column.type_info().name();

            let value: Option<Value> = match type_name {
                "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => row
                    .try_get::<Option<String>, _>(name)
                    .ok()
                    .flatten()
                    .map(|s| json!(s)),
                "INT2" => row
                    .try_get::<Option<i16>, _>(name)
                    .ok()
                    .flatten()
                    .map(|i| json!(i)),
                "INT4" => row
                    .try_get::<Option<i32>, _>(name)
                    .ok()
                    .flatten()
                    .map(|i| json!(i)),
                "INT8" => row
                    .try_get::<Option<i64>, _>(name)
                    .ok()
                    .flatten()
                    .map(|i| json!(i)),
                "FLOAT4" | "FLOAT8" => row
                    .try_get::<Option<f64>, _>(name)
                    .ok()
                    .flatten()
                    .map(|f| json!(f)),
                "NUMERIC" => row
                    .try_get::<Option<rust_decimal::Decimal>, _>(name)
                    .ok()
                    .flatten()
                    .map(|d| json!(d.to_string())),
                "BOOL" => row
                    .try_get::<Option<bool>, _>(name)
                    .ok()
                    .flatten()
                    .map(|b| json!(b)),
                "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(name).ok().flatten(),
                "TIMESTAMPTZ" => row
                    .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name)
                    .ok()
                    .flatten()
                    .map(|dt| json!(dt.to_rfc3339())),
                "TIMESTAMP" => row
                    .try_get::<Option<chrono::NaiveDateTime>, _>(name)
                    .ok()
                    .flatten()
                    .map(|dt| json!(dt.to_string())),
                "DATE" => row
                    .try_get::<Option<chrono::NaiveDate>, _>(name)
                    .ok()
                    .flatten()
                    .map(|d| json!(d.to_string())),
                _ => row
                    .try_get::<Option<String>, _>(name)
                    .ok()
                    .flatten()
                    .map(|s| json!(s)),
            };

            map.insert(name.to_string(), value.unwrap_or(Value::Null));
        }

        map
    }

    fn driver_error(e: &sqlx::Error) -> String {
        match e {
            sqlx::Error::Database(db) => format!("PostgreSQL error: {}", db.message()),
            other => format!("Execution error: {other}"),
        }
    }

    /// Group `information_schema.columns` rows into the per-table schema
    /// document shape.
    fn schema_info_from_rows(database: &str, rows: Vec<Row>) -> Value {
        let mut tables = serde_json::Map::new();
        for row in rows {
            let table = row
                .get("table_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let column = json!({
                "name": row.get("column_name").cloned().unwrap_or(Value::Null),
                "type": row.get("data_type").cloned().unwrap_or(Value::Null),
                "nullable": row.get("is_nullable").and_then(Value::as_str) == Some("YES"),
            });
            if let Some(cols) = tables
                .entry(table)
                .or_insert_with(|| json!({ "columns": [] }))
                .get_mut("columns")
                .and_then(Value::as_array_mut)
            {
                cols.push(column);
            }
        }

        json!({ "schema": database, "tables": tables })
    }
}

#[async_trait]
impl DataSource for PostgresDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn databases(&self) -> &[String] {
        &self.databases
    }

    async fn connect(&self) -> Result<()> {
        let url = self.connection.connection_url();
        let pool = PgPoolOptions::new()
            .min_connections(self.connection.min_pool_size)
            .max_connections(self.connection.max_pool_size)
            .acquire_timeout(self.connection.acquire_timeout())
            .connect(&url)
            .await
            .map_err(|e| {
                EngineError::Configuration(format!(
                    "failed to connect datasource '{}': {e}",
                    self.name
                ))
            })?;

        info!(
            "Connected to PostgreSQL datasource '{}' (pool: {}-{})",
            self.name, self.connection.min_pool_size, self.connection.max_pool_size
        );

        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!("Disconnected from PostgreSQL datasource '{}'", self.name);
        }
    }

    async fn test_connection(&self) -> bool {
        let guard = self.pool.read().await;
        let Some(pool) = guard.as_ref() else {
            return false;
        };

        match sqlx::query("SELECT 1").fetch_one(pool).await {
            Ok(_) => true,
            Err(e) => {
                error!("Connection test failed for '{}': {e}", self.name);
                false
            }
        }
    }

    async fn execute_query(
        &self,
        sql: &str,
        database: &str,
        params: Option<&[Value]>,
    ) -> QueryResult {
        let guard = self.pool.read().await;
        let Some(pool) = guard.as_ref() else {
            return QueryResult::failed("Data source not connected. Call connect() first.");
        };

        if !self.supports_database(database) {
            return QueryResult::failed(format!(
                "Database '{database}' not supported by datasource '{}'",
                self.name
            ));
        }

        if !Self::valid_schema_name(database) {
            return QueryResult::failed(format!("Invalid database name '{database}'"));
        }

        let start = Instant::now();
        let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                let msg = Self::driver_error(&e);
                warn!("Connection acquire failed in '{}': {msg}", self.name);
                return QueryResult::failed_after(msg, elapsed(start));
            }
        };

        // Scope the statement to the logical database's namespace
        let search_path = format!("SET search_path TO {database}, public");
        if let Err(e) = sqlx::query(&search_path).execute(&mut *conn).await {
            let msg = Self::driver_error(&e);
            error!("Failed to set search path in '{}': {msg}", self.name);
            return QueryResult::failed_after(msg, elapsed(start));
        }

        let params = params.unwrap_or_default();

        if Self::is_row_returning(sql) {
            let query = Self::bind_params(sqlx::query(sql), params);
            match query.fetch_all(&mut *conn).await {
                Ok(rows) => {
                    let columns: Vec<String> = rows
                        .first()
                        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
                        .unwrap_or_default();
                    let data: Vec<Row> = rows.iter().map(Self::row_to_json).collect();
                    QueryResult::rows(data, columns, elapsed(start))
                }
                Err(e) => {
                    let msg = Self::driver_error(&e);
                    error!("Query execution failed in '{}': {msg}", self.name);
                    QueryResult::failed_after(msg, elapsed(start))
                }
            }
        } else {
            let query = Self::bind_params(sqlx::query(sql), params);
            match query.execute(&mut *conn).await {
                Ok(result) => QueryResult::affected(result.rows_affected() as usize, elapsed(start)),
                Err(e) => {
                    let msg = Self::driver_error(&e);
                    error!("Statement execution failed in '{}': {msg}", self.name);
                    QueryResult::failed_after(msg, elapsed(start))
                }
            }
        }
    }

    async fn get_schema_info(&self, database: &str) -> Result<Value> {
        if !self.supports_database(database) {
            return Err(EngineError::DatasourceResolution(format!(
                "Database '{database}' not supported by datasource '{}'",
                self.name
            )));
        }

        let sql = "SELECT table_name, column_name, data_type, is_nullable \
                   FROM information_schema.columns \
                   WHERE table_schema = $1 \
                   ORDER BY table_name, ordinal_position";

        let params = [json!(database)];
        let result = self.execute_query(sql, database, Some(&params)).await;

        if !result.success {
            return Err(EngineError::Unexpected(
                result.error.unwrap_or_else(|| "schema introspection failed".to_string()),
            ));
        }

        Ok(Self::schema_info_from_rows(
            database,
            result.data.unwrap_or_default(),
        ))
    }
}
