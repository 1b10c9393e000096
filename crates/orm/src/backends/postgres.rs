//! PostgreSQL Backend Implementation
//!
//! PostgreSQL-specific implementation of the backend traits using sqlx as the
//! underlying driver. Each query runner holds one pooled connection for its
//! whole lifetime so transaction state stays on a single session.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Postgres, Row, TypeInfo, ValueRef};
use tracing::{debug, warn};

use super::core::*;
use super::sql::SqlDialect;
use super::DatabaseBackendType;
use crate::config::PoolOptions;
use crate::error::{OrmError, OrmResult};
use crate::schema::{ColumnDefinition, LogicalType, TableDefinition};
use crate::transactions::savepoints::step_sql;
use crate::transactions::{TransactionCoordinator, TransactionStep};

const DIALECT: SqlDialect = SqlDialect::PostgreSQL;

const CAPABILITIES: DriverCapabilities = DriverCapabilities {
    transaction_support: TransactionSupport::Nested,
    schemaless: false,
    supports_returning: true,
};

/// PostgreSQL database driver
pub struct PostgresDriver {
    database_url: String,
    pool_options: PoolOptions,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresDriver {
    /// Create a driver for the given URL; the pool is opened by `connect`
    pub fn new(database_url: &str, pool_options: PoolOptions) -> OrmResult<Self> {
        validate_database_url(database_url)?;
        Ok(Self {
            database_url: database_url.to_string(),
            pool_options,
            pool: RwLock::new(None),
        })
    }

    fn pool(&self) -> OrmResult<PgPool> {
        self.pool
            .read()
            .map_err(|_| OrmError::Connection("PostgreSQL pool lock poisoned".to_string()))?
            .clone()
            .ok_or(OrmError::NotConnected)
    }
}

/// Check the URL scheme and that a database name is present
pub fn validate_database_url(url: &str) -> OrmResult<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| OrmError::Configuration(format!("Invalid database URL: {}", e)))?;

    if parsed.scheme() != "postgres" && parsed.scheme() != "postgresql" {
        return Err(OrmError::Configuration(
            "Invalid PostgreSQL URL scheme".to_string(),
        ));
    }
    if parsed.host_str().is_none() {
        return Err(OrmError::Configuration(
            "Missing host in database URL".to_string(),
        ));
    }
    if parsed.path().trim_start_matches('/').is_empty() {
        return Err(OrmError::Configuration(
            "Missing database name in URL".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    async fn connect(&self) -> OrmResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.pool_options.max_connections)
            .min_connections(self.pool_options.min_connections)
            .acquire_timeout(Duration::from_secs(self.pool_options.acquire_timeout_seconds))
            .connect(&self.database_url)
            .await
            .map_err(|e| OrmError::Connection(format!("Failed to create PostgreSQL pool: {}", e)))?;

        *self
            .pool
            .write()
            .map_err(|_| OrmError::Connection("PostgreSQL pool lock poisoned".to_string()))? = Some(pool);
        debug!("PostgreSQL pool connected");
        Ok(())
    }

    async fn disconnect(&self) -> OrmResult<()> {
        let pool = self
            .pool
            .write()
            .map_err(|_| OrmError::Connection("PostgreSQL pool lock poisoned".to_string()))?
            .take();
        if let Some(pool) = pool {
            pool.close().await;
            debug!("PostgreSQL pool closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool.read().map(|p| p.is_some()).unwrap_or(false)
    }

    async fn create_query_runner(&self) -> OrmResult<Box<dyn QueryRunner>> {
        let conn = self
            .pool()?
            .acquire()
            .await
            .map_err(|e| OrmError::Connection(format!("Failed to acquire connection: {}", e)))?;
        Ok(Box::new(PostgresQueryRunner::new(conn)))
    }

    fn capabilities(&self) -> DriverCapabilities {
        CAPABILITIES
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }
}

fn postgres_column_type(logical_type: LogicalType, generated: bool) -> String {
    match (logical_type, generated) {
        (LogicalType::Integer | LogicalType::MigrationId, true) => "SERIAL",
        (LogicalType::BigInteger, true) => "BIGSERIAL",
        (LogicalType::Integer | LogicalType::MigrationId, false) => "INTEGER",
        (LogicalType::BigInteger | LogicalType::MigrationTimestamp, _) => "BIGINT",
        (LogicalType::Text, _) => "TEXT",
        (LogicalType::MigrationName, _) => "VARCHAR",
    }
    .to_string()
}

/// PostgreSQL query runner bound to one pooled connection
pub struct PostgresQueryRunner {
    conn: Option<PoolConnection<Postgres>>,
    transactions: TransactionCoordinator,
    released: bool,
}

impl PostgresQueryRunner {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self {
            conn: Some(conn),
            transactions: TransactionCoordinator::new(CAPABILITIES.transaction_support),
            released: false,
        }
    }

    fn connection(&mut self) -> OrmResult<&mut PgConnection> {
        ensure_not_released(self.released)?;
        self.conn.as_deref_mut().ok_or(OrmError::QueryRunnerReleased)
    }

    async fn run_step(&mut self, step: &TransactionStep) -> OrmResult<()> {
        if let Some(sql) = step_sql(DIALECT, step) {
            debug!("{}", sql);
            let conn = self.connection()?;
            sqlx::query(&sql)
                .execute(conn)
                .await
                .map_err(|e| OrmError::Transaction(format!("{} failed: {}", sql, e)))?;
        }
        Ok(())
    }

    /// Split `schema.table` into an optional schema and the table name
    fn split_name(table: &str) -> (Option<&str>, &str) {
        match table.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, table),
        }
    }
}

#[async_trait]
impl QueryRunner for PostgresQueryRunner {
    fn capabilities(&self) -> DriverCapabilities {
        CAPABILITIES
    }

    fn is_released(&self) -> bool {
        self.released
    }

    fn is_transaction_active(&self) -> bool {
        self.transactions.is_active()
    }

    fn transaction_depth(&self) -> u32 {
        self.transactions.depth()
    }

    async fn query(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Vec<DatabaseRow>> {
        debug!("{}", sql);
        let conn = self.connection()?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let rows = query
            .fetch_all(conn)
            .await
            .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        rows.iter().map(postgres_row_to_database_row).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        debug!("{}", sql);
        let conn = self.connection()?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let result = query
            .execute(conn)
            .await
            .map_err(|e| OrmError::Query(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn has_table(&mut self, table: &str) -> OrmResult<bool> {
        let (schema, name) = Self::split_name(table);
        let rows = match schema {
            Some(schema) => {
                self.query(
                    "SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2",
                    &[schema.into(), name.into()],
                )
                .await?
            }
            None => {
                self.query(
                    "SELECT 1 FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1",
                    &[name.into()],
                )
                .await?
            }
        };
        Ok(!rows.is_empty())
    }

    async fn has_column(&mut self, table: &str, column: &str) -> OrmResult<bool> {
        let (schema, name) = Self::split_name(table);
        let schema_value: DatabaseValue = schema.into();
        let rows = self
            .query(
                "SELECT 1 FROM information_schema.columns \
                 WHERE table_schema = COALESCE($1, current_schema()) AND table_name = $2 AND column_name = $3",
                &[schema_value, name.into(), column.into()],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    fn column_type(&self, column: &ColumnDefinition) -> String {
        postgres_column_type(column.logical_type, column.generated)
    }

    async fn create_table(&mut self, table: &TableDefinition) -> OrmResult<()> {
        let sql = DIALECT.create_table_sql(table, |c| self.column_type(c));
        self.execute(&sql, &[]).await?;
        Ok(())
    }

    async fn drop_table(&mut self, table: &str) -> OrmResult<()> {
        let sql = DIALECT.drop_table_sql(table);
        self.execute(&sql, &[]).await?;
        Ok(())
    }

    async fn insert(
        &mut self,
        table: &str,
        values: &[(&str, DatabaseValue)],
        returning: Option<&str>,
    ) -> OrmResult<Option<i64>> {
        let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
        let params: Vec<DatabaseValue> = values.iter().map(|(_, v)| v.clone()).collect();
        let sql = DIALECT.insert_sql(table, &columns, returning);

        match returning {
            Some(column) => {
                let rows = self.query(&sql, &params).await?;
                Ok(rows
                    .first()
                    .and_then(|row| row.get_by_name(column).ok())
                    .and_then(DatabaseValue::as_i64))
            }
            None => {
                self.execute(&sql, &params).await?;
                Ok(None)
            }
        }
    }

    async fn delete(&mut self, table: &str, conditions: &[(&str, DatabaseValue)]) -> OrmResult<u64> {
        let columns: Vec<&str> = conditions.iter().map(|(c, _)| *c).collect();
        let params: Vec<DatabaseValue> = conditions.iter().map(|(_, v)| v.clone()).collect();
        let sql = DIALECT.delete_sql(table, &columns);
        self.execute(&sql, &params).await
    }

    async fn select(&mut self, table: &str, order_by: Option<(&str, SortOrder)>) -> OrmResult<Vec<DatabaseRow>> {
        let sql = DIALECT.select_sql(table, order_by.map(|(c, o)| (c, o.as_sql())));
        self.query(&sql, &[]).await
    }

    async fn start_transaction(&mut self) -> OrmResult<()> {
        ensure_not_released(self.released)?;
        let step = self.transactions.begin();
        if let Err(e) = self.run_step(&step).await {
            self.transactions.begin_failed();
            return Err(e);
        }
        Ok(())
    }

    async fn commit_transaction(&mut self) -> OrmResult<()> {
        ensure_not_released(self.released)?;
        let step = self.transactions.commit()?;
        let result = self.run_step(&step).await;
        if result.is_err() && step == TransactionStep::Commit {
            // Close out whatever the refused COMMIT left behind on the connection
            if let Err(e) = self.run_step(&TransactionStep::Rollback).await {
                warn!("Rollback after failed commit also failed: {}", e);
            }
        }
        result
    }

    async fn rollback_transaction(&mut self) -> OrmResult<()> {
        ensure_not_released(self.released)?;
        let step = self.transactions.rollback()?;
        self.run_step(&step).await
    }

    async fn release(&mut self) -> OrmResult<()> {
        if self.released {
            return Ok(());
        }

        if self.transactions.is_active() {
            warn!("Query runner released with an open transaction; rolling back");
            if let Err(e) = self.run_step(&TransactionStep::Rollback).await {
                warn!("Rollback on release failed: {}", e);
            }
            self.transactions.reset();
        }

        self.released = true;
        // Dropping the pool connection returns it to the pool
        self.conn.take();
        Ok(())
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
        DatabaseValue::Json(j) => query.bind(j.clone()),
    }
}

fn postgres_row_to_database_row(row: &PgRow) -> OrmResult<DatabaseRow> {
    let mut result = DatabaseRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        result.set(column.name(), postgres_value_to_database_value(row, index)?);
    }
    Ok(result)
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> OrmResult<DatabaseValue> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| OrmError::Query(format!("Failed to read column {}: {}", index, e)))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name().to_string();
    let decode_err = |e: sqlx::Error| {
        OrmError::Serialization(format!("Failed to decode {} column {}: {}", type_name, index, e))
    };

    let value = match type_name.as_str() {
        "BOOL" => DatabaseValue::Bool(row.try_get(index).map_err(decode_err)?),
        "INT2" => DatabaseValue::Int32(row.try_get::<i16, _>(index).map_err(decode_err)? as i32),
        "INT4" => DatabaseValue::Int32(row.try_get(index).map_err(decode_err)?),
        "INT8" => DatabaseValue::Int64(row.try_get(index).map_err(decode_err)?),
        "FLOAT4" => DatabaseValue::Float64(row.try_get::<f32, _>(index).map_err(decode_err)? as f64),
        "FLOAT8" => DatabaseValue::Float64(row.try_get(index).map_err(decode_err)?),
        "BYTEA" => DatabaseValue::Bytes(row.try_get(index).map_err(decode_err)?),
        "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index).map_err(decode_err)?),
        "TIMESTAMP" => DatabaseValue::DateTime(
            row.try_get::<chrono::NaiveDateTime, _>(index)
                .map_err(decode_err)?
                .and_utc(),
        ),
        "JSON" | "JSONB" => DatabaseValue::Json(row.try_get::<JsonValue, _>(index).map_err(decode_err)?),
        _ => DatabaseValue::String(row.try_get(index).map_err(decode_err)?),
    };
    Ok(value)
}
