//! SQLite Backend Implementation
//!
//! SQLite implementation of the backend traits on top of sqlx. In-memory
//! databases live inside a single connection, so their pool is pinned to
//! exactly one long-lived connection.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use tracing::{debug, warn};

use super::core::*;
use super::sql::SqlDialect;
use super::DatabaseBackendType;
use crate::config::PoolOptions;
use crate::error::{OrmError, OrmResult};
use crate::schema::{ColumnDefinition, LogicalType, TableDefinition};
use crate::transactions::savepoints::step_sql;
use crate::transactions::{TransactionCoordinator, TransactionStep};

const DIALECT: SqlDialect = SqlDialect::SQLite;

const CAPABILITIES: DriverCapabilities = DriverCapabilities {
    transaction_support: TransactionSupport::Nested,
    schemaless: false,
    supports_returning: false,
};

/// SQLite database driver
pub struct SqliteDriver {
    database_url: String,
    pool_options: PoolOptions,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteDriver {
    pub fn new(database_url: &str, pool_options: PoolOptions) -> Self {
        Self {
            database_url: database_url.to_string(),
            pool_options,
            pool: RwLock::new(None),
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }

    fn pool(&self) -> OrmResult<SqlitePool> {
        self.pool
            .read()
            .map_err(|_| OrmError::Connection("SQLite pool lock poisoned".to_string()))?
            .clone()
            .ok_or(OrmError::NotConnected)
    }
}

#[async_trait]
impl DatabaseDriver for SqliteDriver {
    async fn connect(&self) -> OrmResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let mut options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(self.pool_options.acquire_timeout_seconds));

        options = if self.is_in_memory() {
            options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options
                .max_connections(self.pool_options.max_connections)
                .min_connections(self.pool_options.min_connections)
        };

        let pool = options
            .connect(&self.database_url)
            .await
            .map_err(|e| OrmError::Connection(format!("Failed to open SQLite database: {}", e)))?;

        *self
            .pool
            .write()
            .map_err(|_| OrmError::Connection("SQLite pool lock poisoned".to_string()))? = Some(pool);
        debug!("SQLite pool connected to {}", self.database_url);
        Ok(())
    }

    async fn disconnect(&self) -> OrmResult<()> {
        let pool = self
            .pool
            .write()
            .map_err(|_| OrmError::Connection("SQLite pool lock poisoned".to_string()))?
            .take();
        if let Some(pool) = pool {
            pool.close().await;
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
        Ok(Box::new(SqliteQueryRunner::new(conn)))
    }

    fn capabilities(&self) -> DriverCapabilities {
        CAPABILITIES
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }
}

fn sqlite_column_type(logical_type: LogicalType) -> String {
    match logical_type {
        // AUTOINCREMENT is only accepted on INTEGER PRIMARY KEY
        LogicalType::Integer | LogicalType::MigrationId => "INTEGER",
        LogicalType::BigInteger | LogicalType::MigrationTimestamp => "BIGINT",
        LogicalType::Text => "TEXT",
        LogicalType::MigrationName => "VARCHAR",
    }
    .to_string()
}

/// SQLite query runner bound to one pooled connection
pub struct SqliteQueryRunner {
    conn: Option<PoolConnection<Sqlite>>,
    transactions: TransactionCoordinator,
    released: bool,
}

impl SqliteQueryRunner {
    pub fn new(conn: PoolConnection<Sqlite>) -> Self {
        Self {
            conn: Some(conn),
            transactions: TransactionCoordinator::new(CAPABILITIES.transaction_support),
            released: false,
        }
    }

    fn connection(&mut self) -> OrmResult<&mut SqliteConnection> {
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
}

#[async_trait]
impl QueryRunner for SqliteQueryRunner {
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

        rows.iter().map(sqlite_row_to_database_row).collect()
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
        let sql = match table.split_once('.') {
            Some((schema, _)) => format!(
                "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name = ?",
                DIALECT.quote_identifier(schema)
            ),
            None => "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?".to_string(),
        };
        let name = table.rsplit('.').next().unwrap_or(table);
        let rows = self.query(&sql, &[name.into()]).await?;
        Ok(!rows.is_empty())
    }

    async fn has_column(&mut self, table: &str, column: &str) -> OrmResult<bool> {
        let rows = self
            .query(
                "SELECT name FROM pragma_table_info(?) WHERE name = ?",
                &[table.into(), column.into()],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    fn column_type(&self, column: &ColumnDefinition) -> String {
        sqlite_column_type(column.logical_type)
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
        let sql = DIALECT.insert_sql(table, &columns, None);
        debug!("{}", sql);

        let conn = self.connection()?;
        let mut query = sqlx::query(&sql);
        for (_, value) in values {
            query = bind_database_value(query, value);
        }

        let result = query
            .execute(conn)
            .await
            .map_err(|e| OrmError::Query(format!("Query execution failed: {}", e)))?;

        Ok(returning.map(|_| result.last_insert_rowid()))
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
            // SQLite keeps the transaction open when it refuses a COMMIT
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
        self.conn.take();
        Ok(())
    }
}

fn bind_database_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
        DatabaseValue::Json(j) => query.bind(j.to_string()),
    }
}

fn sqlite_row_to_database_row(row: &SqliteRow) -> OrmResult<DatabaseRow> {
    let mut result = DatabaseRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        result.set(column.name(), sqlite_value_to_database_value(row, index)?);
    }
    Ok(result)
}

/// Decode one value by its storage class
///
/// Expression columns (`count(*)`, `SELECT 1`) have no declared type, so the
/// value's own type picks the decoding. The declared type only refines
/// integers into booleans and text into timestamps.
fn sqlite_value_to_database_value(row: &SqliteRow, index: usize) -> OrmResult<DatabaseValue> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| OrmError::Query(format!("Failed to read column {}: {}", index, e)))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let storage = raw.type_info().name().to_uppercase();
    let declared = row.columns()[index].type_info().name().to_uppercase();
    let decode_err = |e: sqlx::Error| {
        OrmError::Serialization(format!("Failed to decode {} column {}: {}", storage, index, e))
    };

    let value = match storage.as_str() {
        "INTEGER" if declared == "BOOLEAN" => DatabaseValue::Bool(row.try_get(index).map_err(decode_err)?),
        "INTEGER" => DatabaseValue::Int64(row.try_get(index).map_err(decode_err)?),
        "REAL" => DatabaseValue::Float64(row.try_get(index).map_err(decode_err)?),
        "BLOB" => DatabaseValue::Bytes(row.try_get(index).map_err(decode_err)?),
        "TEXT" if declared == "DATETIME" => match row.try_get(index) {
            Ok(at) => DatabaseValue::DateTime(at),
            Err(_) => DatabaseValue::String(row.try_get(index).map_err(decode_err)?),
        },
        _ => DatabaseValue::String(row.try_get(index).map_err(decode_err)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_driver() -> SqliteDriver {
        let driver = SqliteDriver::new("sqlite::memory:", PoolOptions::default());
        driver.connect().await.unwrap();
        driver
    }

    fn users_table() -> TableDefinition {
        TableDefinition::new("users")
            .column(ColumnDefinition::increments("id", LogicalType::Integer))
            .column(ColumnDefinition::new("email", LogicalType::Text).not_null())
    }

    #[tokio::test]
    async fn test_create_table_and_introspect() {
        let driver = connected_driver().await;
        let mut runner = driver.create_query_runner().await.unwrap();

        assert!(!runner.has_table("users").await.unwrap());
        runner.create_table(&users_table()).await.unwrap();
        assert!(runner.has_table("users").await.unwrap());
        assert!(runner.has_column("users", "email").await.unwrap());
        assert!(!runner.has_column("users", "password").await.unwrap());

        runner.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_select_delete() {
        let driver = connected_driver().await;
        let mut runner = driver.create_query_runner().await.unwrap();
        runner.create_table(&users_table()).await.unwrap();

        let first = runner
            .insert("users", &[("email", "a@example.com".into())], Some("id"))
            .await
            .unwrap();
        let second = runner
            .insert("users", &[("email", "b@example.com".into())], Some("id"))
            .await
            .unwrap();
        assert_eq!(first, Some(1));
        assert_eq!(second, Some(2));

        let rows = runner.select("users", Some(("id", SortOrder::Desc))).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get::<String>("email").unwrap(), "b@example.com");

        let deleted = runner
            .delete("users", &[("email", "a@example.com".into())])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        runner.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_outer_work() {
        let driver = connected_driver().await;
        let mut runner = driver.create_query_runner().await.unwrap();
        runner.create_table(&users_table()).await.unwrap();

        runner.start_transaction().await.unwrap();
        runner.insert("users", &[("email", "outer@example.com".into())], None).await.unwrap();

        runner.start_transaction().await.unwrap();
        assert_eq!(runner.transaction_depth(), 2);
        runner.insert("users", &[("email", "inner@example.com".into())], None).await.unwrap();
        runner.rollback_transaction().await.unwrap();

        runner.commit_transaction().await.unwrap();
        assert!(!runner.is_transaction_active());

        let rows = runner.select("users", None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<String>("email").unwrap(), "outer@example.com");
        runner.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_released_runner_rejects_operations() {
        let driver = connected_driver().await;
        let mut runner = driver.create_query_runner().await.unwrap();
        runner.release().await.unwrap();
        runner.release().await.unwrap();

        assert!(runner.is_released());
        assert!(matches!(runner.has_table("users").await, Err(OrmError::QueryRunnerReleased)));
        assert!(matches!(runner.start_transaction().await, Err(OrmError::QueryRunnerReleased)));
        assert!(matches!(runner.commit_transaction().await, Err(OrmError::QueryRunnerReleased)));
    }

    #[tokio::test]
    async fn test_commit_without_transaction() {
        let driver = connected_driver().await;
        let mut runner = driver.create_query_runner().await.unwrap();
        assert!(matches!(
            runner.commit_transaction().await,
            Err(OrmError::TransactionNotStarted)
        ));
        runner.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_rolls_back_open_transaction() {
        let driver = connected_driver().await;
        let mut runner = driver.create_query_runner().await.unwrap();
        runner.create_table(&users_table()).await.unwrap();
        runner.start_transaction().await.unwrap();
        runner.insert("users", &[("email", "lost@example.com".into())], None).await.unwrap();
        runner.release().await.unwrap();

        let mut runner = driver.create_query_runner().await.unwrap();
        assert!(runner.select("users", None).await.unwrap().is_empty());
        runner.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_commit_rolls_back() {
        let driver = connected_driver().await;
        let mut runner = driver.create_query_runner().await.unwrap();
        runner
            .execute("CREATE TABLE parents (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        runner
            .execute(
                "CREATE TABLE children (parent_id INTEGER REFERENCES parents (id) DEFERRABLE INITIALLY DEFERRED)",
                &[],
            )
            .await
            .unwrap();

        runner.start_transaction().await.unwrap();
        runner
            .execute("INSERT INTO children (parent_id) VALUES (7)", &[])
            .await
            .unwrap();
        assert!(matches!(runner.commit_transaction().await, Err(OrmError::Transaction(_))));
        assert!(!runner.is_transaction_active());

        runner.start_transaction().await.unwrap();
        runner.commit_transaction().await.unwrap();
        assert!(runner.select("children", None).await.unwrap().is_empty());
        runner.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_decodes_expression_columns() {
        let driver = connected_driver().await;
        let mut runner = driver.create_query_runner().await.unwrap();
        runner.create_table(&users_table()).await.unwrap();
        runner.insert("users", &[("email", "a@example.com".into())], None).await.unwrap();

        let rows = runner
            .query(
                "SELECT 1 AS one, count(*) AS total, 2.5 AS ratio, 'x' || email AS tagged, NULL AS nothing FROM users",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<i64>("one").unwrap(), 1);
        assert_eq!(rows[0].get::<i64>("total").unwrap(), 1);
        assert_eq!(rows[0].get::<f64>("ratio").unwrap(), 2.5);
        assert_eq!(rows[0].get::<String>("tagged").unwrap(), "xa@example.com");
        assert!(rows[0].get_by_name("nothing").unwrap().is_null());
        runner.release().await.unwrap();
    }
}
