//! Core Database Backend Traits
//!
//! This module defines the traits and types every backend implements. The
//! migration engine only ever talks to a backend through [`DatabaseDriver`],
//! [`QueryRunner`] and the [`DriverCapabilities`] they declare; it never
//! inspects which concrete backend it is running against.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{OrmError, OrmResult};
use crate::schema::{ColumnDefinition, TableDefinition};

/// How far a backend supports transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSupport {
    /// No transactions at all; begin/commit only track state
    None,
    /// A single transaction level; nested requests join the outer one
    Simple,
    /// Nested transactions through savepoints
    Nested,
}

/// Capability flags a backend declares about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub transaction_support: TransactionSupport,
    /// Document-style store without DDL; tables are created on first write
    pub schemaless: bool,
    /// Inserts can report generated keys through a RETURNING clause
    pub supports_returning: bool,
}

impl DriverCapabilities {
    pub fn supports_transactions(&self) -> bool {
        self.transaction_support != TransactionSupport::None
    }
}

/// Sort direction for [`QueryRunner::select`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Database backend trait: one implementation per database system
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Open the underlying pool or session
    async fn connect(&self) -> OrmResult<()>;

    /// Close the underlying pool or session
    async fn disconnect(&self) -> OrmResult<()>;

    fn is_connected(&self) -> bool;

    /// Create a new query runner bound to a single connection
    async fn create_query_runner(&self) -> OrmResult<Box<dyn QueryRunner>>;

    fn capabilities(&self) -> DriverCapabilities;

    fn backend_type(&self) -> crate::backends::DatabaseBackendType;
}

/// A single logical database session plus its transaction state
///
/// A runner is used by one task at a time. Once [`release`](Self::release)
/// has been called every other operation fails with
/// [`OrmError::QueryRunnerReleased`].
#[async_trait]
pub trait QueryRunner: Send {
    fn capabilities(&self) -> DriverCapabilities;

    fn is_released(&self) -> bool;

    fn is_transaction_active(&self) -> bool;

    fn transaction_depth(&self) -> u32;

    /// Execute a statement and return the result rows
    async fn query(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Vec<DatabaseRow>>;

    /// Execute a statement and return the affected row count
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64>;

    async fn has_table(&mut self, table: &str) -> OrmResult<bool>;

    async fn has_column(&mut self, table: &str, column: &str) -> OrmResult<bool>;

    /// Native column type used when rendering `column` in `create_table`
    fn column_type(&self, column: &ColumnDefinition) -> String;

    async fn create_table(&mut self, table: &TableDefinition) -> OrmResult<()>;

    async fn drop_table(&mut self, table: &str) -> OrmResult<()>;

    /// Insert a row. When `returning` names the generated key column, the new
    /// key is returned if the backend can report it.
    async fn insert(
        &mut self,
        table: &str,
        values: &[(&str, DatabaseValue)],
        returning: Option<&str>,
    ) -> OrmResult<Option<i64>>;

    /// Delete rows matching every condition
    async fn delete(&mut self, table: &str, conditions: &[(&str, DatabaseValue)]) -> OrmResult<u64>;

    /// Read every row of a table
    async fn select(&mut self, table: &str, order_by: Option<(&str, SortOrder)>) -> OrmResult<Vec<DatabaseRow>>;

    async fn start_transaction(&mut self) -> OrmResult<()>;

    async fn commit_transaction(&mut self) -> OrmResult<()>;

    async fn rollback_transaction(&mut self) -> OrmResult<()>;

    /// Return the connection; rolls back a transaction left open. Idempotent.
    async fn release(&mut self) -> OrmResult<()>;
}

/// Fail with [`OrmError::QueryRunnerReleased`] when the runner was released
pub fn ensure_not_released(released: bool) -> OrmResult<()> {
    if released {
        Err(OrmError::QueryRunnerReleased)
    } else {
        Ok(())
    }
}

/// A result row with ordered, named columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseRow {
    columns: Vec<(String, DatabaseValue)>,
}

impl DatabaseRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, DatabaseValue)>,
        S: Into<String>,
    {
        Self {
            columns: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Set a column, replacing an existing value of the same name
    pub fn set(&mut self, name: impl Into<String>, value: DatabaseValue) {
        let name = name.into();
        match self.columns.iter_mut().find(|(col, _)| *col == name) {
            Some((_, existing)) => *existing = value,
            None => self.columns.push((name, value)),
        }
    }

    pub fn get_by_name(&self, name: &str) -> OrmResult<&DatabaseValue> {
        self.columns
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, v)| v)
            .ok_or_else(|| OrmError::Query(format!("Column '{}' not found", name)))
    }

    /// Typed column access through serde
    pub fn get<T>(&self, name: &str) -> OrmResult<T>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let value = self.get_by_name(name)?;
        serde_json::from_value(value.to_json()).map_err(|e| {
            OrmError::Serialization(format!("Failed to deserialize column '{}': {}", name, e))
        })
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(col, _)| col.clone()).collect()
    }

    pub fn to_json(&self) -> JsonValue {
        let map = self
            .columns
            .iter()
            .map(|(col, value)| (col.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        JsonValue::Object(map)
    }

    /// Whether every condition matches this row's values
    pub fn matches(&self, conditions: &[(&str, DatabaseValue)]) -> bool {
        conditions.iter().all(|(col, expected)| {
            self.get_by_name(col)
                .map(|actual| actual.loosely_equals(expected))
                .unwrap_or(false)
        })
    }
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(chrono::DateTime<chrono::Utc>),
    Json(JsonValue),
}

impl DatabaseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(*i as i64),
            DatabaseValue::Int64(i) => Some(*i),
            DatabaseValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DatabaseValue::Int32(_) | DatabaseValue::Int64(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Equality that ignores integer width
    pub fn loosely_equals(&self, other: &DatabaseValue) -> bool {
        match (self.as_i64(), other.as_i64()) {
            (Some(a), Some(b)) if self.is_integer() && other.is_integer() => a == b,
            _ => self == other,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            DatabaseValue::Null => JsonValue::Null,
            DatabaseValue::Bool(b) => JsonValue::Bool(*b),
            DatabaseValue::Int32(i) => JsonValue::Number((*i).into()),
            DatabaseValue::Int64(i) => JsonValue::Number((*i).into()),
            DatabaseValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::String(s) => JsonValue::String(s.clone()),
            DatabaseValue::Bytes(b) => {
                JsonValue::Array(b.iter().map(|&x| JsonValue::Number(x.into())).collect())
            }
            DatabaseValue::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            DatabaseValue::Json(j) => j.clone(),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(value: Vec<u8>) -> Self {
        DatabaseValue::Bytes(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl From<JsonValue> for DatabaseValue {
    fn from(value: JsonValue) -> Self {
        DatabaseValue::Json(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}
