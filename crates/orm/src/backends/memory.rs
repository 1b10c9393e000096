//! In-process memory backend
//!
//! Tables are plain row vectors behind a mutex. Transactions are snapshot
//! based: beginning a transaction or savepoint saves a copy of the state and a
//! rollback restores it. The declared capabilities are configurable, which
//! makes this backend stand in for single-level, transactionless and
//! document-style stores as well.
//!
//! Every statement and transaction step is appended to a journal, and
//! statements can be made to fail on demand with [`MemoryDatabase::fail_on`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::core::*;
use super::sql::SqlDialect;
use super::DatabaseBackendType;
use crate::error::{OrmError, OrmResult};
use crate::schema::{ColumnDefinition, LogicalType, TableDefinition};
use crate::transactions::savepoints::step_sql;
use crate::transactions::{TransactionCoordinator, TransactionStep};

const DEFAULT_CAPABILITIES: DriverCapabilities = DriverCapabilities {
    transaction_support: TransactionSupport::Nested,
    schemaless: false,
    supports_returning: true,
};

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<ColumnDefinition>,
    rows: Vec<DatabaseRow>,
    next_id: i64,
}

impl MemoryTable {
    fn from_definition(definition: &TableDefinition) -> Self {
        Self {
            columns: definition.columns.clone(),
            rows: Vec::new(),
            next_id: 1,
        }
    }

    fn collection() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
}

/// Shared storage behind every runner of one [`MemoryDriver`]
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: Mutex<MemoryState>,
    journal: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    runners_created: AtomicUsize,
    runners_open: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> OrmResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| OrmError::Database("memory database lock poisoned".to_string()))
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement and transaction step seen so far, in order
    pub fn journal(&self) -> Vec<String> {
        lock(&self.journal).map(|j| j.clone()).unwrap_or_default()
    }

    /// Number of journal entries equal to `entry`
    pub fn journal_count(&self, entry: &str) -> usize {
        self.journal().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn clear_journal(&self) {
        if let Ok(mut journal) = lock(&self.journal) {
            journal.clear();
        }
    }

    /// Make every statement containing `pattern` fail
    pub fn fail_on(&self, pattern: impl Into<String>) {
        if let Ok(mut failures) = lock(&self.failures) {
            failures.push(pattern.into());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = lock(&self.failures) {
            failures.clear();
        }
    }

    /// Query runners created so far
    pub fn runners_created(&self) -> usize {
        self.runners_created.load(AtomicOrdering::SeqCst)
    }

    /// Query runners created and not released yet
    pub fn runners_open(&self) -> usize {
        self.runners_open.load(AtomicOrdering::SeqCst)
    }

    pub fn has_table(&self, table: &str) -> bool {
        lock(&self.state)
            .map(|s| s.tables.contains_key(table))
            .unwrap_or(false)
    }

    pub fn table_names(&self) -> Vec<String> {
        lock(&self.state)
            .map(|s| s.tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed and uncommitted rows of a table, in insertion order
    pub fn rows(&self, table: &str) -> Vec<DatabaseRow> {
        lock(&self.state)
            .ok()
            .and_then(|s| s.tables.get(table).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    fn record(&self, entry: String) -> OrmResult<()> {
        debug!("memory: {}", entry);
        let failing = lock(&self.failures)?.iter().any(|p| entry.contains(p.as_str()));
        lock(&self.journal)?.push(entry.clone());
        if failing {
            return Err(OrmError::Query(format!("Injected failure: {}", entry)));
        }
        Ok(())
    }

    fn snapshot(&self) -> OrmResult<MemoryState> {
        Ok(lock(&self.state)?.clone())
    }

    fn restore(&self, state: MemoryState) -> OrmResult<()> {
        *lock(&self.state)? = state;
        Ok(())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> OrmResult<R>) -> OrmResult<R> {
        let mut state = lock(&self.state)?;
        f(&mut state)
    }
}

/// Driver for the in-process backend; `memory://` URLs
pub struct MemoryDriver {
    database: Arc<MemoryDatabase>,
    capabilities: DriverCapabilities,
    connected: AtomicBool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::with_capabilities(DEFAULT_CAPABILITIES)
    }

    pub fn with_capabilities(capabilities: DriverCapabilities) -> Self {
        Self {
            database: Arc::new(MemoryDatabase::new()),
            capabilities,
            connected: AtomicBool::new(false),
        }
    }

    /// Build from a URL such as `memory://?transactions=simple&schemaless=true`
    ///
    /// Recognized parameters: `transactions` (`none`, `simple`, `nested`),
    /// `schemaless` and `returning` (`true`/`false`).
    pub fn from_url(database_url: &str) -> OrmResult<Self> {
        let url = url::Url::parse(database_url).map_err(|e| {
            OrmError::Configuration(format!("Invalid memory database URL '{}': {}", database_url, e))
        })?;

        let mut capabilities = DEFAULT_CAPABILITIES;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "transactions" => {
                    capabilities.transaction_support = match value.as_ref() {
                        "none" => TransactionSupport::None,
                        "simple" => TransactionSupport::Simple,
                        "nested" => TransactionSupport::Nested,
                        other => return Err(invalid_parameter("transactions", other, "none, simple or nested")),
                    }
                }
                "schemaless" => capabilities.schemaless = parse_flag("schemaless", &value)?,
                "returning" => capabilities.supports_returning = parse_flag("returning", &value)?,
                other => {
                    return Err(OrmError::Configuration(format!(
                        "Unknown memory database parameter '{}'",
                        other
                    )))
                }
            }
        }

        Ok(Self::with_capabilities(capabilities))
    }

    /// Storage shared by every runner of this driver
    pub fn database(&self) -> Arc<MemoryDatabase> {
        Arc::clone(&self.database)
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_flag(key: &str, value: &str) -> OrmResult<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(invalid_parameter(key, other, "true or false")),
    }
}

fn invalid_parameter(key: &str, value: &str, expected: &str) -> OrmError {
    OrmError::Configuration(format!(
        "Invalid memory database parameter {}={}, expected {}",
        key, value, expected
    ))
}

#[async_trait]
impl DatabaseDriver for MemoryDriver {
    async fn connect(&self) -> OrmResult<()> {
        self.connected.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> OrmResult<()> {
        self.connected.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(AtomicOrdering::SeqCst)
    }

    async fn create_query_runner(&self) -> OrmResult<Box<dyn QueryRunner>> {
        if !self.is_connected() {
            return Err(OrmError::NotConnected);
        }
        Ok(Box::new(MemoryQueryRunner::new(self.database(), self.capabilities)))
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::Memory
    }
}

/// Query runner over a [`MemoryDatabase`]
pub struct MemoryQueryRunner {
    database: Arc<MemoryDatabase>,
    capabilities: DriverCapabilities,
    transactions: TransactionCoordinator,
    snapshots: Vec<MemoryState>,
    released: bool,
}

impl MemoryQueryRunner {
    pub fn new(database: Arc<MemoryDatabase>, capabilities: DriverCapabilities) -> Self {
        database.runners_created.fetch_add(1, AtomicOrdering::SeqCst);
        database.runners_open.fetch_add(1, AtomicOrdering::SeqCst);
        Self {
            database,
            capabilities,
            transactions: TransactionCoordinator::new(capabilities.transaction_support),
            snapshots: Vec::new(),
            released: false,
        }
    }

    fn missing_table(table: &str) -> OrmError {
        OrmError::Query(format!("Table '{}' does not exist", table))
    }

    fn rollback_all(&mut self) -> OrmResult<()> {
        if !self.snapshots.is_empty() {
            let outermost = self.snapshots.swap_remove(0);
            self.snapshots.clear();
            self.database.restore(outermost)?;
        }
        Ok(())
    }

    fn run_step(&mut self, step: &TransactionStep) -> OrmResult<()> {
        let Some(sql) = step_sql(SqlDialect::PostgreSQL, step) else {
            return Ok(());
        };

        if let Err(e) = self.database.record(sql.clone()) {
            // A failed commit leaves nothing behind, as on a real server
            if matches!(step, TransactionStep::Commit) {
                self.rollback_all()?;
            }
            return Err(OrmError::Transaction(format!("{} failed: {}", sql, e)));
        }

        match step {
            TransactionStep::Begin | TransactionStep::Savepoint(_) => {
                let snapshot = self.database.snapshot()?;
                self.snapshots.push(snapshot);
            }
            TransactionStep::Commit => self.snapshots.clear(),
            TransactionStep::ReleaseSavepoint(_) => {
                self.snapshots.pop();
            }
            TransactionStep::Rollback => self.rollback_all()?,
            TransactionStep::RollbackToSavepoint(_) => {
                if let Some(snapshot) = self.snapshots.pop() {
                    self.database.restore(snapshot)?;
                }
            }
            TransactionStep::Absorb => {}
        }
        Ok(())
    }
}

fn compare_values(a: Option<&DatabaseValue>, b: Option<&DatabaseValue>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) if a.is_integer() && b.is_integer() => a.as_i64().cmp(&b.as_i64()),
        (Some(DatabaseValue::String(a)), Some(DatabaseValue::String(b))) => a.cmp(b),
        (Some(DatabaseValue::Float64(a)), Some(DatabaseValue::Float64(b))) => {
            a.partial_cmp(b).unwrap_or(Ordering::Equal)
        }
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl QueryRunner for MemoryQueryRunner {
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
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

    /// Raw SQL is journaled but not interpreted
    async fn query(&mut self, sql: &str, _params: &[DatabaseValue]) -> OrmResult<Vec<DatabaseRow>> {
        ensure_not_released(self.released)?;
        self.database.record(sql.to_string())?;
        Ok(Vec::new())
    }

    async fn execute(&mut self, sql: &str, _params: &[DatabaseValue]) -> OrmResult<u64> {
        ensure_not_released(self.released)?;
        self.database.record(sql.to_string())?;
        Ok(0)
    }

    async fn has_table(&mut self, table: &str) -> OrmResult<bool> {
        ensure_not_released(self.released)?;
        self.database.with_state(|s| Ok(s.tables.contains_key(table)))
    }

    async fn has_column(&mut self, table: &str, column: &str) -> OrmResult<bool> {
        ensure_not_released(self.released)?;
        let schemaless = self.capabilities.schemaless;
        self.database.with_state(|s| {
            Ok(s.tables.get(table).map_or(false, |t| {
                if schemaless {
                    t.rows.iter().any(|r| r.get_by_name(column).is_ok())
                } else {
                    t.columns.iter().any(|c| c.name == column)
                }
            }))
        })
    }

    fn column_type(&self, column: &ColumnDefinition) -> String {
        match column.logical_type {
            LogicalType::Integer | LogicalType::MigrationId => "integer",
            LogicalType::BigInteger | LogicalType::MigrationTimestamp => "bigint",
            LogicalType::Text | LogicalType::MigrationName => "text",
        }
        .to_string()
    }

    async fn create_table(&mut self, table: &TableDefinition) -> OrmResult<()> {
        ensure_not_released(self.released)?;
        self.database.record(format!("CREATE TABLE {}", table.name))?;
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, self.column_type(c)))
            .collect();
        debug!("memory: table {} ({})", table.name, columns.join(", "));
        self.database.with_state(|s| {
            if s.tables.contains_key(&table.name) {
                return Err(OrmError::Query(format!("Table '{}' already exists", table.name)));
            }
            s.tables
                .insert(table.name.clone(), MemoryTable::from_definition(table));
            Ok(())
        })
    }

    async fn drop_table(&mut self, table: &str) -> OrmResult<()> {
        ensure_not_released(self.released)?;
        self.database.record(format!("DROP TABLE {}", table))?;
        self.database.with_state(|s| {
            s.tables
                .remove(table)
                .map(|_| ())
                .ok_or_else(|| Self::missing_table(table))
        })
    }

    async fn insert(
        &mut self,
        table: &str,
        values: &[(&str, DatabaseValue)],
        returning: Option<&str>,
    ) -> OrmResult<Option<i64>> {
        ensure_not_released(self.released)?;
        self.database.record(format!("INSERT INTO {}", table))?;

        let capabilities = self.capabilities;
        self.database.with_state(|s| {
            if capabilities.schemaless {
                s.tables
                    .entry(table.to_string())
                    .or_insert_with(MemoryTable::collection);
            }
            let target = s.tables.get_mut(table).ok_or_else(|| Self::missing_table(table))?;

            if !capabilities.schemaless {
                if let Some((unknown, _)) = values
                    .iter()
                    .find(|(col, _)| !target.columns.iter().any(|c| c.name == *col))
                {
                    return Err(OrmError::Query(format!(
                        "Table '{}' has no column named '{}'",
                        table, unknown
                    )));
                }
            }

            let mut row = DatabaseRow::from_pairs(values.iter().map(|(c, v)| (*c, v.clone())));
            let id_column = returning
                .map(str::to_string)
                .or_else(|| target.columns.iter().find(|c| c.generated).map(|c| c.name.clone()));

            let mut generated = None;
            if let Some(id_column) = id_column {
                if row.get_by_name(&id_column).is_err() {
                    let id = target.next_id;
                    target.next_id += 1;
                    row.set(id_column, DatabaseValue::Int64(id));
                    generated = Some(id);
                }
            }

            target.rows.push(row);
            Ok(generated.filter(|_| returning.is_some() && capabilities.supports_returning))
        })
    }

    async fn delete(&mut self, table: &str, conditions: &[(&str, DatabaseValue)]) -> OrmResult<u64> {
        ensure_not_released(self.released)?;
        self.database.record(format!("DELETE FROM {}", table))?;

        let schemaless = self.capabilities.schemaless;
        self.database.with_state(|s| match s.tables.get_mut(table) {
            Some(target) => {
                let before = target.rows.len();
                target.rows.retain(|row| !row.matches(conditions));
                Ok((before - target.rows.len()) as u64)
            }
            None if schemaless => Ok(0),
            None => Err(Self::missing_table(table)),
        })
    }

    async fn select(&mut self, table: &str, order_by: Option<(&str, SortOrder)>) -> OrmResult<Vec<DatabaseRow>> {
        ensure_not_released(self.released)?;
        self.database.record(format!("SELECT FROM {}", table))?;

        let schemaless = self.capabilities.schemaless;
        let mut rows = self.database.with_state(|s| match s.tables.get(table) {
            Some(target) => Ok(target.rows.clone()),
            None if schemaless => Ok(Vec::new()),
            None => Err(Self::missing_table(table)),
        })?;

        if let Some((column, order)) = order_by {
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get_by_name(column).ok(), b.get_by_name(column).ok());
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }
        Ok(rows)
    }

    async fn start_transaction(&mut self) -> OrmResult<()> {
        ensure_not_released(self.released)?;
        let step = self.transactions.begin();
        if let Err(e) = self.run_step(&step) {
            self.transactions.begin_failed();
            return Err(e);
        }
        Ok(())
    }

    async fn commit_transaction(&mut self) -> OrmResult<()> {
        ensure_not_released(self.released)?;
        let step = self.transactions.commit()?;
        self.run_step(&step)
    }

    async fn rollback_transaction(&mut self) -> OrmResult<()> {
        ensure_not_released(self.released)?;
        let step = self.transactions.rollback()?;
        self.run_step(&step)
    }

    async fn release(&mut self) -> OrmResult<()> {
        if self.released {
            return Ok(());
        }

        if self.transactions.is_active() {
            warn!("Query runner released with an open transaction; rolling back");
            if self.capabilities.supports_transactions() {
                if let Err(e) = self.run_step(&TransactionStep::Rollback) {
                    warn!("Rollback on release failed: {}", e);
                }
            }
            self.transactions.reset();
        }

        self.snapshots.clear();
        self.released = true;
        self.database.runners_open.fetch_sub(1, AtomicOrdering::SeqCst);
        self.database.record("RELEASE RUNNER".to_string())
    }
}
