//! Backend-neutral table definitions
//!
//! Column types are logical; each query runner maps them to native types
//! through [`QueryRunner::column_type`](crate::backends::QueryRunner::column_type).

/// Logical column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Integer,
    BigInteger,
    Text,
    /// Auto-increment key of the migrations ledger
    MigrationId,
    /// Millisecond timestamp of a migration
    MigrationTimestamp,
    /// Migration name
    MigrationName,
}

/// A column of a [`TableDefinition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub logical_type: LogicalType,
    pub primary: bool,
    /// Value generated by the backend (auto-increment)
    pub generated: bool,
    pub nullable: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            primary: false,
            generated: false,
            nullable: true,
        }
    }

    /// Auto-incrementing primary key
    pub fn increments(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            primary: true,
            generated: true,
            nullable: false,
            ..Self::new(name, logical_type)
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self.nullable = false;
        self
    }
}

/// Structure of a table to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The generated primary key column, if any
    pub fn generated_column(&self) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.generated)
    }
}
