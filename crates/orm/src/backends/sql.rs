//! SQL statement building shared by the SQL backends
//!
//! Only the handful of statements the query runner primitives need are built
//! here: table DDL from a [`TableDefinition`], and single-table insert,
//! delete and select.

use crate::schema::{ColumnDefinition, TableDefinition};

/// SQL dialect enumeration for generating database-specific SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    PostgreSQL,
    SQLite,
}

impl SqlDialect {
    /// Parameter placeholder for a zero-based parameter index
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Quote an identifier, quoting each part of a `schema.table` path
    pub fn quote_identifier(&self, identifier: &str) -> String {
        identifier
            .split('.')
            .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn begin_transaction(&self) -> &'static str {
        match self {
            SqlDialect::PostgreSQL => "BEGIN",
            SqlDialect::SQLite => "BEGIN TRANSACTION",
        }
    }

    /// Keyword appended to a generated primary key column
    pub fn auto_increment(&self) -> Option<&'static str> {
        match self {
            // SERIAL already implies the sequence
            SqlDialect::PostgreSQL => None,
            SqlDialect::SQLite => Some("AUTOINCREMENT"),
        }
    }

    pub fn create_table_sql<F>(&self, table: &TableDefinition, column_type: F) -> String
    where
        F: Fn(&ColumnDefinition) -> String,
    {
        let columns = table
            .columns
            .iter()
            .map(|column| {
                let mut parts = vec![self.quote_identifier(&column.name), column_type(column)];
                if column.primary {
                    parts.push("PRIMARY KEY".to_string());
                }
                if column.generated {
                    if let Some(keyword) = self.auto_increment() {
                        parts.push(keyword.to_string());
                    }
                }
                if !column.nullable {
                    parts.push("NOT NULL".to_string());
                }
                parts.join(" ")
            })
            .collect::<Vec<_>>()
            .join(", ");

        format!("CREATE TABLE {} ({})", self.quote_identifier(&table.name), columns)
    }

    pub fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE {}", self.quote_identifier(table))
    }

    /// INSERT statement, optionally returning a generated column
    pub fn insert_sql(&self, table: &str, columns: &[&str], returning: Option<&str>) -> String {
        let column_list = columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (0..columns.len())
            .map(|i| self.parameter_placeholder(i))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_identifier(table),
            column_list,
            placeholders
        );
        if let Some(column) = returning {
            sql.push_str(&format!(" RETURNING {}", self.quote_identifier(column)));
        }
        sql
    }

    pub fn delete_sql(&self, table: &str, conditions: &[&str]) -> String {
        let mut sql = format!("DELETE FROM {}", self.quote_identifier(table));
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_clause(conditions));
        }
        sql
    }

    pub fn select_sql(&self, table: &str, order_by: Option<(&str, &str)>) -> String {
        let mut sql = format!("SELECT * FROM {}", self.quote_identifier(table));
        if let Some((column, direction)) = order_by {
            sql.push_str(&format!(" ORDER BY {} {}", self.quote_identifier(column), direction));
        }
        sql
    }

    fn where_clause(&self, conditions: &[&str]) -> String {
        conditions
            .iter()
            .enumerate()
            .map(|(i, column)| {
                format!("{} = {}", self.quote_identifier(column), self.parameter_placeholder(i))
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}
