//! SQL file migrations
//!
//! A migration can be a plain `.sql` file named after the migration, e.g.
//! `CreateUsers1700000000000.sql`, with its statements split into sections:
//!
//! ```sql
//! -- up
//! CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);
//! -- down
//! DROP TABLE users;
//! ```
//!
//! A `-- transaction: false` line sets the per-migration transaction override.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Location, Token, TokenWithLocation, Tokenizer};

use super::definitions::Migration;
use crate::backends::QueryRunner;
use crate::error::{OrmError, OrmResult};

/// A migration made of raw SQL statements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlMigration {
    name: String,
    up_sql: String,
    down_sql: String,
    transaction: Option<bool>,
}

impl SqlMigration {
    pub fn new(name: impl Into<String>, up_sql: impl Into<String>, down_sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql: down_sql.into(),
            transaction: None,
        }
    }

    pub fn with_transaction(mut self, transaction: bool) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn up_sql(&self) -> &str {
        &self.up_sql
    }

    pub fn down_sql(&self) -> &str {
        &self.down_sql
    }

    /// Parse migration content with `-- up` / `-- down` sections
    pub fn parse(name: impl Into<String>, content: &str) -> OrmResult<Self> {
        let name = name.into();
        let mut up_sql = Vec::new();
        let mut down_sql = Vec::new();
        let mut transaction = None;
        let mut section = None;

        for line in content.lines() {
            let trimmed = line.trim();
            let lowered = trimmed.to_lowercase();

            if let Some(directive) = lowered.strip_prefix("--") {
                let directive = directive.trim();
                if directive == "up" {
                    section = Some(true);
                } else if directive == "down" {
                    section = Some(false);
                } else if let Some(value) = directive.strip_prefix("transaction:") {
                    transaction = Some(match value.trim() {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(OrmError::Configuration(format!(
                                "{}: invalid transaction directive '{}', expected true or false",
                                name, other
                            )))
                        }
                    });
                }
                continue;
            }

            if trimmed.is_empty() {
                continue;
            }

            match section {
                Some(true) => up_sql.push(line),
                Some(false) => down_sql.push(line),
                None => {}
            }
        }

        if up_sql.is_empty() {
            return Err(OrmError::Configuration(format!(
                "{} has no statements in its '-- up' section",
                name
            )));
        }

        Ok(Self {
            name,
            up_sql: up_sql.join("\n"),
            down_sql: down_sql.join("\n"),
            transaction,
        })
    }

    /// Load a migration file; the file stem is the migration name
    pub fn from_file(path: &Path) -> OrmResult<Self> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                OrmError::Configuration(format!("Invalid migration filename: {}", path.display()))
            })?;

        let content = fs::read_to_string(path).map_err(|e| {
            OrmError::Configuration(format!(
                "Failed to read migration file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::parse(name, &content)
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn transaction(&self) -> Option<bool> {
        self.transaction
    }

    async fn up(&self, runner: &mut dyn QueryRunner) -> OrmResult<()> {
        for statement in split_sql_statements(&self.up_sql) {
            runner.execute(&statement, &[]).await?;
        }
        Ok(())
    }

    async fn down(&self, runner: &mut dyn QueryRunner) -> OrmResult<()> {
        for statement in split_sql_statements(&self.down_sql) {
            runner.execute(&statement, &[]).await?;
        }
        Ok(())
    }
}

/// Load every `.sql` migration in a directory
///
/// A missing directory yields no migrations. Files are returned sorted by
/// file name; the executor orders them by timestamp.
pub fn load_sql_migrations(dir: impl AsRef<Path>) -> OrmResult<Vec<Arc<dyn Migration>>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|e| {
        OrmError::Configuration(format!(
            "Failed to read migrations directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| OrmError::Configuration(format!("Failed to read directory entry: {}", e)))?
            .path();
        if path.extension().map_or(false, |ext| ext == "sql") {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|path| Ok(Arc::new(SqlMigration::from_file(path)?) as Arc<dyn Migration>))
        .collect()
}

/// Split SQL into statements, keeping each statement's source text
///
/// Statements end at `;` tokens, so semicolons inside string literals,
/// quoted identifiers, comments and dollar-quoted bodies stay put. Inside
/// `CREATE TRIGGER`/`FUNCTION`/`PROCEDURE` statements a `;` between
/// `BEGIN` and `END` belongs to the body. SQL the tokenizer rejects is
/// returned as a single statement for the database to report on.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let tokens = match Tokenizer::new(&GenericDialect {}, sql).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::warn!("SQL tokenizing failed, executing the section as one statement: {}", e);
            let whole = sql.trim().trim_end_matches(';').trim();
            return if whole.is_empty() {
                Vec::new()
            } else {
                vec![whole.to_string()]
            };
        }
    };

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect();

    let mut statements = Vec::new();
    let mut start = 0;
    let mut leading = Vec::new();
    let mut block_depth = 0usize;
    let mut has_content = false;

    for TokenWithLocation { token, location } in &tokens {
        match token {
            Token::Whitespace(_) => {}
            Token::SemiColon if block_depth == 0 => {
                let end = byte_offset(sql, &line_starts, location);
                if has_content {
                    statements.push(sql[start..end].trim().to_string());
                }
                start = end + 1;
                leading.clear();
                has_content = false;
            }
            Token::Word(word) => {
                has_content = true;
                if word.quote_style.is_some() {
                    continue;
                }
                if leading.len() < 5 {
                    leading.push(word.keyword);
                }
                if defines_routine(&leading) {
                    match word.keyword {
                        Keyword::BEGIN | Keyword::CASE => block_depth += 1,
                        Keyword::END => block_depth = block_depth.saturating_sub(1),
                        _ => {}
                    }
                }
            }
            _ => has_content = true,
        }
    }

    if has_content && start < sql.len() {
        statements.push(sql[start..].trim().to_string());
    }
    statements
}

/// Whether the leading keywords open a statement with a `BEGIN ... END` body
fn defines_routine(leading: &[Keyword]) -> bool {
    matches!(leading.first(), Some(Keyword::CREATE))
        && leading[1..]
            .iter()
            .any(|k| matches!(k, Keyword::TRIGGER | Keyword::FUNCTION | Keyword::PROCEDURE))
}

/// Byte offset of a tokenizer location (1-based line and character column)
fn byte_offset(sql: &str, line_starts: &[usize], location: &Location) -> usize {
    let Some(&line_start) = line_starts.get((location.line as usize).saturating_sub(1)) else {
        return sql.len();
    };
    sql[line_start..]
        .char_indices()
        .nth((location.column as usize).saturating_sub(1))
        .map_or(sql.len(), |(i, _)| line_start + i)
}
