//! Relational backend adapter over SQLite.
//!
//! Table schemas, transaction scoping, and the mapping between JSON values and
//! SQL values. Everything above this module speaks `serde_json::Value`.

use crate::error::{DocStoreError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Transaction};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// Upper bound on bound parameters in a single membership predicate.
pub const MAX_IN_PARAMS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Integer primary key assigned by the backend on insert.
    AutoIncrementId,
    Integer,
    Real,
    Text,
    /// Stored as 0/1, read back as a JSON boolean.
    Boolean,
    /// Stored as RFC 3339 text.
    Timestamp,
    Blob,
}

impl ColumnType {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::AutoIncrementId => "INTEGER PRIMARY KEY AUTOINCREMENT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text | ColumnType::Timestamp => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub indexed: bool,
    pub nullable: bool,
    pub unique: bool,
}

impl Column {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Column {
            name: name.to_string(),
            column_type,
            indexed: false,
            nullable: true,
            unique: false,
        }
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    fn definition(&self) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.column_type.sql_type());
        if self.column_type != ColumnType::AutoIncrementId {
            if !self.nullable {
                def.push_str(" NOT NULL");
            }
            if self.unique {
                def.push_str(" UNIQUE");
            }
        }
        def
    }
}

/// An ordered set of typed columns bound to a table name.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(name: &str, columns: Vec<Column>) -> Self {
        TableSchema {
            name: name.to_string(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Check identifiers, column uniqueness, and the single-primary-key rule.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        if self.columns.is_empty() {
            return Err(DocStoreError::Schema(format!(
                "table '{}' has no columns",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            validate_identifier(&column.name)?;
            if !seen.insert(column.name.as_str()) {
                return Err(DocStoreError::Schema(format!(
                    "duplicate column '{}' in table '{}'",
                    column.name, self.name
                )));
            }
        }

        let primary_keys = self
            .columns
            .iter()
            .filter(|c| c.column_type == ColumnType::AutoIncrementId)
            .count();
        if primary_keys > 1 {
            return Err(DocStoreError::Schema(format!(
                "table '{}' declares {primary_keys} auto-increment columns",
                self.name
            )));
        }
        Ok(())
    }

    /// `CREATE TABLE` followed by one `CREATE INDEX` per indexed column.
    pub fn create_statements(&self) -> Vec<String> {
        let columns: Vec<String> = self.columns.iter().map(Column::definition).collect();
        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name),
            columns.join(", ")
        )];

        for column in self.columns.iter().filter(|c| c.indexed) {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&format!("ix_{}_{}", self.name, column.name)),
                quote_ident(&self.name),
                quote_ident(&column.name)
            ));
        }
        statements
    }
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid && !name.to_ascii_lowercase().starts_with("sqlite_") {
        Ok(())
    } else {
        Err(DocStoreError::Schema(format!("invalid identifier '{name}'")))
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// Canonical text form of stored timestamps.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `?, ?, ?` for `n` parameters.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// The SQLite connection backing a store.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Database { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Database { conn })
    }

    /// Create every table and index that does not exist yet, atomically.
    pub fn create_all(&self, tables: &[&TableSchema]) -> Result<()> {
        let tx = self.transaction()?;
        for table in tables {
            table.validate()?;
            for statement in table.create_statements() {
                tx.execute_batch(&statement)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Begin a transaction. Dropping it without `commit` rolls back.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    /// The connection for reads outside an explicit transaction.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Convert a JSON value into the SQL value stored in `column`.
pub fn to_sql_value(column: &Column, value: &Value) -> Result<SqlValue> {
    let invalid = |reason: String| DocStoreError::InvalidValue {
        column: column.name.clone(),
        reason,
    };

    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    match column.column_type {
        ColumnType::AutoIncrementId | ColumnType::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .map(SqlValue::Integer)
                .ok_or_else(|| invalid(format!("{n} is not a 64-bit integer"))),
            Value::String(s) => s
                .parse::<i64>()
                .map(SqlValue::Integer)
                .map_err(|_| invalid(format!("'{s}' is not an integer"))),
            other => Err(invalid(format!("expected integer, got {other}"))),
        },
        ColumnType::Real => match value {
            Value::Number(n) => n
                .as_f64()
                .map(SqlValue::Real)
                .ok_or_else(|| invalid(format!("{n} is not a number"))),
            Value::String(s) => s
                .parse::<f64>()
                .map(SqlValue::Real)
                .map_err(|_| invalid(format!("'{s}' is not a number"))),
            other => Err(invalid(format!("expected number, got {other}"))),
        },
        ColumnType::Text => match value {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
            Value::Bool(b) => Ok(SqlValue::Text(b.to_string())),
            other => Err(invalid(format!("expected text, got {other}"))),
        },
        ColumnType::Boolean => match value {
            Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
            Value::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => {
                Ok(SqlValue::Integer(n.as_i64().unwrap_or_default()))
            }
            other => Err(invalid(format!("expected boolean, got {other}"))),
        },
        ColumnType::Timestamp => match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|ts| SqlValue::Text(format_timestamp(&ts.with_timezone(&Utc))))
                .map_err(|e| invalid(format!("'{s}' is not an RFC 3339 timestamp: {e}"))),
            other => Err(invalid(format!("expected timestamp string, got {other}"))),
        },
        ColumnType::Blob => match value {
            Value::String(s) => Ok(SqlValue::Blob(s.as_bytes().to_vec())),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| invalid(format!("{item} is not a byte")))
                })
                .collect::<Result<Vec<u8>>>()
                .map(SqlValue::Blob),
            other => Err(invalid(format!("expected bytes, got {other}"))),
        },
    }
}

/// Convert a stored SQL value back to JSON, guided by the column type.
pub fn from_sql_value(column_type: ColumnType, value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(n) if column_type == ColumnType::Boolean => Value::Bool(n != 0),
        SqlValue::Integer(n) => Value::Number(n.into()),
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
    }
}
