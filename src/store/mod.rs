//! Relational store adapter.
//!
//! A small CRUD contract over one embedded SQLite database. The graph memory
//! engine and the database tools only ever talk to the [`Executor`] trait, and
//! get one from a [`Store`] either plainly or inside a transaction.

pub mod schema;
pub mod sqlite;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub use schema::{ColumnInfo, ColumnSpec, IndexSpec, TableSpec};
pub use sqlite::SqliteStore;

/// One row as returned by a query: column name to JSON value.
pub type Row = Map<String, Value>;

/// Column values for an insert or an update.
pub type Record = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid identifier '{0}' (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidIdentifier(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed row: {0}")]
    MalformedRow(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::InvalidIdentifier(_) | StoreError::InvalidRequest(_) => "VALIDATION_ERROR",
            _ => "STORE_ERROR",
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

/// Conjunction of `column = value` tests. A `null` value tests `IS NULL`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    clauses: Vec<(String, Value)>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((column.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.clauses.iter().map(|(c, v)| (c.as_str(), v))
    }
}

impl From<Map<String, Value>> for Conditions {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            clauses: map.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryOptions {
    pub fn ordered_by(column: impl Into<String>) -> Self {
        Self {
            order_by: Some(column.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inserted {
    pub count: usize,
    /// Rowid of the last inserted record, if anything was inserted.
    pub last_id: Option<i64>,
}

/// Result of a raw statement: rows for anything that yields columns,
/// an affected-row count otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExecOutcome {
    Rows(Vec<Row>),
    Affected(usize),
}

/// The CRUD contract. Object safe so closures can take `&dyn Executor`.
pub trait Executor {
    fn create_table(&self, spec: &TableSpec) -> Result<(), StoreError>;
    fn create_index(&self, spec: &IndexSpec) -> Result<(), StoreError>;
    fn drop_table(&self, table: &str) -> Result<(), StoreError>;
    fn list_tables(&self) -> Result<Vec<String>, StoreError>;
    fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError>;

    fn insert(&self, table: &str, records: &[Record]) -> Result<Inserted, StoreError>;
    fn query(
        &self,
        table: &str,
        conditions: &Conditions,
        options: &QueryOptions,
    ) -> Result<Vec<Row>, StoreError>;
    fn update(
        &self,
        table: &str,
        conditions: &Conditions,
        fields: &Record,
    ) -> Result<usize, StoreError>;
    fn delete(&self, table: &str, conditions: &Conditions) -> Result<usize, StoreError>;
    fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecOutcome, StoreError>;
}

/// Hands out executors. Implementations decide what a transaction means;
/// the SQLite store uses one IMMEDIATE transaction per call.
pub trait Store: Clone + Send + Sync + 'static {
    /// Runs `f` in autocommit mode. A transaction `f` leaves open is rolled
    /// back and reported as `InvalidRequest`.
    fn read<T, E>(&self, f: impl FnOnce(&dyn Executor) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>;

    /// Runs `f` atomically: commit on `Ok`, roll back on `Err`.
    fn transaction<T, E>(&self, f: impl FnOnce(&dyn Executor) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>;
}

/// Checks that `name` is a plain SQL identifier and returns it double-quoted.
pub fn quote_ident(name: &str) -> Result<String, StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !valid {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quote_ident_accepts_plain_names() {
        assert_eq!(quote_ident("entities").unwrap(), "\"entities\"");
        assert_eq!(quote_ident("_tmp_1").unwrap(), "\"_tmp_1\"");
    }

    #[test]
    fn quote_ident_rejects_injection() {
        for bad in ["", "1abc", "a b", "x\"; DROP TABLE y; --", "naïve"] {
            assert!(
                matches!(quote_ident(bad), Err(StoreError::InvalidIdentifier(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn conditions_from_map_keep_every_clause() {
        let map = json!({ "a": 1, "b": null }).as_object().unwrap().clone();
        let conditions = Conditions::from(map);
        let cols: Vec<_> = conditions.iter().map(|(c, _)| c.to_string()).collect();
        assert_eq!(cols, vec!["a", "b"]);
    }
}
