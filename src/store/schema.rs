//! Table and index definitions and their DDL.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{StoreError, quote_ident};

const COLUMN_TYPES: &[&str] = &[
    "TEXT", "INTEGER", "INT", "REAL", "BLOB", "NUMERIC", "BOOLEAN", "DATE", "DATETIME",
    "TIMESTAMP", "VARCHAR", "CHAR", "FLOAT", "DOUBLE", "DECIMAL", "JSON",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    /// Column name
    pub name: String,
    /// SQLite type, e.g. "TEXT", "INTEGER", "VARCHAR(64)"
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub primary_key: bool,
    /// Only valid on an INTEGER PRIMARY KEY column
    #[serde(default)]
    pub autoincrement: bool,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub unique: bool,
    /// Literal default value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            primary_key: false,
            autoincrement: false,
            not_null: false,
            unique: false,
            default: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    fn to_sql(&self) -> Result<String, StoreError> {
        let mut sql = format!(
            "{} {}",
            quote_ident(&self.name)?,
            normalize_column_type(&self.column_type)?
        );
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
            if self.autoincrement {
                sql.push_str(" AUTOINCREMENT");
            }
        } else if self.autoincrement {
            return Err(StoreError::InvalidRequest(format!(
                "column '{}': AUTOINCREMENT requires PRIMARY KEY",
                self.name
            )));
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&sql_literal(default));
        }
        Ok(sql)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// `CREATE TABLE IF NOT EXISTS`, so creating an existing table is a no-op.
    pub fn to_sql(&self) -> Result<String, StoreError> {
        if self.columns.is_empty() {
            return Err(StoreError::InvalidRequest(format!(
                "table '{}' needs at least one column",
                self.name
            )));
        }
        let columns = self
            .columns
            .iter()
            .map(ColumnSpec::to_sql)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name)?,
            columns.join(", ")
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
}

impl IndexSpec {
    pub fn new(name: &str, table: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn to_sql(&self) -> Result<String, StoreError> {
        if self.columns.is_empty() {
            return Err(StoreError::InvalidRequest(format!(
                "index '{}' needs at least one column",
                self.name
            )));
        }
        let columns = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&self.name)?,
            quote_ident(&self.table)?,
            columns.join(", ")
        ))
    }
}

/// One line of `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// Accepts a known type name, optionally sized: `VARCHAR(64)`, `DECIMAL(10,2)`.
fn normalize_column_type(raw: &str) -> Result<String, StoreError> {
    let upper = raw.trim().to_ascii_uppercase();
    let (base, size) = match upper.split_once('(') {
        Some((base, rest)) => {
            let size = rest
                .strip_suffix(')')
                .ok_or_else(|| invalid_type(raw))?;
            let well_formed = size
                .split(',')
                .all(|part| !part.trim().is_empty() && part.trim().chars().all(|c| c.is_ascii_digit()));
            if !well_formed {
                return Err(invalid_type(raw));
            }
            (base.trim().to_string(), Some(size.replace(' ', "")))
        }
        None => (upper.clone(), None),
    };
    if !COLUMN_TYPES.contains(&base.as_str()) {
        return Err(invalid_type(raw));
    }
    Ok(match size {
        Some(size) => format!("{}({})", base, size),
        None => base,
    })
}

fn invalid_type(raw: &str) -> StoreError {
    StoreError::InvalidRequest(format!("unsupported column type '{}'", raw))
}

/// Renders a JSON value as an SQL literal. Used only where binding is impossible
/// (DDL defaults) or for SQL export.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}
