//! Bulk import and export of table contents (JSON, CSV, SQL statements).

use std::path::{Component, Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::schema::sql_literal;
use crate::store::{Conditions, Executor, Inserted, QueryOptions, Record, StoreError, quote_ident};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid import content: {0}")]
    InvalidContent(String),

    #[error("access denied - path outside {}: {}", root.display(), path.display())]
    PathDenied { path: PathBuf, root: PathBuf },
}

impl TransferError {
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::Store(_) => "STORE_ERROR",
            TransferError::Io(_) => "IO_ERROR",
            TransferError::Csv(_)
            | TransferError::Json(_)
            | TransferError::InvalidContent(_)
            | TransferError::PathDenied { .. } => "VALIDATION_ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Array of row objects
    Json,
    /// Header row plus one line per row
    Csv,
    /// One INSERT statement per row
    Sql,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImportFormat {
    /// Array of objects, keys are column names
    Json,
    /// Header row names the columns
    Csv,
}

/// Renders every row of `table`. Columns keep their declared order.
pub fn export_table(
    db: &dyn Executor,
    table: &str,
    format: ExportFormat,
) -> Result<String, TransferError> {
    let columns: Vec<String> = db
        .describe_table(table)?
        .into_iter()
        .map(|c| c.name)
        .collect();
    let rows = db.query(table, &Conditions::new(), &QueryOptions::default())?;

    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(&rows)?),
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer.write_record(&columns)?;
            for row in &rows {
                writer.write_record(
                    columns
                        .iter()
                        .map(|c| csv_field(row.get(c).unwrap_or(&Value::Null))),
                )?;
            }
            let bytes = writer
                .into_inner()
                .map_err(|e| TransferError::Io(e.into_error()))?;
            String::from_utf8(bytes)
                .map_err(|e| TransferError::InvalidContent(format!("non-UTF-8 output: {}", e)))
        }
        ExportFormat::Sql => {
            let table_ident = quote_ident(table)?;
            let column_list = columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Result<Vec<_>, _>>()?
                .join(", ");
            let mut out = String::new();
            for row in &rows {
                let values = columns
                    .iter()
                    .map(|c| sql_literal(row.get(c).unwrap_or(&Value::Null)))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!(
                    "INSERT INTO {} ({}) VALUES ({});\n",
                    table_ident, column_list, values
                ));
            }
            Ok(out)
        }
    }
}

fn csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses `content` and inserts every record. Run it inside a store
/// transaction to make the import all-or-nothing.
pub fn import_records(
    db: &dyn Executor,
    table: &str,
    format: ImportFormat,
    content: &str,
) -> Result<Inserted, TransferError> {
    let records = match format {
        ImportFormat::Json => parse_json_records(content)?,
        ImportFormat::Csv => parse_csv_records(content)?,
    };
    if records.is_empty() {
        return Err(TransferError::InvalidContent("no records to import".to_string()));
    }
    Ok(db.insert(table, &records)?)
}

fn parse_json_records(content: &str) -> Result<Vec<Record>, TransferError> {
    match serde_json::from_str::<Value>(content)? {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(record) => Ok(record),
                _ => Err(TransferError::InvalidContent(format!(
                    "element {} is not an object",
                    i
                ))),
            })
            .collect(),
        _ => Err(TransferError::InvalidContent(
            "expected a JSON array of objects".to_string(),
        )),
    }
}

/// Empty cells become NULL; everything else is bound as text and left to
/// column affinity.
fn parse_csv_records(content: &str) -> Result<Vec<Record>, TransferError> {
    let mut reader = csv::Reader::from_reader(content.as_bytes());
    let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut record = Record::new();
        for (column, cell) in headers.iter().zip(row.iter()) {
            let value = if cell.is_empty() {
                Value::Null
            } else {
                Value::String(cell.to_string())
            };
            record.insert(column.clone(), value);
        }
        records.push(record);
    }
    Ok(records)
}

/// Collapse `.`/`..` without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => continue,
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves a requested import/export path inside `root`.
///
/// Relative paths are taken from `root`. The real path of the file, or of
/// its nearest existing ancestor when the file does not exist yet, must
/// lie under the real path of `root`.
pub fn resolve_transfer_path(root: &Path, requested: &str) -> Result<PathBuf, TransferError> {
    let root = root.canonicalize()?;
    let normalized = normalize_path(&root.join(requested));

    let mut existing = normalized.as_path();
    while !existing.exists() {
        existing = match existing.parent() {
            Some(parent) => parent,
            None => {
                return Err(TransferError::PathDenied {
                    path: normalized.clone(),
                    root,
                });
            }
        };
    }

    let real = existing.canonicalize()?;
    if !real.starts_with(&root) {
        return Err(TransferError::PathDenied {
            path: normalized.clone(),
            root,
        });
    }
    match normalized.strip_prefix(existing) {
        Ok(rest) if !rest.as_os_str().is_empty() => Ok(real.join(rest)),
        _ => Ok(real),
    }
}

/// Writes an export to `path`, creating parent directories.
pub fn write_export(path: &Path, content: &str) -> Result<(), TransferError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}
