//! SQLite implementation of the store adapter.

use std::path::Path;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Statement, Transaction, TransactionBehavior, params_from_iter};
use serde_json::{Number, Value};
use tracing::{debug, warn};

use super::{
    ColumnInfo, Conditions, ExecOutcome, Executor, IndexSpec, Inserted, QueryOptions, Record,
    Row, Store, StoreError, TableSpec, quote_ident,
};

/// Connection customizer to set PRAGMAs on every new connection
#[derive(Debug)]
struct SqliteCustomizer {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for SqliteCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub max_size: u32,
    pub busy_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 8,
            busy_timeout: Duration::from_secs(10),
        }
    }
}

fn validate_db_path(path: &Path) -> Result<(), StoreError> {
    match path.extension() {
        Some(ext) if ext == "db" => Ok(()),
        Some(_) => Err(StoreError::InvalidRequest(
            "Invalid database file extension (must be .db)".to_string(),
        )),
        None => Err(StoreError::InvalidRequest(
            "Database path must have .db extension".to_string(),
        )),
    }
}

fn build_placeholders(count: usize, offset: usize) -> String {
    (offset..offset + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(path: &Path, options: PoolOptions) -> Result<Self, StoreError> {
        validate_db_path(path)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(options.max_size.max(1))
            .connection_customizer(Box::new(SqliteCustomizer {
                busy_timeout: options.busy_timeout,
            }))
            .build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }

        debug!("store: opened {} (pool size {})", path.display(), options.max_size);
        Ok(Self { pool })
    }

    /// Private in-memory database. A single pooled connection keeps every
    /// caller on the same database, so it is never recycled.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let pool = Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .connection_customizer(Box::new(SqliteCustomizer {
                busy_timeout: PoolOptions::default().busy_timeout,
            }))
            .build(SqliteConnectionManager::memory())?;
        Ok(Self { pool })
    }
}

impl Store for SqliteStore {
    fn read<T, E>(&self, f: impl FnOnce(&dyn Executor) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let conn = self.pool.get().map_err(StoreError::from)?;
        let out = f(&*conn);
        // A connection must go back to the pool in autocommit mode.
        if !conn.is_autocommit() {
            warn!("store: statement left a transaction open, rolling back");
            conn.execute_batch("ROLLBACK").map_err(StoreError::from)?;
            return Err(StoreError::InvalidRequest(
                "statement left a transaction open".to_string(),
            )
            .into());
        }
        out
    }

    fn transaction<T, E>(&self, f: impl FnOnce(&dyn Executor) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let conn = self.pool.get().map_err(StoreError::from)?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        // Dropping `tx` on the error path rolls back.
        let out = f(&*tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}

fn collect_rows(stmt: &mut Statement<'_>, params: Vec<SqlValue>) -> Result<Vec<Row>, StoreError> {
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::new();
        for (i, name) in names.iter().enumerate() {
            map.insert(name.clone(), from_sql_ref(row.get_ref(i)?));
        }
        out.push(map);
    }
    Ok(out)
}

/// Appends `WHERE ...` for `conditions` to `sql`, numbering placeholders
/// after the `params` already bound.
fn push_where(
    sql: &mut String,
    conditions: &Conditions,
    params: &mut Vec<SqlValue>,
) -> Result<(), StoreError> {
    if conditions.is_empty() {
        return Ok(());
    }
    let mut clauses = Vec::new();
    for (column, value) in conditions.iter() {
        let column = quote_ident(column)?;
        if value.is_null() {
            clauses.push(format!("{} IS NULL", column));
        } else {
            params.push(to_sql_value(value));
            clauses.push(format!("{} = ?{}", column, params.len()));
        }
    }
    sql.push_str(" WHERE ");
    sql.push_str(&clauses.join(" AND "));
    Ok(())
}

impl Executor for Connection {
    fn create_table(&self, spec: &TableSpec) -> Result<(), StoreError> {
        let sql = spec.to_sql()?;
        debug!("store: {}", sql);
        self.execute(&sql, [])?;
        Ok(())
    }

    fn create_index(&self, spec: &IndexSpec) -> Result<(), StoreError> {
        let sql = spec.to_sql()?;
        debug!("store: {}", sql);
        self.execute(&sql, [])?;
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<(), StoreError> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)?), [])?;
        Ok(())
    }

    fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let mut stmt = self.prepare(&format!("PRAGMA table_info({})", quote_ident(table)?))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    column_type: row.get(2)?,
                    not_null: row.get::<_, i64>(3)? != 0,
                    default_value: row.get(4)?,
                    primary_key: row.get::<_, i64>(5)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Err(StoreError::InvalidRequest(format!("no such table: {}", table)));
        }
        Ok(columns)
    }

    fn insert(&self, table: &str, records: &[Record]) -> Result<Inserted, StoreError> {
        let table = quote_ident(table)?;
        let mut count = 0;
        for record in records {
            let sql = if record.is_empty() {
                format!("INSERT INTO {} DEFAULT VALUES", table)
            } else {
                let columns = record
                    .keys()
                    .map(|c| quote_ident(c))
                    .collect::<Result<Vec<_>, _>>()?;
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    columns.join(", "),
                    build_placeholders(columns.len(), 1)
                )
            };
            let mut stmt = self.prepare_cached(&sql)?;
            count += stmt.execute(params_from_iter(record.values().map(to_sql_value)))?;
        }
        Ok(Inserted {
            count,
            last_id: (count > 0).then(|| self.last_insert_rowid()),
        })
    }

    fn query(
        &self,
        table: &str,
        conditions: &Conditions,
        options: &QueryOptions,
    ) -> Result<Vec<Row>, StoreError> {
        let mut sql = format!("SELECT * FROM {}", quote_ident(table)?);
        let mut params = Vec::new();
        push_where(&mut sql, conditions, &mut params)?;
        if let Some(order_by) = &options.order_by {
            sql.push_str(&format!(" ORDER BY {}", quote_ident(order_by)?));
            if options.descending {
                sql.push_str(" DESC");
            }
        }
        match (options.limit, options.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }
        let mut stmt = self.prepare_cached(&sql)?;
        collect_rows(&mut stmt, params)
    }

    fn update(
        &self,
        table: &str,
        conditions: &Conditions,
        fields: &Record,
    ) -> Result<usize, StoreError> {
        if fields.is_empty() {
            return Err(StoreError::InvalidRequest("no fields to update".to_string()));
        }
        let mut params = Vec::new();
        let mut assignments = Vec::new();
        for (column, value) in fields {
            params.push(to_sql_value(value));
            assignments.push(format!("{} = ?{}", quote_ident(column)?, params.len()));
        }
        let mut sql = format!(
            "UPDATE {} SET {}",
            quote_ident(table)?,
            assignments.join(", ")
        );
        push_where(&mut sql, conditions, &mut params)?;
        let mut stmt = self.prepare_cached(&sql)?;
        Ok(stmt.execute(params_from_iter(params))?)
    }

    fn delete(&self, table: &str, conditions: &Conditions) -> Result<usize, StoreError> {
        let mut sql = format!("DELETE FROM {}", quote_ident(table)?);
        let mut params = Vec::new();
        push_where(&mut sql, conditions, &mut params)?;
        let mut stmt = self.prepare_cached(&sql)?;
        Ok(stmt.execute(params_from_iter(params))?)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecOutcome, StoreError> {
        let mut stmt = self.prepare(sql)?;
        let params: Vec<SqlValue> = params.iter().map(to_sql_value).collect();
        if stmt.column_count() > 0 {
            Ok(ExecOutcome::Rows(collect_rows(&mut stmt, params)?))
        } else {
            Ok(ExecOutcome::Affected(stmt.execute(params_from_iter(params))?))
        }
    }
}
