//! SQLite database backend using `rusqlite`.
//!
//! [`SqliteEngine`] opens [`SqliteBackend`] connections for aliases whose
//! engine is `djorm.db.backends.sqlite3`. The name `:memory:` opens a
//! private in-memory database; the wrapper keeps such a connection open for
//! the life of the alias, since closing it would discard the data.
//!
//! Foreign keys are enforced on every connection. SQLite ignores
//! `PRAGMA foreign_keys` inside a transaction, so re-enabling checks while
//! one is open is deferred until it commits or rolls back.

use std::path::{Path, PathBuf};

use djorm_core::settings::SQLITE_ENGINE;
use djorm_core::{DatabaseSettings, DjormError, DjormResult};
use djorm_db::backend::{DatabaseBackend, DatabaseEngine};
use djorm_db::query::compiler::{quote_name, DatabaseBackendType};
use djorm_db::query::Row;
use djorm_db::value::Value;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::ErrorCode;

const MEMORY: &str = ":memory:";

fn is_memory_name(name: &str) -> bool {
    name == MEMORY || name.starts_with("file::memory:") || name.contains("mode=memory")
}

/// Opens SQLite connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteEngine;

impl DatabaseEngine for SqliteEngine {
    fn name(&self) -> &str {
        SQLITE_ENGINE
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn connect(&self, settings: &DatabaseSettings) -> DjormResult<Box<dyn DatabaseBackend>> {
        if settings.name.is_empty() {
            return Err(DjormError::ImproperlyConfigured(
                "Please fill out the database NAME in the settings module before using the database."
                    .to_string(),
            ));
        }
        tracing::debug!(name = %settings.name, "opening sqlite connection");
        Ok(Box::new(SqliteBackend::open(&settings.name)?))
    }

    fn keeps_connection_open(&self, settings: &DatabaseSettings) -> bool {
        is_memory_name(&settings.name)
    }

    fn is_in_memory(&self, settings: &DatabaseSettings) -> bool {
        is_memory_name(&settings.name)
    }

    fn destroy_database(&self, settings: &DatabaseSettings) -> DjormResult<()> {
        if is_memory_name(&settings.name) {
            return Ok(());
        }
        let path = Path::new(&settings.name);
        if path.exists() {
            tracing::info!(name = %settings.name, "removing sqlite database file");
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// A single SQLite connection.
pub struct SqliteBackend {
    /// The path to the database file (or ":memory:").
    path: PathBuf,
    conn: rusqlite::Connection,
    /// Foreign keys were re-enabled while a transaction was open.
    restore_foreign_keys: bool,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .field("in_transaction", &!self.conn.is_autocommit())
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Opens the database at `path`, creating the file if needed.
    ///
    /// WAL journal mode is requested for file databases.
    pub fn open(path: impl Into<PathBuf>) -> DjormResult<Self> {
        let path = path.into();
        let in_memory = path.to_str().is_some_and(is_memory_name);
        let conn = if path.to_str() == Some(MEMORY) {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| DjormError::OperationalError(format!("SQLite open failed: {e}")))?;

        let pragmas = if in_memory {
            "PRAGMA foreign_keys=ON;"
        } else {
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;"
        };
        conn.execute_batch(pragmas)
            .map_err(|e| DjormError::OperationalError(format!("Failed to set pragmas: {e}")))?;

        Ok(Self {
            path,
            conn,
            restore_foreign_keys: false,
        })
    }

    /// Opens a private in-memory database.
    pub fn memory() -> DjormResult<Self> {
        Self::open(MEMORY)
    }

    /// Returns the database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn set_foreign_keys(&self, on: bool) -> DjormResult<()> {
        let pragma = if on {
            "PRAGMA foreign_keys=ON"
        } else {
            "PRAGMA foreign_keys=OFF"
        };
        self.conn.execute_batch(pragma).map_err(map_error)
    }

    fn end_transaction(&mut self, sql: &str) -> DjormResult<()> {
        self.conn.execute_batch(sql).map_err(map_error)?;
        if self.restore_foreign_keys {
            self.restore_foreign_keys = false;
            self.set_foreign_keys(true)?;
        }
        Ok(())
    }
}

/// Converts an ORM value to a value `rusqlite` can bind.
///
/// Dates and times are stored as ISO-8601 text so SQLite's date functions
/// understand them.
fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Float(v) => SqlValue::Real(*v),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
        Value::DateTime(dt) => SqlValue::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::Time(t) => SqlValue::Text(t.format("%H:%M:%S%.f").to_string()),
        Value::Uuid(u) => SqlValue::Text(u.to_string()),
        Value::Json(j) => SqlValue::Text(j.to_string()),
        Value::List(vals) => SqlValue::Text(
            serde_json::to_string(&vals.iter().map(ToString::to_string).collect::<Vec<_>>())
                .unwrap_or_default(),
        ),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn map_error(err: rusqlite::Error) -> DjormError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => DjormError::IntegrityError(err.to_string()),
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::ReadOnly
            | ErrorCode::DiskFull,
        ) => DjormError::OperationalError(err.to_string()),
        _ => DjormError::DatabaseError(err.to_string()),
    }
}

impl DatabaseBackend for SqliteBackend {
    fn vendor(&self) -> &str {
        "sqlite"
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> DjormResult<u64> {
        let mut stmt = self.conn.prepare(sql).map_err(map_error)?;
        let count = stmt
            .execute(rusqlite::params_from_iter(params.iter().map(to_sql)))
            .map_err(map_error)?;
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> DjormResult<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql).map_err(map_error)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut raw_rows = stmt
            .query(rusqlite::params_from_iter(params.iter().map(to_sql)))
            .map_err(map_error)?;

        let mut rows = Vec::new();
        while let Some(raw) = raw_rows.next().map_err(map_error)? {
            let values = (0..columns.len())
                .map(|i| raw.get_ref(i).map(from_sql).map_err(map_error))
                .collect::<DjormResult<Vec<Value>>>()?;
            rows.push(Row::new(columns.clone(), values));
        }
        Ok(rows)
    }

    fn insert_returning_id(&mut self, sql: &str, params: &[Value]) -> DjormResult<Value> {
        self.execute(sql, params)?;
        Ok(Value::Int(self.conn.last_insert_rowid()))
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn commit(&mut self) -> DjormResult<()> {
        self.end_transaction("COMMIT")
    }

    fn rollback(&mut self) -> DjormResult<()> {
        self.end_transaction("ROLLBACK")
    }

    fn disable_constraint_checking(&mut self) -> DjormResult<bool> {
        if self.in_transaction() {
            return Ok(false);
        }
        self.set_foreign_keys(false)?;
        Ok(true)
    }

    fn enable_constraint_checking(&mut self) -> DjormResult<()> {
        if self.in_transaction() {
            self.restore_foreign_keys = true;
            return Ok(());
        }
        self.set_foreign_keys(true)
    }

    fn check_constraints(&mut self, table_names: &[String]) -> DjormResult<()> {
        for table in table_names {
            let sql = format!("PRAGMA foreign_key_check({})", quote_name(table));
            let rows = self.query(&sql, &[])?;
            if let Some(row) = rows.first() {
                let rowid: Option<i64> = row.get_by_index(1)?;
                let parent: String = row.get_by_index(2)?;
                let rowid = rowid.map_or_else(|| "?".to_string(), |id| id.to_string());
                return Err(DjormError::IntegrityError(format!(
                    "The row in table '{table}' with primary key '{rowid}' has an invalid \
                     foreign key: it does not have a corresponding row in '{parent}'."
                )));
            }
        }
        Ok(())
    }

    fn table_names(&mut self) -> DjormResult<Vec<String>> {
        let rows = self.query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )?;
        rows.iter().map(|row| row.get_by_index::<String>(0)).collect()
    }
}
