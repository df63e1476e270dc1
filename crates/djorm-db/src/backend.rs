//! The seam between the ORM and concrete database drivers.
//!
//! A [`DatabaseEngine`] is registered once per engine name and opens
//! physical connections; each connection is a [`DatabaseBackend`] owned by
//! exactly one [`DatabaseWrapper`](crate::connection::DatabaseWrapper).
//! Everything is synchronous: calls block until the driver answers.
//!
//! Concrete implementations live in the `djorm-db-backends` crate.

use djorm_core::settings::DatabaseSettings;
use djorm_core::DjormResult;

use crate::query::compiler::{DatabaseBackendType, Row, SqlCompiler};
use crate::value::Value;

/// One physical database connection.
pub trait DatabaseBackend: Send {
    /// Returns the vendor name (e.g. "sqlite").
    fn vendor(&self) -> &str;

    /// Returns the dialect used by the SQL compiler.
    fn backend_type(&self) -> DatabaseBackendType;

    /// Runs a statement that returns no rows. Returns the affected row count.
    fn execute(&mut self, sql: &str, params: &[Value]) -> DjormResult<u64>;

    /// Runs a query and returns all rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> DjormResult<Vec<Row>>;

    /// Runs an INSERT and returns the generated primary key.
    fn insert_returning_id(&mut self, sql: &str, params: &[Value]) -> DjormResult<Value>;

    /// Returns `true` while a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Opens a transaction.
    fn begin(&mut self) -> DjormResult<()> {
        self.execute("BEGIN", &[]).map(drop)
    }

    /// Commits the open transaction.
    fn commit(&mut self) -> DjormResult<()> {
        self.execute("COMMIT", &[]).map(drop)
    }

    /// Rolls back the open transaction.
    fn rollback(&mut self) -> DjormResult<()> {
        self.execute("ROLLBACK", &[]).map(drop)
    }

    /// Creates a savepoint.
    fn savepoint_create(&mut self, sid: &str) -> DjormResult<()> {
        self.execute(&format!("SAVEPOINT \"{sid}\""), &[]).map(drop)
    }

    /// Rolls back to a savepoint.
    fn savepoint_rollback(&mut self, sid: &str) -> DjormResult<()> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT \"{sid}\""), &[])
            .map(drop)
    }

    /// Releases a savepoint.
    fn savepoint_release(&mut self, sid: &str) -> DjormResult<()> {
        self.execute(&format!("RELEASE SAVEPOINT \"{sid}\""), &[])
            .map(drop)
    }

    /// Turns off referential checks. Returns `true` if they were turned off
    /// and must be re-enabled.
    fn disable_constraint_checking(&mut self) -> DjormResult<bool> {
        Ok(false)
    }

    /// Turns referential checks back on.
    fn enable_constraint_checking(&mut self) -> DjormResult<()> {
        Ok(())
    }

    /// Validates referential integrity of the given tables.
    fn check_constraints(&mut self, table_names: &[String]) -> DjormResult<()> {
        let _ = table_names;
        Ok(())
    }

    /// Lists the tables that exist in the database.
    fn table_names(&mut self) -> DjormResult<Vec<String>>;

    /// Returns a compiler for this backend's dialect.
    fn compiler(&self) -> SqlCompiler {
        SqlCompiler::new(self.backend_type())
    }
}

/// A driver that opens connections for one engine name.
pub trait DatabaseEngine: Send + Sync {
    /// The engine name settings refer to (e.g. `"djorm.db.backends.sqlite3"`).
    fn name(&self) -> &str;

    /// The dialect of connections this engine opens.
    fn backend_type(&self) -> DatabaseBackendType;

    /// Opens a physical connection.
    fn connect(&self, settings: &DatabaseSettings) -> DjormResult<Box<dyn DatabaseBackend>>;

    /// Returns `true` if closing a connection would destroy its data, in
    /// which case the wrapper keeps it open.
    fn keeps_connection_open(&self, settings: &DatabaseSettings) -> bool {
        let _ = settings;
        false
    }

    /// Returns `true` if the database lives only in memory.
    fn is_in_memory(&self, settings: &DatabaseSettings) -> bool {
        let _ = settings;
        false
    }

    /// Removes a database created for tests.
    fn destroy_database(&self, settings: &DatabaseSettings) -> DjormResult<()> {
        let _ = settings;
        Ok(())
    }
}
