//! Connection wrappers and the transaction state machine.
//!
//! A [`DatabaseWrapper`] owns one lazily opened physical connection for a
//! database alias together with its transaction-management state: a stack
//! of "managed" flags (one per `enter_transaction_management` level) and a
//! dirty flag per level recording writes that still need a COMMIT or
//! ROLLBACK.
//!
//! In automatic mode every write is committed by `commit_unless_managed`.
//! In managed mode a transaction is opened lazily before the first
//! statement and stays open until the caller commits or rolls back.
//!
//! A wrapper belongs to the thread that created it. Transaction state is
//! never shared: each thread of execution builds its own
//! [`ConnectionHandler`].
//!
//! ```
//! use djorm_db::connection::DatabaseWrapper;
//! # use djorm_db::backend::{DatabaseBackend, DatabaseEngine};
//! # use djorm_db::query::compiler::DatabaseBackendType;
//! # use djorm_core::settings::DatabaseSettings;
//! # use std::sync::Arc;
//! # struct Nothing;
//! # impl DatabaseEngine for Nothing {
//! #     fn name(&self) -> &str { "nothing" }
//! #     fn backend_type(&self) -> DatabaseBackendType { DatabaseBackendType::SQLite }
//! #     fn connect(&self, _: &DatabaseSettings) -> djorm_core::DjormResult<Box<dyn DatabaseBackend>> {
//! #         Err(djorm_core::DjormError::OperationalError("offline".into()))
//! #     }
//! # }
//! let mut conn = DatabaseWrapper::new("default", DatabaseSettings::sqlite_memory(), Arc::new(Nothing));
//! conn.enter_transaction_management(true);
//! conn.managed(true).unwrap();
//! assert!(conn.is_managed());
//! conn.leave_transaction_management().unwrap();
//! assert!(!conn.is_managed());
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use djorm_core::logging::query_span;
use djorm_core::settings::{DatabaseSettings, Settings};
use djorm_core::{DjormError, DjormResult};

use crate::backend::{DatabaseBackend, DatabaseEngine};
use crate::query::compiler::{DatabaseBackendType, Row, SqlCompiler};
use crate::router::RouterChain;
use crate::value::Value;

/// One executed statement in the debug query log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    /// The SQL text.
    pub sql: String,
    /// Time spent in the backend.
    pub time: Duration,
}

/// A database connection for one alias plus its transaction state.
pub struct DatabaseWrapper {
    alias: String,
    settings: DatabaseSettings,
    engine: Arc<dyn DatabaseEngine>,
    connection: Option<Box<dyn DatabaseBackend>>,
    transaction_state: Vec<bool>,
    manual_mode: Vec<bool>,
    dirty: Vec<bool>,
    default_managed: bool,
    savepoint_seq: u64,
    debug: bool,
    queries: Vec<QueryRecord>,
    owner: ThreadId,
}

impl std::fmt::Debug for DatabaseWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseWrapper")
            .field("alias", &self.alias)
            .field("engine", &self.engine.name())
            .field("connected", &self.connection.is_some())
            .field("transaction_state", &self.transaction_state)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl DatabaseWrapper {
    /// Creates a wrapper. No connection is opened until one is needed.
    pub fn new(
        alias: impl Into<String>,
        settings: DatabaseSettings,
        engine: Arc<dyn DatabaseEngine>,
    ) -> Self {
        Self {
            alias: alias.into(),
            settings,
            engine,
            connection: None,
            transaction_state: Vec::new(),
            manual_mode: Vec::new(),
            dirty: Vec::new(),
            default_managed: false,
            savepoint_seq: 0,
            debug: false,
            queries: Vec::new(),
            owner: std::thread::current().id(),
        }
    }

    /// Sets the managed flag used when no transaction-management level is active.
    #[must_use]
    pub const fn with_default_managed(mut self, managed: bool) -> Self {
        self.default_managed = managed;
        self
    }

    /// Enables the query log.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn validate_thread(&self) {
        debug_assert_eq!(
            self.owner,
            std::thread::current().id(),
            "DatabaseWrapper for alias '{}' used from a thread other than the one that created it",
            self.alias
        );
    }

    /// Returns the alias.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Returns the connection settings.
    pub const fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    /// Returns the engine that opens this wrapper's connection.
    pub fn engine(&self) -> &Arc<dyn DatabaseEngine> {
        &self.engine
    }

    /// Returns the SQL dialect.
    pub fn backend_type(&self) -> DatabaseBackendType {
        self.engine.backend_type()
    }

    /// Returns a compiler for this connection's dialect.
    pub fn compiler(&self) -> SqlCompiler {
        SqlCompiler::new(self.backend_type())
    }

    /// Returns `true` if a physical connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Returns the statements executed so far (debug mode only).
    pub fn queries(&self) -> &[QueryRecord] {
        &self.queries
    }

    /// Clears the query log.
    pub fn reset_queries(&mut self) {
        self.queries.clear();
    }

    // ── Physical connection ──────────────────────────────────────────

    fn connection(&mut self) -> DjormResult<&mut Box<dyn DatabaseBackend>> {
        self.validate_thread();
        if self.connection.is_none() {
            if self.settings.name.is_empty() {
                return Err(DjormError::ImproperlyConfigured(
                    "Please fill out the database NAME in the settings module before using the database."
                        .into(),
                ));
            }
            tracing::debug!(alias = %self.alias, engine = %self.engine.name(), "opening connection");
            self.connection = Some(self.engine.connect(&self.settings)?);
        }
        self.connection
            .as_mut()
            .ok_or_else(|| DjormError::OperationalError("connection unavailable".into()))
    }

    fn needs_transaction(&self) -> bool {
        self.is_managed() || self.manual_mode.last().copied().unwrap_or(false)
    }

    /// Returns the connection, opening a transaction first when in manual mode.
    fn cursor(&mut self) -> DjormResult<&mut Box<dyn DatabaseBackend>> {
        let needs_transaction = self.needs_transaction();
        let alias = self.alias.clone();
        let conn = self.connection()?;
        if needs_transaction && !conn.in_transaction() {
            tracing::trace!(alias = %alias, "BEGIN");
            conn.begin()?;
        }
        Ok(conn)
    }

    fn record(&mut self, sql: &str, started: Instant) {
        let time = started.elapsed();
        tracing::debug!(sql = %sql, elapsed_us = time.as_micros() as u64, "executed");
        if self.debug {
            self.queries.push(QueryRecord {
                sql: sql.to_string(),
                time,
            });
        }
    }

    /// Runs a statement that returns no rows.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> DjormResult<u64> {
        let span = query_span(&self.alias);
        let _guard = span.enter();
        let started = Instant::now();
        let result = self.cursor()?.execute(sql, params);
        self.record(sql, started);
        result
    }

    /// Runs a query and returns its rows.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> DjormResult<Vec<Row>> {
        let span = query_span(&self.alias);
        let _guard = span.enter();
        let started = Instant::now();
        let result = self.cursor()?.query(sql, params);
        self.record(sql, started);
        result
    }

    /// Runs an INSERT and returns the generated primary key.
    pub fn insert_returning_id(&mut self, sql: &str, params: &[Value]) -> DjormResult<Value> {
        let span = query_span(&self.alias);
        let _guard = span.enter();
        let started = Instant::now();
        let result = self.cursor()?.insert_returning_id(sql, params);
        self.record(sql, started);
        result
    }

    /// Lists the tables in the database.
    pub fn table_names(&mut self) -> DjormResult<Vec<String>> {
        self.connection()?.table_names()
    }

    fn raw_commit(&mut self) -> DjormResult<()> {
        if let Some(conn) = self.connection.as_mut() {
            if conn.in_transaction() {
                tracing::trace!(alias = %self.alias, "COMMIT");
                conn.commit()?;
            }
        }
        Ok(())
    }

    fn raw_rollback(&mut self) -> DjormResult<()> {
        if let Some(conn) = self.connection.as_mut() {
            if conn.in_transaction() {
                tracing::trace!(alias = %self.alias, "ROLLBACK");
                conn.rollback()?;
            }
        }
        Ok(())
    }

    /// Closes the physical connection.
    ///
    /// A no-op for engines where closing would destroy the data (in-memory
    /// `SQLite`). Otherwise the handle is dropped and the next statement
    /// reopens it.
    pub fn close(&mut self) {
        self.validate_thread();
        if self.engine.keeps_connection_open(&self.settings) {
            return;
        }
        if self.connection.take().is_some() {
            tracing::debug!(alias = %self.alias, "connection closed");
        }
    }

    // ── Transaction management ───────────────────────────────────────

    /// Enters a transaction-management level.
    ///
    /// The new level inherits the managed flag of the enclosing level, or
    /// the settings default at the outermost level, and starts clean.
    /// `managed` switches the physical connection into manual mode for the
    /// duration of the level; call [`managed`](Self::managed) to make the
    /// level itself managed.
    pub fn enter_transaction_management(&mut self, managed: bool) {
        self.validate_thread();
        let inherited = self
            .transaction_state
            .last()
            .copied()
            .unwrap_or(self.default_managed);
        self.transaction_state.push(inherited);
        self.manual_mode.push(managed);
        self.dirty.push(false);
        tracing::trace!(alias = %self.alias, depth = self.transaction_state.len(), "enter transaction management");
    }

    /// Leaves the current transaction-management level.
    ///
    /// Fails when no level is active. If the level being left has pending
    /// writes, the transaction is rolled back and an error is returned.
    pub fn leave_transaction_management(&mut self) -> DjormResult<()> {
        self.validate_thread();
        if self.transaction_state.pop().is_none() {
            return Err(DjormError::TransactionManagement(
                "This code isn't under transaction management".into(),
            ));
        }
        self.manual_mode.pop();
        let was_dirty = self.dirty.pop().unwrap_or(false);
        tracing::trace!(alias = %self.alias, depth = self.transaction_state.len(), "leave transaction management");

        if was_dirty {
            // The rollback discards the enclosing levels' writes too.
            tracing::warn!(alias = %self.alias, "transaction managed block ended with pending COMMIT/ROLLBACK");
            self.raw_rollback()?;
            self.dirty.iter_mut().for_each(|d| *d = false);
            self.savepoint_seq = 0;
            return Err(DjormError::TransactionManagement(
                "Transaction managed block ended with pending COMMIT/ROLLBACK".into(),
            ));
        }
        if !self.needs_transaction() && !self.is_dirty() {
            self.raw_commit()?;
        }
        Ok(())
    }

    /// Returns `true` if transactions must be committed explicitly.
    pub fn is_managed(&self) -> bool {
        self.transaction_state
            .last()
            .copied()
            .unwrap_or(self.default_managed)
    }

    /// Returns `true` if the current level has uncommitted writes.
    pub fn is_dirty(&self) -> bool {
        self.dirty.last().copied().unwrap_or(false)
    }

    /// Returns the number of active transaction-management levels.
    pub fn transaction_depth(&self) -> usize {
        self.transaction_state.len()
    }

    /// Marks the current level dirty.
    pub fn set_dirty(&mut self) -> DjormResult<()> {
        match self.dirty.last_mut() {
            Some(flag) => {
                *flag = true;
                Ok(())
            }
            None => Err(DjormError::TransactionManagement(
                "This code isn't under transaction management".into(),
            )),
        }
    }

    /// Marks every level clean and forgets savepoints.
    ///
    /// A commit or rollback acts on the whole connection, so writes from
    /// enclosing levels are settled too.
    pub fn set_clean(&mut self) -> DjormResult<()> {
        if self.dirty.is_empty() {
            return Err(DjormError::TransactionManagement(
                "This code isn't under transaction management".into(),
            ));
        }
        self.dirty.iter_mut().for_each(|d| *d = false);
        self.savepoint_seq = 0;
        Ok(())
    }

    /// Sets the managed flag of the current level.
    ///
    /// Turning management off while dirty commits the pending writes.
    pub fn managed(&mut self, flag: bool) -> DjormResult<()> {
        let Some(top) = self.transaction_state.last_mut() else {
            return Err(DjormError::TransactionManagement(
                "This code isn't under transaction management".into(),
            ));
        };
        *top = flag;
        if !flag && self.is_dirty() {
            self.raw_commit()?;
            self.set_clean()?;
        }
        Ok(())
    }

    /// Commits now in automatic mode; otherwise marks the level dirty.
    pub fn commit_unless_managed(&mut self) -> DjormResult<()> {
        if self.is_managed() {
            self.set_dirty()
        } else {
            self.raw_commit()?;
            self.savepoint_seq = 0;
            Ok(())
        }
    }

    /// Rolls back now in automatic mode; otherwise marks the level dirty.
    pub fn rollback_unless_managed(&mut self) -> DjormResult<()> {
        if self.is_managed() {
            self.set_dirty()
        } else {
            self.raw_rollback()
        }
    }

    /// Commits and marks the level clean.
    pub fn commit(&mut self) -> DjormResult<()> {
        self.raw_commit()?;
        self.set_clean()
    }

    /// Rolls back and marks the level clean.
    pub fn rollback(&mut self) -> DjormResult<()> {
        self.raw_rollback()?;
        self.set_clean()
    }

    // ── Savepoints ───────────────────────────────────────────────────

    /// Creates a savepoint and returns its id.
    pub fn savepoint(&mut self) -> DjormResult<String> {
        self.savepoint_seq += 1;
        let sid = format!("s_{}_x{}", self.alias, self.savepoint_seq);
        let alias = self.alias.clone();
        let conn = self.connection()?;
        if !conn.in_transaction() {
            conn.begin()?;
        }
        conn.savepoint_create(&sid)?;
        tracing::trace!(alias = %alias, savepoint = %sid, "savepoint");
        Ok(sid)
    }

    /// Rolls back to a savepoint, keeping it.
    pub fn savepoint_rollback(&mut self, sid: &str) -> DjormResult<()> {
        tracing::trace!(alias = %self.alias, savepoint = %sid, "rollback to savepoint");
        self.connection()?.savepoint_rollback(sid)
    }

    /// Releases a savepoint, keeping its changes in the transaction.
    pub fn savepoint_commit(&mut self, sid: &str) -> DjormResult<()> {
        tracing::trace!(alias = %self.alias, savepoint = %sid, "release savepoint");
        self.connection()?.savepoint_release(sid)
    }

    // ── Constraint checking ──────────────────────────────────────────

    /// Turns off referential checks. Returns `true` if they must be re-enabled.
    pub fn disable_constraint_checking(&mut self) -> DjormResult<bool> {
        self.connection()?.disable_constraint_checking()
    }

    /// Turns referential checks back on.
    pub fn enable_constraint_checking(&mut self) -> DjormResult<()> {
        self.connection()?.enable_constraint_checking()
    }

    /// Validates referential integrity of the given tables.
    pub fn check_constraints(&mut self, table_names: &[String]) -> DjormResult<()> {
        self.cursor()?.check_constraints(table_names)
    }
}

/// The connections of one execution context, keyed by alias.
///
/// Holds the configured aliases, the engines able to open them, the
/// router chain and the wrappers built so far.
pub struct ConnectionHandler {
    databases: HashMap<String, DatabaseSettings>,
    engines: HashMap<String, Arc<dyn DatabaseEngine>>,
    router: RouterChain,
    connections: HashMap<String, DatabaseWrapper>,
    debug: bool,
    transactions_managed: bool,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut engines: Vec<&String> = self.engines.keys().collect();
        engines.sort();
        f.debug_struct("ConnectionHandler")
            .field("aliases", &self.aliases())
            .field("engines", &engines)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandler {
    /// Creates a handler for the databases in `settings`.
    pub fn new(settings: &Settings) -> Self {
        Self {
            databases: settings.databases.clone(),
            engines: HashMap::new(),
            router: RouterChain::new(),
            connections: HashMap::new(),
            debug: settings.debug,
            transactions_managed: settings.transactions_managed,
        }
    }

    /// Registers an engine under its name.
    pub fn register_engine(&mut self, engine: Arc<dyn DatabaseEngine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    /// Builder form of [`register_engine`](Self::register_engine).
    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn DatabaseEngine>) -> Self {
        self.register_engine(engine);
        self
    }

    /// Replaces the router chain.
    pub fn set_router(&mut self, router: RouterChain) {
        self.router = router;
    }

    /// Returns the router chain.
    pub const fn router(&self) -> &RouterChain {
        &self.router
    }

    /// Returns the router chain for modification.
    pub fn router_mut(&mut self) -> &mut RouterChain {
        &mut self.router
    }

    /// Returns the configured aliases, sorted.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.databases.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    /// Returns the settings of an alias.
    pub fn settings_for(&self, alias: &str) -> DjormResult<&DatabaseSettings> {
        self.databases
            .get(alias)
            .ok_or_else(|| DjormError::ConnectionDoesNotExist(alias.to_string()))
    }

    /// Returns the engine configured for an alias.
    pub fn engine_for(&self, alias: &str) -> DjormResult<Arc<dyn DatabaseEngine>> {
        let settings = self.settings_for(alias)?;
        self.engines
            .get(&settings.engine)
            .cloned()
            .ok_or_else(|| {
                DjormError::ImproperlyConfigured(format!(
                    "'{}' isn't an available database backend.",
                    settings.engine
                ))
            })
    }

    /// Overrides the settings of an alias, dropping its existing wrapper.
    pub fn set_settings(&mut self, alias: &str, settings: DatabaseSettings) {
        self.connections.remove(alias);
        self.databases.insert(alias.to_string(), settings);
    }

    /// Returns the wrapper for an alias, building it on first use.
    pub fn get(&mut self, alias: &str) -> DjormResult<&mut DatabaseWrapper> {
        if !self.connections.contains_key(alias) {
            let settings = self.settings_for(alias)?.clone();
            let engine = self.engine_for(alias)?;
            let wrapper = DatabaseWrapper::new(alias, settings, engine)
                .with_debug(self.debug)
                .with_default_managed(self.transactions_managed);
            self.connections.insert(alias.to_string(), wrapper);
        }
        self.connections
            .get_mut(alias)
            .ok_or_else(|| DjormError::ConnectionDoesNotExist(alias.to_string()))
    }

    /// Closes every open connection.
    pub fn close_all(&mut self) {
        for conn in self.connections.values_mut() {
            conn.close();
        }
    }

    /// Runs `f` with referential checks disabled on `alias`.
    ///
    /// Checks are re-enabled afterwards whether or not `f` succeeded. An
    /// error from `f` takes precedence over one from re-enabling.
    pub fn with_constraint_checks_disabled<R>(
        &mut self,
        alias: &str,
        f: impl FnOnce(&mut Self) -> DjormResult<R>,
    ) -> DjormResult<R> {
        let disabled = self.get(alias)?.disable_constraint_checking()?;
        let result = f(self);
        if disabled {
            let reenabled = self.get(alias).and_then(DatabaseWrapper::enable_constraint_checking);
            let value = result?;
            reenabled?;
            return Ok(value);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{lock, mock_handler, statements, MockEngine, SharedState};

    fn wrapper(name: &str) -> (DatabaseWrapper, SharedState) {
        let state = SharedState::default();
        let engine = Arc::new(MockEngine {
            state: Arc::clone(&state),
        });
        let mut settings = DatabaseSettings::sqlite_file(name);
        settings.engine = "mock".into();
        (DatabaseWrapper::new("default", settings, engine), state)
    }

    #[test]
    fn test_connection_is_lazy() {
        let (mut conn, state) = wrapper("a.db");
        assert!(!conn.is_connected());
        assert_eq!(lock(&state).connects, 0);
        conn.execute("SELECT 1", &[]).unwrap();
        assert!(conn.is_connected());
        conn.execute("SELECT 2", &[]).unwrap();
        assert_eq!(lock(&state).connects, 1);
    }

    #[test]
    fn test_missing_name_is_improperly_configured() {
        let (mut conn, _) = wrapper("");
        let err = conn.execute("SELECT 1", &[]).unwrap_err();
        assert!(matches!(err, DjormError::ImproperlyConfigured(_)));
        assert!(err.to_string().contains("Please fill out the database NAME"));
    }

    #[test]
    fn test_close_reopens_on_next_use() {
        let (mut conn, state) = wrapper("a.db");
        conn.execute("SELECT 1", &[]).unwrap();
        conn.close();
        assert!(!conn.is_connected());
        conn.execute("SELECT 1", &[]).unwrap();
        assert_eq!(lock(&state).connects, 2);
    }

    #[test]
    fn test_close_is_noop_for_memory() {
        let (mut conn, _) = wrapper(":memory:");
        conn.execute("SELECT 1", &[]).unwrap();
        conn.close();
        assert!(conn.is_connected());
    }

    #[test]
    fn test_leave_without_enter_fails() {
        let (mut conn, _) = wrapper("a.db");
        let err = conn.leave_transaction_management().unwrap_err();
        assert!(matches!(err, DjormError::TransactionManagement(_)));
        assert!(err.to_string().contains("isn't under transaction management"));
    }

    #[test]
    fn test_enter_inherits_managed_flag() {
        let (conn, _) = wrapper("a.db");
        let mut conn = conn.with_default_managed(false);
        conn.enter_transaction_management(true);
        assert!(!conn.is_managed());
        conn.managed(true).unwrap();
        conn.enter_transaction_management(true);
        assert!(conn.is_managed());
        assert_eq!(conn.transaction_depth(), 2);
        conn.leave_transaction_management().unwrap();
        conn.leave_transaction_management().unwrap();
        assert_eq!(conn.transaction_depth(), 0);
    }

    #[test]
    fn test_managed_mode_begins_lazily_and_defers_commit() {
        let (mut conn, state) = wrapper("a.db");
        conn.enter_transaction_management(true);
        conn.managed(true).unwrap();
        conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        conn.commit_unless_managed().unwrap();
        assert!(conn.is_dirty());
        assert_eq!(statements(&state), vec!["BEGIN", "INSERT INTO t VALUES (1)"]);

        conn.commit().unwrap();
        assert!(!conn.is_dirty());
        conn.leave_transaction_management().unwrap();
        assert_eq!(statements(&state).last().map(String::as_str), Some("COMMIT"));
    }

    #[test]
    fn test_dirty_leave_rolls_back_and_fails() {
        let (mut conn, state) = wrapper("a.db");
        conn.enter_transaction_management(true);
        conn.managed(true).unwrap();
        conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        conn.set_dirty().unwrap();

        let err = conn.leave_transaction_management().unwrap_err();
        assert!(matches!(err, DjormError::TransactionManagement(_)));
        assert!(err
            .to_string()
            .contains("Transaction managed block ended with pending COMMIT/ROLLBACK"));
        assert_eq!(statements(&state).last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(conn.transaction_depth(), 0);
    }

    #[test]
    fn test_inner_dirty_leave_cleans_outer_level() {
        let (mut conn, _) = wrapper("a.db");
        conn.enter_transaction_management(true);
        conn.managed(true).unwrap();
        conn.set_dirty().unwrap();
        conn.enter_transaction_management(true);
        conn.set_dirty().unwrap();
        assert!(conn.leave_transaction_management().is_err());
        assert!(!conn.is_dirty());
        conn.leave_transaction_management().unwrap();
    }

    #[test]
    fn test_managed_off_while_dirty_commits() {
        let (mut conn, state) = wrapper("a.db");
        conn.enter_transaction_management(true);
        conn.managed(true).unwrap();
        conn.execute("UPDATE t SET a = 1", &[]).unwrap();
        conn.set_dirty().unwrap();
        conn.managed(false).unwrap();
        assert!(!conn.is_dirty());
        assert!(statements(&state).contains(&"COMMIT".to_string()));
        conn.leave_transaction_management().unwrap();
    }

    #[test]
    fn test_managed_and_dirty_flags_need_a_level() {
        let (mut conn, _) = wrapper("a.db");
        assert!(conn.managed(true).is_err());
        assert!(conn.set_dirty().is_err());
        assert!(conn.set_clean().is_err());
        assert!(!conn.is_dirty());
    }

    #[test]
    fn test_auto_mode_commits_immediately() {
        let (mut conn, state) = wrapper("a.db");
        conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        conn.commit_unless_managed().unwrap();
        // Autocommit: no transaction was ever opened, so nothing to commit.
        assert_eq!(statements(&state), vec!["INSERT INTO t VALUES (1)"]);
        conn.rollback_unless_managed().unwrap();
    }

    #[test]
    fn test_rollback_unless_managed_marks_dirty_in_managed_mode() {
        let (mut conn, _) = wrapper("a.db");
        conn.enter_transaction_management(true);
        conn.managed(true).unwrap();
        conn.rollback_unless_managed().unwrap();
        assert!(conn.is_dirty());
        conn.rollback().unwrap();
        conn.leave_transaction_management().unwrap();
    }

    #[test]
    fn test_savepoints() {
        let (mut conn, state) = wrapper("a.db");
        let sid = conn.savepoint().unwrap();
        assert_eq!(sid, "s_default_x1");
        conn.savepoint_rollback(&sid).unwrap();
        let sid2 = conn.savepoint().unwrap();
        conn.savepoint_commit(&sid2).unwrap();
        let stmts = statements(&state);
        assert_eq!(stmts[0], "BEGIN");
        assert_eq!(stmts[1], "SAVEPOINT \"s_default_x1\"");
        assert_eq!(stmts[2], "ROLLBACK TO SAVEPOINT \"s_default_x1\"");
        assert_eq!(stmts[3], "SAVEPOINT \"s_default_x2\"");
        assert_eq!(stmts[4], "RELEASE SAVEPOINT \"s_default_x2\"");
    }

    #[test]
    fn test_query_log_in_debug() {
        let (conn, _) = wrapper("a.db");
        let mut conn = conn.with_debug(true);
        conn.query("SELECT 1", &[]).unwrap();
        assert_eq!(conn.queries().len(), 1);
        assert_eq!(conn.queries()[0].sql, "SELECT 1");
        conn.reset_queries();
        assert!(conn.queries().is_empty());
    }

    // ── ConnectionHandler ────────────────────────────────────────────

    #[test]
    fn test_handler_unknown_alias() {
        let (mut handler, _) = mock_handler();
        let err = handler.get("other").unwrap_err();
        assert!(matches!(err, DjormError::ConnectionDoesNotExist(_)));
        assert_eq!(err.to_string(), "The connection other doesn't exist");
    }

    #[test]
    fn test_handler_unknown_engine() {
        let mut settings = Settings::default();
        settings.databases.get_mut("default").unwrap().engine = "nope".into();
        let mut handler = ConnectionHandler::new(&settings);
        let err = handler.get("default").unwrap_err();
        assert!(matches!(err, DjormError::ImproperlyConfigured(_)));
    }

    #[test]
    fn test_handler_reuses_wrapper() {
        let (mut handler, state) = mock_handler();
        handler.get("default").unwrap().execute("SELECT 1", &[]).unwrap();
        handler.get("default").unwrap().execute("SELECT 1", &[]).unwrap();
        assert_eq!(lock(&state).connects, 1);
        handler.close_all();
        assert!(!handler.get("default").unwrap().is_connected());
        assert_eq!(handler.aliases(), vec!["default".to_string()]);
    }

    #[test]
    fn test_constraint_checks_reenabled_after_failure() {
        let (mut handler, state) = mock_handler();
        let result: DjormResult<()> = handler.with_constraint_checks_disabled("default", |h| {
            assert!(lock(&state).checks_disabled);
            h.get("default")?.execute("INSERT", &[])?;
            Err(DjormError::IntegrityError("boom".into()))
        });
        assert!(matches!(result, Err(DjormError::IntegrityError(_))));
        assert!(!lock(&state).checks_disabled);
        let stmts = statements(&state);
        assert_eq!(stmts.first().map(String::as_str), Some("CHECKS OFF"));
        assert_eq!(stmts.last().map(String::as_str), Some("CHECKS ON"));
    }
}
