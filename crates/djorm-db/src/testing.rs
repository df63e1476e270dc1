//! A recording in-memory backend for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use djorm_core::settings::{DatabaseSettings, Settings};
use djorm_core::{DjormError, DjormResult};

use crate::backend::{DatabaseBackend, DatabaseEngine};
use crate::connection::ConnectionHandler;
use crate::query::compiler::{DatabaseBackendType, Row};
use crate::value::Value;

pub(crate) const MOCK_ENGINE: &str = "mock";

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub statements: Vec<String>,
    pub params: Vec<Vec<Value>>,
    pub results: VecDeque<Vec<Row>>,
    pub affected: VecDeque<u64>,
    pub in_transaction: bool,
    pub next_id: i64,
    pub tables: Vec<String>,
    pub checks_disabled: bool,
    pub connects: usize,
    /// Statements containing this text fail with an integrity error.
    pub fail_on: Option<String>,
}

pub(crate) type SharedState = Arc<Mutex<MockState>>;

pub(crate) fn lock(state: &SharedState) -> MutexGuard<'_, MockState> {
    state.lock().unwrap()
}

pub(crate) struct MockBackend {
    state: SharedState,
}

impl DatabaseBackend for MockBackend {
    fn vendor(&self) -> &str {
        MOCK_ENGINE
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> DjormResult<u64> {
        let mut state = lock(&self.state);
        state.statements.push(sql.to_string());
        state.params.push(params.to_vec());
        if state.fail_on.as_deref().is_some_and(|f| sql.contains(f)) {
            return Err(DjormError::IntegrityError("UNIQUE constraint failed".into()));
        }
        match sql {
            "BEGIN" => state.in_transaction = true,
            "COMMIT" | "ROLLBACK" => state.in_transaction = false,
            _ => {}
        }
        Ok(state.affected.pop_front().unwrap_or(1))
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> DjormResult<Vec<Row>> {
        let mut state = lock(&self.state);
        state.statements.push(sql.to_string());
        state.params.push(params.to_vec());
        Ok(state.results.pop_front().unwrap_or_default())
    }

    fn insert_returning_id(&mut self, sql: &str, params: &[Value]) -> DjormResult<Value> {
        let mut state = lock(&self.state);
        state.statements.push(sql.to_string());
        state.params.push(params.to_vec());
        if state.fail_on.as_deref().is_some_and(|f| sql.contains(f)) {
            return Err(DjormError::IntegrityError("UNIQUE constraint failed".into()));
        }
        state.next_id += 1;
        Ok(Value::Int(state.next_id))
    }

    fn in_transaction(&self) -> bool {
        lock(&self.state).in_transaction
    }

    fn disable_constraint_checking(&mut self) -> DjormResult<bool> {
        let mut state = lock(&self.state);
        state.statements.push("CHECKS OFF".into());
        state.checks_disabled = true;
        Ok(true)
    }

    fn enable_constraint_checking(&mut self) -> DjormResult<()> {
        let mut state = lock(&self.state);
        state.statements.push("CHECKS ON".into());
        state.checks_disabled = false;
        Ok(())
    }

    fn table_names(&mut self) -> DjormResult<Vec<String>> {
        Ok(lock(&self.state).tables.clone())
    }
}

pub(crate) struct MockEngine {
    pub state: SharedState,
}

impl DatabaseEngine for MockEngine {
    fn name(&self) -> &str {
        MOCK_ENGINE
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn connect(&self, _settings: &DatabaseSettings) -> DjormResult<Box<dyn DatabaseBackend>> {
        lock(&self.state).connects += 1;
        Ok(Box::new(MockBackend {
            state: Arc::clone(&self.state),
        }))
    }

    fn keeps_connection_open(&self, settings: &DatabaseSettings) -> bool {
        settings.name == ":memory:"
    }
}

/// Settings with one `default` alias on the mock engine.
pub(crate) fn mock_settings(name: &str) -> Settings {
    let mut settings = Settings::default();
    let mut db = DatabaseSettings::sqlite_file(name);
    db.engine = MOCK_ENGINE.to_string();
    settings.databases.insert("default".into(), db);
    settings
}

/// A handler whose `default` alias records into the returned state.
pub(crate) fn mock_handler() -> (ConnectionHandler, SharedState) {
    let state = SharedState::default();
    let mut handler = ConnectionHandler::new(&mock_settings("test.db"));
    handler.register_engine(Arc::new(MockEngine {
        state: Arc::clone(&state),
    }));
    (handler, state)
}

/// Statements recorded so far, excluding nothing.
pub(crate) fn statements(state: &SharedState) -> Vec<String> {
    lock(state).statements.clone()
}

/// Queues rows for the next `query` call.
pub(crate) fn push_rows(state: &SharedState, columns: &[&str], rows: Vec<Vec<Value>>) {
    let cols: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
    lock(state)
        .results
        .push_back(rows.into_iter().map(|v| Row::new(cols.clone(), v)).collect());
}
