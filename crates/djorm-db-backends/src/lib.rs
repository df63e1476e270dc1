//! # djorm-db-backends
//!
//! Database drivers for djorm. Each driver implements
//! [`DatabaseEngine`](djorm_db::backend::DatabaseEngine), which opens
//! connections for the settings of an alias, and
//! [`DatabaseBackend`](djorm_db::backend::DatabaseBackend), the connection
//! itself.
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - SQLite through `rusqlite`
//!
//! ## Example
//!
//! ```rust,ignore
//! use djorm_core::Settings;
//! use djorm_db_backends::connection_handler;
//!
//! let mut conns = connection_handler(&Settings::default());
//! let conn = conns.get("default")?;
//! ```

#![allow(clippy::result_large_err)]
#![allow(clippy::doc_markdown)]

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteBackend, SqliteEngine};

use djorm_core::Settings;
use djorm_db::connection::ConnectionHandler;

/// Builds a connection handler for `settings` with every compiled-in
/// engine registered.
pub fn connection_handler(settings: &Settings) -> ConnectionHandler {
    #[allow(unused_mut)]
    let mut handler = ConnectionHandler::new(settings);
    #[cfg(feature = "sqlite")]
    handler.register_engine(std::sync::Arc::new(SqliteEngine));
    handler
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use djorm_core::DatabaseSettings;
    use djorm_db::query::DatabaseBackendType;

    #[test]
    fn test_handler_has_sqlite_engine() {
        let mut settings = Settings::default();
        settings
            .databases
            .insert("default".into(), DatabaseSettings::sqlite_memory());
        let mut conns = connection_handler(&settings);
        let conn = conns.get("default").unwrap();
        assert_eq!(conn.backend_type(), DatabaseBackendType::SQLite);
        assert!(conn.table_names().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_engine_is_improperly_configured() {
        let mut settings = Settings::default();
        let mut db = DatabaseSettings::sqlite_memory();
        db.engine = "djorm.db.backends.oracle".into();
        settings.databases.insert("default".into(), db);
        let mut conns = connection_handler(&settings);
        let err = conns.get("default").unwrap_err();
        assert!(err.to_string().contains("isn't an available database backend"));
    }
}
