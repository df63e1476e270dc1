//! Settings for djorm.
//!
//! [`Settings`] holds the database aliases and the handful of process-wide
//! knobs the ORM reads. [`LazySettings`] is a globally-accessible instance
//! that falls back to defaults when nothing was configured.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{DjormError, DjormResult};

/// Engine name of the bundled `SQLite` backend.
pub const SQLITE_ENGINE: &str = "djorm.db.backends.sqlite3";

/// Configuration for a single database connection.
///
/// Corresponds to one entry in Django's `DATABASES` setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// The database engine (e.g. "djorm.db.backends.sqlite3").
    pub engine: String,
    /// Database name, or file path for `SQLite`. `":memory:"` keeps it in memory.
    pub name: String,
    /// Database user.
    pub user: String,
    /// Database password.
    pub password: String,
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Additional engine-specific options.
    pub options: HashMap<String, String>,
    /// Explicit name for the test database created from this alias.
    pub test_name: Option<String>,
}

impl DatabaseSettings {
    /// Settings for an in-memory `SQLite` database.
    pub fn sqlite_memory() -> Self {
        Self {
            name: ":memory:".to_string(),
            ..Self::default()
        }
    }

    /// Settings for a file-backed `SQLite` database.
    pub fn sqlite_file(path: impl Into<String>) -> Self {
        Self {
            name: path.into(),
            ..Self::default()
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: SQLITE_ENGINE.to_string(),
            name: "db.sqlite3".to_string(),
            user: String::new(),
            password: String::new(),
            host: String::new(),
            port: 0,
            options: HashMap::new(),
            test_name: None,
        }
    }
}

/// Process-wide ORM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // ── Core ─────────────────────────────────────────────────────────

    /// Debug mode: pretty logs and a per-connection query log.
    pub debug: bool,
    /// App labels whose models are considered installed.
    pub installed_apps: Vec<String>,

    // ── Database ─────────────────────────────────────────────────────

    /// Database connections, keyed by alias. `"default"` is required.
    pub databases: HashMap<String, DatabaseSettings>,
    /// Whether a fresh transaction-management level starts out managed.
    pub transactions_managed: bool,
    /// Names of the routers installed on the connection handler.
    pub database_routers: Vec<String>,

    // ── Logging ──────────────────────────────────────────────────────

    /// Tracing filter directive (e.g. "info", "djorm_db=debug").
    pub log_level: String,

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Arbitrary additional settings.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Settings {
    /// Returns the settings for `alias`.
    pub fn database(&self, alias: &str) -> DjormResult<&DatabaseSettings> {
        self.databases
            .get(alias)
            .ok_or_else(|| DjormError::ConnectionDoesNotExist(alias.to_string()))
    }

    /// Returns `true` if `app_label` is listed in `installed_apps`.
    pub fn is_installed(&self, app_label: &str) -> bool {
        self.installed_apps.iter().any(|a| {
            a == app_label || a.rsplit('.').next().is_some_and(|last| last == app_label)
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        let mut databases = HashMap::new();
        databases.insert("default".to_string(), DatabaseSettings::default());

        Self {
            debug: true,
            installed_apps: Vec::new(),
            databases,
            transactions_managed: false,
            database_routers: Vec::new(),
            log_level: "info".to_string(),
            extra: HashMap::new(),
        }
    }
}

/// A lazily-initialized, globally-accessible settings container.
///
/// Call [`configure`](LazySettings::configure) once at startup. Reading
/// before that yields [`Settings::default`].
pub struct LazySettings {
    inner: OnceLock<Settings>,
}

impl Default for LazySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl LazySettings {
    /// Creates an unconfigured container.
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Installs the settings. Fails if settings were already configured or read.
    pub fn configure(&self, settings: Settings) -> DjormResult<()> {
        self.inner.set(settings).map_err(|_| {
            DjormError::ImproperlyConfigured("Settings have already been configured".into())
        })
    }

    /// Returns the configured settings, or the defaults.
    pub fn get(&self) -> &Settings {
        self.inner.get_or_init(Settings::default)
    }

    /// Returns `true` if settings have been configured or read.
    pub fn is_configured(&self) -> bool {
        self.inner.get().is_some()
    }
}

/// The global settings instance.
pub static SETTINGS: LazySettings = LazySettings::new();
