//! Settings loading from configuration files.
//!
//! Loads [`Settings`] from TOML or JSON and applies environment variable
//! overrides.
//!
//! ## Loading Order
//!
//! 1. Start with default settings.
//! 2. Load from a TOML or JSON file (overriding defaults).
//! 3. Apply environment variable overrides (highest priority).
//!
//! ## Environment Variable Mapping
//!
//! | Env Var | Setting |
//! |---|---|
//! | `DJORM_DEBUG` | `debug` |
//! | `DJORM_LOG_LEVEL` | `log_level` |
//! | `DJORM_INSTALLED_APPS` | `installed_apps` (comma-separated) |
//! | `DJORM_TRANSACTIONS_MANAGED` | `transactions_managed` |
//! | `DJORM_DATABASE_ENGINE` | `databases.default.engine` |
//! | `DJORM_DATABASE_NAME` | `databases.default.name` |
//!
//! ## Examples
//!
//! ```rust,no_run
//! use djorm_core::settings_loader;
//!
//! let settings = settings_loader::from_toml_file("config/djorm.toml").unwrap();
//! let settings = settings_loader::from_toml_file_with_env("config/djorm.toml").unwrap();
//! ```

use std::path::Path;

use crate::error::DjormError;
use crate::settings::Settings;

/// Loads settings from a TOML string.
///
/// Keys not present in the TOML keep their default values.
pub fn from_toml_str(toml_str: &str) -> Result<Settings, DjormError> {
    // Parse into a generic value and merge onto the serialized defaults so
    // partial documents keep every unspecified default.
    let toml_value: toml::Value = toml::from_str(toml_str)
        .map_err(|e| DjormError::ConfigurationError(format!("Failed to parse TOML: {e}")))?;

    merge_onto_defaults(toml_to_json(toml_value), "TOML")
}

/// Loads settings from a TOML file.
pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Settings, DjormError> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        DjormError::ConfigurationError(format!(
            "Failed to read TOML file '{}': {e}",
            path.as_ref().display()
        ))
    })?;
    from_toml_str(&content)
}

/// Loads settings from a TOML file and then applies environment variable overrides.
pub fn from_toml_file_with_env(path: impl AsRef<Path>) -> Result<Settings, DjormError> {
    let mut settings = from_toml_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Loads settings from a JSON string.
pub fn from_json_str(json_str: &str) -> Result<Settings, DjormError> {
    let json_value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| DjormError::ConfigurationError(format!("Failed to parse JSON: {e}")))?;

    merge_onto_defaults(json_value, "JSON")
}

/// Loads settings from just environment variables (starting from defaults).
pub fn from_env() -> Settings {
    let mut settings = Settings::default();
    apply_env_overrides(&mut settings);
    settings
}

/// Applies `DJORM_*` environment variable overrides to a settings struct.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

fn apply_overrides_from(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("DJORM_DEBUG") {
        settings.debug = parse_bool(&val);
    }

    if let Some(val) = lookup("DJORM_LOG_LEVEL") {
        settings.log_level = val;
    }

    if let Some(val) = lookup("DJORM_INSTALLED_APPS") {
        settings.installed_apps = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    if let Some(val) = lookup("DJORM_TRANSACTIONS_MANAGED") {
        settings.transactions_managed = parse_bool(&val);
    }

    let engine = lookup("DJORM_DATABASE_ENGINE");
    let name = lookup("DJORM_DATABASE_NAME");
    if engine.is_some() || name.is_some() {
        let default = settings.databases.entry("default".to_string()).or_default();
        if let Some(engine) = engine {
            default.engine = engine;
        }
        if let Some(name) = name {
            default.name = name;
        }
    }
}

fn parse_bool(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "true" | "1" | "yes")
}

// ============================================================
// Helpers
// ============================================================

fn merge_onto_defaults(value: serde_json::Value, format: &str) -> Result<Settings, DjormError> {
    let default_json = serde_json::to_value(Settings::default()).map_err(|e| {
        DjormError::ConfigurationError(format!("Failed to serialize default settings: {e}"))
    })?;

    let merged = merge_json(default_json, value);
    serde_json::from_value(merged).map_err(|e| {
        DjormError::ConfigurationError(format!("Failed to deserialize settings from {format}: {e}"))
    })
}

/// Converts a TOML value to a `serde_json::Value`.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => {
            let map: serde_json::Map<String, serde_json::Value> = table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect();
            serde_json::Value::Object(map)
        }
    }
}

/// Deep-merges two JSON values. The `override_val` takes precedence.
fn merge_json(base: serde_json::Value, override_val: serde_json::Value) -> serde_json::Value {
    match (base, override_val) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(override_map)) => {
            for (key, override_v) in override_map {
                let merged = if let Some(base_v) = base_map.remove(&key) {
                    merge_json(base_v, override_v)
                } else {
                    override_v
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, override_val) => override_val,
    }
}
