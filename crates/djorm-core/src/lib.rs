//! # djorm-core
//!
//! Core types shared by every djorm crate. It does not depend on the other
//! djorm crates.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy and result alias
//! - [`settings`] - Database aliases and global configuration
//! - [`settings_loader`] - Loading settings from TOML, JSON and the environment
//! - [`apps`] - Installed application configs
//! - [`i18n`] - Translation and lazy translatable strings
//! - [`logging`] - Tracing-based logging integration

pub mod apps;
pub mod error;
pub mod i18n;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{DjormError, DjormResult, ErrorKind};
pub use settings::{DatabaseSettings, Settings, SETTINGS};
