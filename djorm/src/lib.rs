//! # djorm
//!
//! A Django-style object-relational mapper for Rust.
//!
//! This is the meta-crate that re-exports the sub-crates for convenient
//! access. Depend on `djorm` to get everything, or on the individual crates
//! for finer-grained control.
//!
//! ```rust,ignore
//! use djorm::prelude::*;
//!
//! let settings = djorm::core::settings_loader::from_toml_file("djorm.toml")?;
//! let mut conns = djorm::connect(&settings);
//! let person = ModelBuilder::new("Person", "site.people.models")
//!     .field(Field::new("name", FieldType::CharField).max_length(50))
//!     .register()?;
//! sync_db(&mut conns, &MODELS, DEFAULT_DB_ALIAS)?;
//! let adults = person.objects().filter(&[("age__lte", 65.into())])?;
//! ```

/// Core types, settings, app configs and error types.
pub use djorm_core as core;

/// ORM: models, instances, `QuerySet`, connections and transactions.
#[cfg(feature = "db")]
pub use djorm_db as db;

/// Database drivers.
pub use djorm_db_backends as db_backends;

/// Signal dispatcher for model lifecycle events.
#[cfg(feature = "signals")]
pub use djorm_signals as signals;

// Third-party re-exports
pub use chrono;
pub use serde;
pub use serde_json;
pub use tracing;
pub use tracing_subscriber;

/// Installs logging for `settings` and builds a connection handler with
/// every compiled-in engine registered.
#[cfg(feature = "db")]
pub fn connect(settings: &djorm_core::Settings) -> djorm_db::ConnectionHandler {
    djorm_core::logging::setup_logging(settings);
    djorm_db_backends::connection_handler(settings)
}

/// The names most programs need.
pub mod prelude {
    pub use djorm_core::{DatabaseSettings, DjormError, DjormResult, ErrorKind, Settings};

    #[cfg(feature = "db")]
    pub use djorm_db::{
        load_objects, sync_db, ConnectionHandler, Field, FieldType, Fixture, Instance,
        LoadOptions, Meta, ModelBuilder, ModelClass, QuerySet, SaveOptions, Value,
        DEFAULT_DB_ALIAS, MODELS,
    };

    #[cfg(feature = "signals")]
    pub use djorm_signals::SIGNALS;
}
