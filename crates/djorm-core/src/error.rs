//! Core error types for djorm.
//!
//! A single error enum, [`DjormError`], covers every failure the ORM can
//! report. Variants are grouped by category and [`DjormError::kind`] exposes
//! that category so callers can decide what is recoverable: a missing row is
//! something to catch, an unbalanced transaction block is a bug.

use thiserror::Error;

/// Broad classification of a [`DjormError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or invalid settings. Never retried.
    Configuration,
    /// Bad model declaration or query construction, raised before any SQL runs.
    Declaration,
    /// A queryset was used in a way its current state does not allow.
    Usage,
    /// `get()` found zero or several rows.
    NotFound,
    /// Unbalanced or dirty transaction management.
    Transaction,
    /// A failure reported by the database itself.
    Persistence,
    /// I/O and (de)serialization of settings.
    Io,
}

/// The error type for all djorm operations.
#[derive(Error, Debug)]
pub enum DjormError {
    // ── Configuration ────────────────────────────────────────────────

    /// djorm is improperly configured.
    #[error("Improperly configured: {0}")]
    ImproperlyConfigured(String),

    /// A configuration value could not be parsed.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The requested database alias is not defined in the settings.
    #[error("The connection {0} doesn't exist")]
    ConnectionDoesNotExist(String),

    // ── Declaration ──────────────────────────────────────────────────

    /// A model class could not be built from its declaration.
    #[error("Model declaration error: {0}")]
    ModelDeclaration(String),

    /// A named field does not exist on the model.
    #[error("{0}")]
    FieldDoesNotExist(String),

    /// A filter keyword could not be turned into a predicate.
    #[error("Invalid lookup: {0}")]
    InvalidLookup(String),

    /// `values()` was asked for a name that is neither a column nor an extra.
    #[error("Unknown projection field: {0}")]
    UnknownProjectionField(String),

    // ── Query usage ──────────────────────────────────────────────────

    /// The queryset is in a state that forbids the operation.
    #[error("{0}")]
    QueryState(String),

    /// Indexing past the end of a result set.
    #[error("{0}")]
    IndexOutOfRange(String),

    /// An argument value is outside its allowed set.
    #[error("{0}")]
    InvalidArgument(String),

    // ── Not found / multiplicity ─────────────────────────────────────

    /// A query expected exactly one row but found none.
    #[error("{message}")]
    DoesNotExist {
        /// `app_label.ObjectName` of the model the lookup ran against.
        model: String,
        /// Labels of that model and its concrete ancestors.
        scope: Vec<String>,
        /// Human-readable description.
        message: String,
    },

    /// A query expected exactly one row but found several.
    #[error("{message}")]
    MultipleObjectsReturned {
        /// `app_label.ObjectName` of the model the lookup ran against.
        model: String,
        /// Labels of that model and its concrete ancestors.
        scope: Vec<String>,
        /// Human-readable description.
        message: String,
    },

    // ── Transactions ─────────────────────────────────────────────────

    /// Transaction management was used incorrectly.
    #[error("Transaction management error: {0}")]
    TransactionManagement(String),

    // ── Persistence ──────────────────────────────────────────────────

    /// A generic database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A database integrity constraint was violated.
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// An operational database error (connection failure, etc.).
    #[error("Operational error: {0}")]
    OperationalError(String),

    // ── Serialization / IO ───────────────────────────────────────────

    /// An error occurred during serialization or deserialization.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DjormError {
    /// Returns the category this error belongs to.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ImproperlyConfigured(_)
            | Self::ConfigurationError(_)
            | Self::ConnectionDoesNotExist(_) => ErrorKind::Configuration,
            Self::ModelDeclaration(_)
            | Self::FieldDoesNotExist(_)
            | Self::InvalidLookup(_)
            | Self::UnknownProjectionField(_) => ErrorKind::Declaration,
            Self::QueryState(_) | Self::IndexOutOfRange(_) | Self::InvalidArgument(_) => {
                ErrorKind::Usage
            }
            Self::DoesNotExist { .. } | Self::MultipleObjectsReturned { .. } => {
                ErrorKind::NotFound
            }
            Self::TransactionManagement(_) => ErrorKind::Transaction,
            Self::DatabaseError(_) | Self::IntegrityError(_) | Self::OperationalError(_) => {
                ErrorKind::Persistence
            }
            Self::SerializationError(_) | Self::IoError(_) => ErrorKind::Io,
        }
    }

    /// Returns the labels a scoped not-found error matches.
    pub fn scope(&self) -> &[String] {
        match self {
            Self::DoesNotExist { scope, .. } | Self::MultipleObjectsReturned { scope, .. } => scope,
            _ => &[],
        }
    }

    /// Returns the model label for scoped not-found errors.
    pub fn model_label(&self) -> Option<&str> {
        match self {
            Self::DoesNotExist { model, .. } | Self::MultipleObjectsReturned { model, .. } => {
                Some(model)
            }
            _ => None,
        }
    }

    /// Prefixes the message with `context`, keeping the variant.
    ///
    /// Used when re-raising a failure with more information about what was
    /// being done, without changing how callers classify it.
    #[must_use]
    pub fn with_context(self, context: &str) -> Self {
        let wrap = |msg: String| format!("{context}{msg}");
        match self {
            Self::ImproperlyConfigured(m) => Self::ImproperlyConfigured(wrap(m)),
            Self::ConfigurationError(m) => Self::ConfigurationError(wrap(m)),
            Self::ConnectionDoesNotExist(m) => Self::ConnectionDoesNotExist(wrap(m)),
            Self::ModelDeclaration(m) => Self::ModelDeclaration(wrap(m)),
            Self::FieldDoesNotExist(m) => Self::FieldDoesNotExist(wrap(m)),
            Self::InvalidLookup(m) => Self::InvalidLookup(wrap(m)),
            Self::UnknownProjectionField(m) => Self::UnknownProjectionField(wrap(m)),
            Self::QueryState(m) => Self::QueryState(wrap(m)),
            Self::IndexOutOfRange(m) => Self::IndexOutOfRange(wrap(m)),
            Self::InvalidArgument(m) => Self::InvalidArgument(wrap(m)),
            Self::DoesNotExist {
                model,
                scope,
                message,
            } => Self::DoesNotExist {
                model,
                scope,
                message: wrap(message),
            },
            Self::MultipleObjectsReturned {
                model,
                scope,
                message,
            } => Self::MultipleObjectsReturned {
                model,
                scope,
                message: wrap(message),
            },
            Self::TransactionManagement(m) => Self::TransactionManagement(wrap(m)),
            Self::DatabaseError(m) => Self::DatabaseError(wrap(m)),
            Self::IntegrityError(m) => Self::IntegrityError(wrap(m)),
            Self::OperationalError(m) => Self::OperationalError(wrap(m)),
            Self::SerializationError(m) => Self::SerializationError(wrap(m)),
            Self::IoError(e) => Self::IoError(std::io::Error::new(e.kind(), wrap(e.to_string()))),
        }
    }
}

/// A convenience type alias for `Result<T, DjormError>`.
pub type DjormResult<T> = Result<T, DjormError>;
