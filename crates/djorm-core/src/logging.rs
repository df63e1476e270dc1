//! Logging integration for djorm.
//!
//! Configures [`tracing`]-based logging from [`Settings`] and provides the
//! span every executed statement is logged under.

use crate::settings::Settings;

/// Sets up the global tracing subscriber based on the given settings.
///
/// The filter is read from `settings.log_level`. Debug mode uses a pretty,
/// human-readable format; otherwise output is structured JSON. Calling this
/// more than once is harmless: later calls leave the first subscriber in place.
pub fn setup_logging(settings: &Settings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Creates a tracing span for statements run on a database alias.
///
/// # Examples
///
/// ```
/// use djorm_core::logging::query_span;
///
/// let span = query_span("default");
/// let _guard = span.enter();
/// tracing::debug!(sql = "SELECT 1", "executing");
/// ```
pub fn query_span(alias: &str) -> tracing::Span {
    tracing::debug_span!("db", alias = alias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_twice_is_harmless() {
        let settings = Settings {
            log_level: "not a valid [filter".into(),
            ..Settings::default()
        };
        setup_logging(&settings);
        setup_logging(&Settings::default());
    }

    #[test]
    fn test_query_span_enter() {
        let span = query_span("replica");
        let _guard = span.enter();
        tracing::debug!("inside span");
    }
}
