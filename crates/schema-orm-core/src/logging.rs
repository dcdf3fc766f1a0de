//! Logging integration for schema-orm.
//!
//! Provides helpers for configuring [`tracing`]-based logging from
//! [`Settings`](crate::settings::Settings) and for creating per-call spans
//! around top-level compiler invocations.

use crate::settings::Settings;

/// Sets up the global tracing subscriber based on the given settings.
///
/// In debug mode a pretty, human-readable format is used; otherwise a
/// structured JSON format is used. Installing a second subscriber is a no-op.
pub fn setup_logging(settings: &Settings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
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

/// Creates a tracing span for one top-level schema operation.
///
/// # Examples
///
/// ```
/// use schema_orm_core::logging::query_span;
///
/// let span = query_span("UserSchema", "serialize");
/// let _guard = span.enter();
/// tracing::debug!("fetching rows");
/// ```
pub fn query_span(schema: &str, op: &'static str) -> tracing::Span {
    tracing::info_span!("schema_query", schema = schema, op = op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_twice_is_harmless() {
        let mut settings = Settings::default();
        settings.log_level = "schema_orm_query=debug,warn".to_string();
        setup_logging(&settings);
        settings.debug = false;
        setup_logging(&settings);
        tracing::debug!(target: "schema_orm_query", "still logging");
    }

    #[test]
    fn test_query_span_carries_schema_name() {
        let span = query_span("ArticleSchema", "get_values");
        let _guard = span.enter();
        tracing::trace!("inside span");
    }
}
