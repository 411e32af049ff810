use tracing_subscriber::{fmt, EnvFilter};

/// Initializes tracing/logging based on environment variables.
///
/// `format` selects the output encoding: `"json"` for structured lines,
/// anything else for the human-readable formatter.
pub fn init_tracing(format: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false);

    if format.eq_ignore_ascii_case("json") {
        subscriber.json().with_current_span(false).init();
    } else {
        subscriber.init();
    }
}
