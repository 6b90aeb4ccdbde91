use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers
    Json,
    /// Multi-line human readable output for local runs
    Pretty,
}

/// Build the filter from `RUST_LOG`, falling back to `default_level`.
fn env_filter(default_level: &str) -> Result<EnvFilter> {
    build_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(), default_level)
}

fn build_filter(directives: Option<&str>, default_level: &str) -> Result<EnvFilter> {
    if let Some(filter) = directives.and_then(|d| EnvFilter::try_new(d).ok()) {
        return Ok(filter);
    }
    EnvFilter::try_new(default_level).wrap_err_with(|| format!("Invalid log level: {default_level}"))
}

/// Install the global subscriber.
pub fn init_tracing(format: LogFormat, default_level: &str) -> Result<()> {
    let filter = env_filter(default_level)?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(fmt_layer.json().with_current_span(false).with_span_list(true))
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init(),
    }
    .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(?format, "Shardgate logging initialized");
    Ok(())
}

/// Create a request-scoped tracing span for the HTTP surface
pub fn create_request_span(method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}
