//! Structured logging setup for binaries.
//!
//! Libraries in this workspace only emit `tracing` events; a binary installs
//! the subscriber once at startup.
//!
//! ```rust,ignore
//! mqx_common::logging::init_logging("mqx-tail");
//! tracing::info!(destination = %dest, "Subscribed");
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: `json` for JSON lines, anything else for text (default: text)
//! - `RUST_LOG`: level filter (default: info), e.g. `RUST_LOG=mqx_queue=debug`

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format for the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    /// Resolve the format from the `LOG_FORMAT` value.
    pub fn from_env_value(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Initialize logging for the named service.
///
/// Reads `LOG_FORMAT` and `RUST_LOG`. Safe to call more than once; later
/// calls are ignored.
pub fn init_logging(service_name: &str) {
    let format = LogFormat::from_env_value(&std::env::var("LOG_FORMAT").unwrap_or_default());
    init_logging_with(service_name, format);
}

/// Initialize logging with an explicit format.
pub fn init_logging_with(service_name: &str, format: LogFormat) {
    let env_filter = build_env_filter();

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .flatten_event(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(true),
            )
            .try_init(),
    };

    if installed.is_ok() {
        tracing::debug!(service = %service_name, ?format, "Logging initialized");
    }
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
