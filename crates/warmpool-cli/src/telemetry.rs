// Console telemetry
//
// Log lines go to stderr so json output on stdout stays machine readable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Full filter directive (e.g. "warmpool=debug,sqlx=warn")
    pub log_filter: Option<String>,
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// - `RUST_LOG`: used as the filter directive verbatim
    /// - `LOG_LEVEL`: level for the warmpool crates when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("RUST_LOG").ok(),
            std::env::var("LOG_LEVEL").ok(),
        )
    }

    fn from_vars(rust_log: Option<String>, log_level: Option<String>) -> Self {
        let log_filter = rust_log
            .filter(|f| !f.trim().is_empty())
            .or_else(|| log_level.map(|level| crate_filter(level.trim())));
        Self { log_filter }
    }
}

fn crate_filter(level: &str) -> String {
    format!("warmpool={level},warmpool_cli={level}")
}

/// Install the global subscriber
pub fn init_telemetry(config: TelemetryConfig) {
    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new(crate_filter(DEFAULT_LOG_LEVEL)));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .init();
}
