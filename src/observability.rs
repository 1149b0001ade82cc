//! Logging bootstrap.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::helpers::optional_env;
use crate::error::ConfigError;

const DEFAULT_FILTER: &str = "passkey_host=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct ObservabilityConfig {
    /// `RUST_LOG`-style directive; falls back to `passkey_host=info`.
    pub filter: Option<String>,
    pub format: LogFormat,
}

impl ObservabilityConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let format = match optional_env("WALLET_LOG_FORMAT")?.as_deref() {
            None | Some("pretty") | Some("text") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "WALLET_LOG_FORMAT".to_string(),
                    message: format!("expected 'pretty' or 'json', got '{other}'"),
                });
            }
        };
        Ok(Self {
            filter: optional_env("RUST_LOG")?,
            format,
        })
    }
}

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = config
        .filter
        .as_deref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
