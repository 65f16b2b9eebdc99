//! Logging setup shared by the binaries in this workspace.
//!
//! Logging is configured from the environment:
//! * `TRACING_FILTER_DIRECTIVE`: an `EnvFilter` directive such as `info,models=debug`.
//! * `LOGGING_FORMATTER`: one of `full`, `compact`, `pretty` or `json`.
//! * `LOGGING_ANSI_ENABLED`: `true` to colorize output.
use serde::Deserialize;
use snafu::ResultExt;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_TRACING_FILTER_DIRECTIVE: LevelFilter = LevelFilter::INFO;

pub const TRACING_FILTER_DIRECTIVE_ENV_VAR: &str = "TRACING_FILTER_DIRECTIVE";
pub const LOGGING_FORMATTER_ENV_VAR: &str = "LOGGING_FORMATTER";
pub const LOGGING_ANSI_ENABLED_ENV_VAR: &str = "LOGGING_ANSI_ENABLED";

/// How tracing events are rendered.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LogFormatter {
    pub message_format: MessageFormat,
    pub ansi_enabled: bool,
}

impl LogFormatter {
    /// Reads the formatter settings through `lookup`, which maps variable names to values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let message_format = lookup(LOGGING_FORMATTER_ENV_VAR)
            .map(|formatter| {
                serde_plain::from_str(&formatter).context(error::LogFormatterEnvSnafu {
                    env_value: formatter.clone(),
                })
            })
            .transpose()?
            .unwrap_or_default();
        let ansi_enabled = lookup(LOGGING_ANSI_ENABLED_ENV_VAR)
            .map(|ansi_enabled| {
                ansi_enabled
                    .to_lowercase()
                    .parse()
                    .context(error::LogAnsiEnvSnafu {
                        env_value: ansi_enabled.clone(),
                    })
            })
            .transpose()?
            .unwrap_or(false);

        Ok(Self {
            message_format,
            ansi_enabled,
        })
    }

    fn add_format_layer<S>(&self, subscriber: S) -> Box<dyn Subscriber + Send + Sync>
    where
        S: SubscriberExt + Send + Sync + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        // Each formatter is a distinct layer type, so each arm boxes its own subscriber.
        let layer = fmt::layer()
            .with_ansi(self.ansi_enabled)
            .with_writer(std::io::stderr);
        match self.message_format {
            MessageFormat::Full => Box::new(subscriber.with(layer)),
            MessageFormat::Compact => Box::new(subscriber.with(layer.compact())),
            MessageFormat::Pretty => Box::new(subscriber.with(layer.pretty())),
            MessageFormat::Json => Box::new(subscriber.with(layer.json())),
        }
    }
}

/// See https://docs.rs/tracing-subscriber/latest/tracing_subscriber/fmt/format/index.html
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Human-readable, single-line logs for each event.
    Full,
    /// A variant of the default formatter optimized for short line lengths.
    #[default]
    Compact,
    /// Pretty-formatted multi-line logs optimized for human readability.
    Pretty,
    /// Newline-delimited JSON logs.
    Json,
}

/// Installs the global subscriber. Logs go to stderr so that plan output on stdout stays clean.
pub fn init_telemetry_from_env() -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_TRACING_FILTER_DIRECTIVE.into())
        .with_env_var(TRACING_FILTER_DIRECTIVE_ENV_VAR)
        .from_env_lossy();

    let subscriber = Registry::default().with(env_filter);
    let subscriber =
        LogFormatter::from_lookup(|name| std::env::var(name).ok())?.add_format_layer(subscriber);

    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)?;

    Ok(())
}

pub mod error {
    use super::*;
    use snafu::Snafu;
    use std::str::ParseBoolError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Could not parse formatter from environment variable '{}={}': '{}'",
            LOGGING_FORMATTER_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatterEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "Could not parse ANSI enablement from environment variable '{}={}': '{}'",
            LOGGING_ANSI_ENABLED_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatter_from_lookup() {
        let formatter = LogFormatter::from_lookup(|name| match name {
            LOGGING_FORMATTER_ENV_VAR => Some("json".to_string()),
            LOGGING_ANSI_ENABLED_ENV_VAR => Some("TRUE".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(formatter.message_format, MessageFormat::Json);
        assert!(formatter.ansi_enabled);

        assert_eq!(
            LogFormatter::from_lookup(|_| None).unwrap(),
            LogFormatter::default()
        );
        assert!(LogFormatter::from_lookup(|name| {
            (name == LOGGING_FORMATTER_ENV_VAR).then(|| "xml".to_string())
        })
        .is_err());
    }
}
