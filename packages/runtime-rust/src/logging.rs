//! Process-wide `tracing` setup.
//!
//! Logs go to stderr so they never interleave with console output on stdout.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Directives used when neither `--log` nor `RUST_LOG` is given.
pub const DEFAULT_FILTER: &str = "warn";

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Resolves the filter: explicit directives first, then `RUST_LOG`, then
/// [`DEFAULT_FILTER`].
///
/// # Errors
///
/// Returns an error if explicit directives do not parse.
pub fn filter(directives: Option<&str>) -> anyhow::Result<EnvFilter> {
    match directives {
        Some(directives) => Ok(EnvFilter::try_new(directives)?),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// Installs the global subscriber. Call once, early in `main`.
///
/// # Errors
///
/// Returns an error if the directives do not parse or a global subscriber is
/// already installed.
pub fn init(directives: Option<&str>, format: LogFormat) -> anyhow::Result<()> {
    let filter = filter(directives)?;
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directives_win() {
        let filter = filter(Some("ember_runtime=debug,warn")).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("ember_runtime=debug"));
        assert!(rendered.contains("warn"));
    }

    #[test]
    fn text_is_the_default_format() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }
}
