//! Logging setup
//!
//! `RUST_LOG` wins when set; otherwise the `-v` count picks the level. The
//! filter sits behind a reload layer so a running node can change its level.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log level '{0}'")]
    InvalidLevel(String),

    #[error("Logger is gone: {0}")]
    Reload(#[from] reload::Error),
}

/// Level for a `-v` count
pub fn verbosity_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Changes the level of the installed logger
#[derive(Clone)]
pub struct LogLevelHandle {
    inner: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    /// Replace the filter, e.g. `debug` or `fleetnet=trace,warn`
    pub fn set_level(&self, level: &str) -> Result<(), LoggingError> {
        let filter =
            EnvFilter::try_new(level).map_err(|_| LoggingError::InvalidLevel(level.to_string()))?;
        self.inner.reload(filter)?;
        Ok(())
    }

    pub fn current(&self) -> Option<String> {
        self.inner.with_current(|filter| filter.to_string()).ok()
    }
}

fn filter_for(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity_filter(verbose)))
}

/// Install the global subscriber
pub fn init_logging(verbose: u8) -> LogLevelHandle {
    let (filter, inner) = reload::Layer::new(filter_for(verbose));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
    LogLevelHandle { inner }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_filter() {
        assert_eq!(verbosity_filter(0), "warn");
        assert_eq!(verbosity_filter(1), "info");
        assert_eq!(verbosity_filter(2), "debug");
        assert_eq!(verbosity_filter(7), "trace");
    }

    #[test]
    fn test_set_level() {
        let (layer, inner) = reload::Layer::new(EnvFilter::new("warn"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let handle = LogLevelHandle { inner };

        handle.set_level("debug").unwrap();
        assert_eq!(handle.current().as_deref(), Some("debug"));

        assert!(matches!(
            handle.set_level("fleetnet=loud"),
            Err(LoggingError::InvalidLevel(_))
        ));
    }
}
