//! Logging setup for the visiontrain binary

use std::io::{self, IsTerminal};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Error, Result};
use crate::training::config::LogLevel;

/// Default filter directive for a configured level and CLI verbosity
pub fn default_directive(level: LogLevel, verbosity: u8, quiet: bool) -> String {
    if quiet {
        return "error".to_string();
    }
    let crate_level = match verbosity {
        0 => level.as_directive(),
        1 => "debug",
        _ => "trace",
    };
    format!("visiontrain={},warn", crate_level)
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the level derived from the
/// configuration and `-v` flags.
pub fn init_logging(level: LogLevel, verbosity: u8, quiet: bool, json_output: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level, verbosity, quiet)));

    let result = if json_output {
        // JSON output for machine parsing
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(io::stdout().is_terminal())
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    result.map_err(|e| Error::internal(format!("Failed to initialize logging: {}", e)))
}
