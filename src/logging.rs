//! Tracing subscriber setup.
//!
//! One structured line per event on stdout. `RUST_LOG` wins over the
//! verbosity flag.

use clap::ValueEnum;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable key=value lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(format: LogFormat, verbose: bool) {
    let builder = fmt()
        .with_env_filter(default_filter(verbose))
        .with_writer(std::io::stdout)
        .with_target(true);

    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
}
