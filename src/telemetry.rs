//! Tracing setup for embedding processes and tests.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// How much the embedder asked for on the command line or in config;
/// the `TIDEWAY_LOG` env var overrides it with a full filter directive.
#[derive(Clone, Copy, Debug, Default)]
pub struct TelemetryConfig {
    pub verbosity: u8,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }
}

fn level_from_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install a global subscriber. Safe to call more than once (later calls
/// are no-ops), which keeps it usable from parallel test binaries.
pub fn init(config: TelemetryConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(config.verbosity).into())
        .with_env_var("TIDEWAY_LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
