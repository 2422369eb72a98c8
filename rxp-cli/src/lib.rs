//! RxP CLI Library
//!
//! Shared functionality for RxP command-line tools.

pub mod config;
pub mod stats;

pub use config::{ClientConfig, Config, ConfigError, NetworkConfig, RelayConfig, ServerConfig};
pub use stats::{display_compact_stats, display_connection_stats, format_bandwidth, format_bytes};

/// Install the `tracing` subscriber shared by the tools
///
/// `RUST_LOG` takes precedence; otherwise `verbose` selects debug output.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
