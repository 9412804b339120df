//! Logging utilities and structured logging support
//!
//! All diagnostics in this crate go through the `log` facade. Binaries pick
//! a sink; `init` wires up `env_logger` so `RUST_LOG` still takes precedence
//! over the level passed in code.

pub use log::{debug, error, info, trace, warn, LevelFilter};

/// Initialize the logging system at `Info`, honoring `RUST_LOG` overrides
pub fn init() {
    init_with_level(LevelFilter::Info);
}

/// Initialize the logging system with a default level
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_level(level: LevelFilter) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Parse a level name such as `"debug"` or `"WARN"`
///
/// Unknown names fall back to `Info`.
pub fn parse_level(name: &str) -> LevelFilter {
    name.parse().unwrap_or(LevelFilter::Info)
}
