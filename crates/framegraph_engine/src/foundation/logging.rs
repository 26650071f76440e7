//! Logging utilities and structured logging support

pub use log::{debug, info, warn, error, trace};

/// Initialize the logging system from `RUST_LOG`
pub fn init() {
    env_logger::init();
}

/// Initialize logging with a default level that `RUST_LOG` can still override
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Log an unrecoverable engine error and abort the current thread
///
/// Used for GPU resource exhaustion and similar conditions where the renderer
/// has no degraded mode to fall back to.
#[track_caller]
pub fn fatal(message: impl std::fmt::Display) -> ! {
    log::error!("FATAL: {}", message);
    panic!("{}", message);
}
