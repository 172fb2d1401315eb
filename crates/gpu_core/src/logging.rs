//! Logging setup
//!
//! Every component logs through the `log` facade; the binary picks the sink.

pub use log::{debug, error, info, trace, warn};

/// Initialize the logging system from `RUST_LOG`
pub fn init() {
    env_logger::init();
}

/// Initialize logging with a default filter, still overridable through `RUST_LOG`
pub fn init_with_level(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    // A second initialization (e.g. from tests) is harmless.
    let _ = env_logger::Builder::from_env(env).try_init();
}
