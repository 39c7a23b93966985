//! Log output for the Python extension.

use tracing_subscriber::EnvFilter;

/// Filter from `MEDFEED_LOG`, then `RUST_LOG`, then `warn`.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("MEDFEED_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install a fmt subscriber unless the host process already installed one.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}
