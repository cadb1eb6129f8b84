//! Logging setup

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "perfex=info";

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_FILTER`]. Returns false if a subscriber was already installed.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// Route logs to the test harness's captured output.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("perfex=debug")
        .with_test_writer()
        .try_init();
}
