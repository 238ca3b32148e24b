//! Shared setup for integration tests

use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber once per test binary; `RUST_LOG` selects the level
#[ctor::ctor]
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
