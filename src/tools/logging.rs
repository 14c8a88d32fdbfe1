//! Tracing subscriber setup for embedding binaries and tests.

use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. The `EDGED_LOG` env variable
/// overrides `default_directive`. Safe to call more than once; later calls
/// are no-ops.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_env("EDGED_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
