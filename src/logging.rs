use tracing_subscriber::EnvFilter;

/// Install a process-wide `tracing` subscriber honoring `RUST_LOG`.
///
/// The library itself only emits events and never installs a subscriber;
/// binaries and test harnesses that want to see barrier phases or buffer
/// growth call this once at startup. Calling it twice is harmless.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
