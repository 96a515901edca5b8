//! Logging initialisation shared by both supervisor binaries.

/// Initialises `tracing` with an `EnvFilter` defaulting to `info`, honoring
/// `RUST_LOG`. Call once, at the top of `main()`.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
