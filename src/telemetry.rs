use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber. Level is driven entirely by
/// `RUST_LOG`, defaulting to `info` for the crate and its dependencies.
pub fn init_telemetry() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,jt808_engine=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("telemetry initialized");
}
