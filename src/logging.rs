use tracing_subscriber::{EnvFilter, fmt};

/// Installs the stderr log subscriber. Stdout is reserved for reports and
/// command output.
///
/// Default: info for this crate, warn for everything else. `RUST_LOG`
/// overrides it.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,tdm=info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
