use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// supplied default level; calling this twice is a no-op.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false));

    let _ = tracing::subscriber::set_global_default(subscriber);
}
