//! Tracing subscriber setup for the binary.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set. `format` is `text` for human-readable
/// output; anything else emits JSON lines.
pub fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("delta_sync={level},tower_http={level}")));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if format == "text" {
        registry.with(fmt::layer().with_target(true)).try_init()
    } else {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing already initialised: {e}");
    }
}
