//! Tracing setup for binaries embedding the allocator.

use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Filter directives used when `RUST_LOG` is unset.
///
/// `ALIASPOOL_LOG` picks the level for this crate; everything else stays at warn.
pub(crate) fn default_filter() -> String {
    let level = match std::env::var("ALIASPOOL_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("info") => "info",
        Ok("error") => "error",
        _ => "warn",
    };
    format!("warn,aliaspool={level}")
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `ALIASPOOL_LOG`; `LOG_FORMAT=json` switches
/// to JSON lines. Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter())
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> =
        if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
            fmt::layer().json().with_writer(std::io::stderr).boxed()
        } else {
            fmt::layer().with_writer(std::io::stderr).boxed()
        };

    if tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}
