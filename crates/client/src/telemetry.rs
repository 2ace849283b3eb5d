use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber for an embedding application.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies (for example
/// `"roster_client=info"`). Logs go to stderr. Calling this twice is harmless:
/// the second installation is ignored.
pub fn init(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
