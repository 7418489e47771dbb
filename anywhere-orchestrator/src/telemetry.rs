// Tracing setup. RUST_LOG wins over the default level; LOG_FORMAT=json switches
// to one JSON object per line.
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init_tracing() {
    let format = std::env::var("LOG_FORMAT").unwrap_or_default();
    init_tracing_with(&format, "info");
}

pub fn init_tracing_with(format: &str, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    let _ = if format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
}
