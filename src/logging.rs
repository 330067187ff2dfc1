//! Logging - tracing subscriber on stderr
//!
//! `RUST_LOG` sets the filter (default `info`); `BEESYNC_LOG_JSON=1` switches
//! to one JSON object per line.

use tracing_subscriber::{fmt, EnvFilter};

pub const JSON_ENV: &str = "BEESYNC_LOG_JSON";

pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = std::env::var(JSON_ENV).map(|value| value == "1").unwrap_or(false);

    if use_json {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
