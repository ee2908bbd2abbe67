//! Tracing setup shared by master and slave processes.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_LEVEL_ENV: &str = "SLAVEMGR_LOG";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Filter directive for a `SLAVEMGR_LOG` value.
fn filter_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("slavemgr={level}")
}

/// Initialize tracing with RUST_LOG, SLAVEMGR_LOG and LOG_FORMAT support.
///
/// Always writes to stderr: in a slave, stdout is the master channel.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var(LOG_LEVEL_ENV).ok();
        EnvFilter::new(filter_directive(level.as_deref()))
    };

    let use_json = std::env::var(LOG_FORMAT_ENV).as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}
