//! Process-wide log setup.
//!
//! `RUST_LOG` wins when set. Otherwise our own events follow the configured
//! level and dependencies (the IRC client mostly) stay at `warn` or quieter.

use crate::config::LogLevel;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn filter_directive(level: LogLevel) -> String {
    let deps = match level {
        LogLevel::Quiet | LogLevel::Error => level.directive(),
        _ => LogLevel::Warn.directive(),
    };
    format!("{},dccfetch={}", deps, level.directive())
}

pub fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
