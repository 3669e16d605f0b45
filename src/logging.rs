//! Tracing bootstrap for the binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tasklist_live=debug";
const LOG_ENV: &str = "TASKLIST_LIVE_LOG";

/// Install the global subscriber. `RUST_LOG` wins, then
/// `TASKLIST_LIVE_LOG`, then the built-in default.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(filter_from(|key| env::var(key).ok()))
        .try_init();
}

fn filter_from<F>(lookup: F) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    for key in [EnvFilter::DEFAULT_ENV, LOG_ENV] {
        if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
            if let Ok(filter) = EnvFilter::try_new(value) {
                return filter;
            }
        }
    }
    EnvFilter::new(DEFAULT_FILTER)
}
