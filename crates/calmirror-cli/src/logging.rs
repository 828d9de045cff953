//! Logging setup

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::EnvFilter;

use calmirror_core::Config;

/// Environment variable holding the log level
const LOG_ENV: &str = "CALMIRROR_LOG";

/// Install the tracing subscriber
///
/// The level comes from `CALMIRROR_LOG`, falling back to `info` when
/// logging is enabled in the config. With logging disabled and no
/// `CALMIRROR_LOG`, nothing is installed. Logs go to `log_file` when set,
/// stderr otherwise.
pub fn init(config: &Config) {
    let level = match std::env::var(LOG_ENV) {
        Ok(level) => level,
        Err(_) if config.logging_enabled => "info".to_string(),
        Err(_) => return,
    };

    let env_filter = EnvFilter::new(format!("calmirror_core={},calmirror={}", level, level));

    match &config.log_file {
        Some(path) => {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not open log file {:?}: {}", path, e);
                    return;
                }
            };
            // Ignore error if already initialized
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
            info!("Logging to {:?}", path);
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
