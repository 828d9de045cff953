//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use calmirror_core::config::parse_calendar_list;
use calmirror_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, log_file, logging_enabled, periodic_sync_enabled, \
    periodic_interval_secs, notification_sync_enabled, debounce_ms, max_retry_attempts, \
    retry_base_delay_ms, calendars, sync_events, sync_reminders, event_window_past_days, \
    event_window_future_days, batch_size, permission_timeout_secs";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    let sync = &config.sync;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "log_file": config.log_file,
                    "logging_enabled": config.logging_enabled,
                    "sync": sync,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:                  {}", config.data_dir.display());
            println!(
                "  log_file:                  {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!("  logging_enabled:           {}", config.logging_enabled);
            println!();
            println!("[sync]");
            println!("  periodic_sync_enabled:     {}", sync.periodic_sync_enabled);
            println!("  periodic_interval_secs:    {}", sync.periodic_interval_secs);
            println!("  notification_sync_enabled: {}", sync.notification_sync_enabled);
            println!("  debounce_ms:               {}", sync.debounce_ms);
            println!("  max_retry_attempts:        {}", sync.max_retry_attempts);
            println!("  retry_base_delay_ms:       {}", sync.retry_base_delay_ms);
            println!(
                "  calendars:                 {}",
                sync.calendars
                    .as_ref()
                    .map(|ids| ids.join(", "))
                    .unwrap_or_else(|| "(all)".to_string())
            );
            println!("  sync_events:               {}", sync.sync_events);
            println!("  sync_reminders:            {}", sync.sync_reminders);
            println!(
                "  event window:              {} days back, {} days ahead",
                sync.event_window_past_days, sync.event_window_future_days
            );
            println!("  batch_size:                {}", sync.batch_size);
            println!("  permission_timeout_secs:   {}", sync.permission_timeout_secs);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;
    config
        .validate()
        .with_context(|| format!("Refusing to save {} = {}", key, value))?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let sync = &mut config.sync;
    match key {
        "data_dir" => config.data_dir = value.into(),
        "log_file" => {
            config.log_file = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.into())
            };
        }
        "logging_enabled" => config.logging_enabled = parse(key, value)?,
        "periodic_sync_enabled" => sync.periodic_sync_enabled = parse(key, value)?,
        "periodic_interval_secs" => sync.periodic_interval_secs = parse(key, value)?,
        "notification_sync_enabled" => sync.notification_sync_enabled = parse(key, value)?,
        "debounce_ms" => sync.debounce_ms = parse(key, value)?,
        "max_retry_attempts" => sync.max_retry_attempts = parse(key, value)?,
        "retry_base_delay_ms" => sync.retry_base_delay_ms = parse(key, value)?,
        "calendars" => {
            sync.calendars = if value.is_empty() || value == "all" {
                None
            } else {
                Some(parse_calendar_list(value).context("Expected a comma-separated list of ids")?)
            };
        }
        "sync_events" => sync.sync_events = parse(key, value)?,
        "sync_reminders" => sync.sync_reminders = parse(key, value)?,
        "event_window_past_days" => sync.event_window_past_days = parse(key, value)?,
        "event_window_future_days" => sync.event_window_future_days = parse(key, value)?,
        "batch_size" => sync.batch_size = parse(key, value)?,
        "permission_timeout_secs" => sync.permission_timeout_secs = parse(key, value)?,
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: '{}'", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_sync_keys() {
        let mut config = Config::default();
        apply(&mut config, "periodic_interval_secs", "120").unwrap();
        apply(&mut config, "calendars", "work, home").unwrap();
        apply(&mut config, "notification_sync_enabled", "false").unwrap();

        assert_eq!(config.sync.periodic_interval_secs, 120);
        assert_eq!(
            config.sync.calendars,
            Some(vec!["work".to_string(), "home".to_string()])
        );
        assert!(!config.sync.notification_sync_enabled);

        apply(&mut config, "calendars", "all").unwrap();
        assert_eq!(config.sync.calendars, None);
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply(&mut config, "max_retry_attempts", "-1").is_err());
        assert!(apply(&mut config, "sync_events", "maybe").is_err());
        assert!(apply(&mut config, "favorite_color", "blue").is_err());
    }

    #[test]
    fn test_set_validates_before_saving() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        let err = set("periodic_interval_secs".into(), "10".into(), Some(&path), &output);
        assert!(err.is_err());
        assert!(!path.exists());

        set("debounce_ms".into(), "250".into(), Some(&path), &output).unwrap();
        let saved = Config::load_from_path(&path).unwrap();
        assert_eq!(saved.sync.debounce_ms, 250);
    }
}
