//! Configuration management for the traffic guard.
//!
//! This module handles loading and managing application configuration
//! from environment variables and configuration files.

use std::env;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use crate::models::Config;

/// Load configuration from the optional config file and `GUARD__*` environment variables.
///
/// Sections that are absent from both sources take their `Default` values.
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(
            Environment::with_prefix("GUARD")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("blocklist.permanent")
                .with_list_parse_key("monitoring.services")
                .with_list_parse_key("monitoring.log_sources")
                .try_parsing(true),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        env::set_var("CONFIG_FILE", "does/not/exist.toml");
        let config = load_config().unwrap();

        assert_eq!(config.rate_limit.public.per_minute, 120);
        assert_eq!(config.rate_limit.block_minutes, 15);
        assert_eq!(config.gate.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.mitigation.brute_force_block_hours, 24);
        assert_eq!(config.audit.run_at, "02:00");
    }
}
