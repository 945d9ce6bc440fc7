//! TOML config file loading for broker tuning, publish tuning and dimmer
//! behavior. Secrets and deployment knobs (host, port, credentials, db url)
//! stay in environment variables, read once in `main`.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::dimmer::{DimmerTopics, PublisherConfig};
use crate::mqtt::SupervisorConfig;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client_id: String,
    pub keep_alive_secs: u64,

    pub reconnection_delay_ms: u64,
    pub max_reconnection_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_reconnection_attempts: u32,

    pub command_timeout_ms: u64,
    pub status_confirmation_timeout_ms: u64,
    pub command_queue_depth: usize,

    pub minimum_brightness_percent: u8,
    pub ramp_step_delay_ms: u64,

    pub power_command_topic: String,
    pub power_status_topic: String,
    pub brightness_command_topic: String,
    pub brightness_status_topic: String,
}

impl Default for Config {
    fn default() -> Self {
        let topics = DimmerTopics::default();
        let supervisor = SupervisorConfig::default();
        let publisher = PublisherConfig::default();
        Self {
            client_id: supervisor.client_id,
            keep_alive_secs: supervisor.keep_alive_secs,
            reconnection_delay_ms: supervisor.reconnection_delay_ms,
            max_reconnection_delay_ms: supervisor.max_reconnection_delay_ms,
            backoff_multiplier: supervisor.backoff_multiplier,
            max_reconnection_attempts: supervisor.max_reconnection_attempts,
            command_timeout_ms: supervisor.command_timeout_ms,
            status_confirmation_timeout_ms: 10_000,
            command_queue_depth: supervisor.command_queue_depth,
            minimum_brightness_percent: publisher.minimum_brightness_percent,
            ramp_step_delay_ms: publisher.step_delay.as_millis() as u64,
            power_command_topic: topics.power_command,
            power_status_topic: topics.power_status,
            brightness_command_topic: topics.brightness_command,
            brightness_status_topic: topics.brightness_status,
        }
    }
}

impl Config {
    pub fn topics(&self) -> DimmerTopics {
        DimmerTopics {
            power_command: self.power_command_topic.clone(),
            power_status: self.power_status_topic.clone(),
            brightness_command: self.brightness_command_topic.clone(),
            brightness_status: self.brightness_status_topic.clone(),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            minimum_brightness_percent: self.minimum_brightness_percent,
            step_delay: std::time::Duration::from_millis(self.ramp_step_delay_ms),
        }
    }

    pub fn supervisor_config(
        &self,
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> SupervisorConfig {
        SupervisorConfig {
            server,
            port,
            client_id: self.client_id.clone(),
            username,
            password,
            keep_alive_secs: self.keep_alive_secs,
            reconnection_delay_ms: self.reconnection_delay_ms,
            max_reconnection_delay_ms: self.max_reconnection_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
            max_reconnection_attempts: self.max_reconnection_attempts,
            command_timeout_ms: self.command_timeout_ms,
            command_queue_depth: self.command_queue_depth,
        }
    }
}

/// Read and parse a TOML config file. Every field is defaulted, so an empty
/// (or missing-and-substituted-with-"") file still parses.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.client_id, "lumirise");
        assert_eq!(config.minimum_brightness_percent, 20);
        assert_eq!(config.power_status_topic, "stat/dimmer/POWER");
    }

    #[test]
    fn parse_partial_config_overrides_only_given_fields() {
        let toml_str = r#"
minimum_brightness_percent = 15
client_id = "custom-client"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.minimum_brightness_percent, 15);
        assert_eq!(config.client_id, "custom-client");
        assert_eq!(config.keep_alive_secs, 60);
    }

    #[test]
    fn topics_helper_builds_dimmer_topics() {
        let config = Config::default();
        let topics = config.topics();
        assert_eq!(topics.brightness_command, "cmnd/dimmer/dimmer");
    }

    #[test]
    fn supervisor_config_helper_carries_broker_address() {
        let config = Config::default();
        let supervisor = config.supervisor_config("broker.local".to_string(), 1883, None, None);
        assert_eq!(supervisor.server, "broker.local");
        assert_eq!(supervisor.client_id, "lumirise");
    }
}
