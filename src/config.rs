use std::{path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use crate::{
    credential::{Credential, CredentialError},
    error::InitError,
    reconnect::ReconnectPolicy,
    services::Version,
};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub default_credential: DefaultCredential,
    pub reconnect: ReconnectPolicy,
    pub provisioning: ProvisioningConfig,
    pub message_bus: MessageBusConfig,
    pub update: UpdateConfig,
    /// Capacity of the coordinator's event channel
    pub event_queue_depth: usize,
    /// Where the last applied credential is persisted. In-memory when unset.
    pub credential_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DefaultCredential {
    pub ssid: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MessageBusConfig {
    pub broker_uri: String,
    pub qos: u8,
    /// Inbound command queue capacity
    pub queue_depth: usize,
    /// How long a delivery may wait for queue space before it is dropped
    pub enqueue_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdateConfig {
    pub image_url: String,
    pub running_version: String,
    /// A chunk read that takes longer than this counts as a stalled fetch
    pub chunk_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_credential: DefaultCredential::default(),
            reconnect: ReconnectPolicy::default(),
            provisioning: ProvisioningConfig::default(),
            message_bus: MessageBusConfig::default(),
            update: UpdateConfig::default(),
            event_queue_depth: 32,
            credential_path: None,
        }
    }
}

impl Default for DefaultCredential {
    fn default() -> Self {
        Self {
            ssid: "link-keeper".to_string(),
            secret: "link-keeper".to_string(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            broker_uri: "mqtt://127.0.0.1:1883".to_string(),
            qos: 1,
            queue_depth: 10,
            enqueue_timeout_ms: 1000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            image_url: "https://127.0.0.1:8070/firmware.bin".to_string(),
            running_version: env!("CARGO_PKG_VERSION").to_string(),
            chunk_timeout_ms: 5000,
        }
    }
}

impl DefaultCredential {
    pub fn to_credential(&self) -> Result<Credential, CredentialError> {
        Credential::new(&self.ssid, &self.secret)
    }
}

impl ProvisioningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl MessageBusConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl UpdateConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

impl Config {
    pub fn load() -> Result<Config, Error> {
        Self::load_from("config.ron")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Config, Error> {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = ron::from_str(&config)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Reject zero capacities and zero periods. These can't be recovered
    /// from at runtime so they halt init.
    pub fn validate(&self) -> Result<(), InitError> {
        let zero = |what: &str| -> Result<(), InitError> {
            Err(InitError::InvalidConfig(format!("{} must be non-zero", what)))
        };

        if self.event_queue_depth == 0 {
            return zero("event_queue_depth");
        }
        if self.reconnect.short_interval_secs == 0 {
            return zero("reconnect.short_interval_secs");
        }
        if self.reconnect.max_short_attempts > 0 && self.reconnect.long_interval_secs == 0 {
            return zero("reconnect.long_interval_secs");
        }
        if self.provisioning.timeout_secs == 0 {
            return zero("provisioning.timeout_secs");
        }
        if self.message_bus.queue_depth == 0 {
            return zero("message_bus.queue_depth");
        }
        if self.message_bus.enqueue_timeout_ms == 0 {
            return zero("message_bus.enqueue_timeout_ms");
        }
        if self.message_bus.connect_timeout_ms == 0 {
            return zero("message_bus.connect_timeout_ms");
        }
        if self.update.chunk_timeout_ms == 0 {
            return zero("update.chunk_timeout_ms");
        }
        if self.message_bus.qos > 2 {
            return Err(InitError::InvalidConfig(format!(
                "message_bus.qos must be 0, 1 or 2, got {}",
                self.message_bus.qos
            )));
        }
        Version::parse(&self.update.running_version).map_err(|e| {
            InitError::InvalidConfig(format!("update.running_version: {:#}", e))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ron");
        std::fs::write(
            &path,
            r#"(
    default_credential: (
        ssid: "greenhouse",
        secret: "tomatoes",
    ),
    reconnect: (
        short_interval_secs: 5,
        long_interval_secs: 30,
        max_short_attempts: 3,
    ),
    message_bus: (
        broker_uri: "mqtt://10.0.0.2:1883",
    ),
)"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.default_credential.ssid, "greenhouse");
        assert_eq!(config.reconnect, ReconnectPolicy::new(5, 30, 3));
        assert_eq!(config.message_bus.broker_uri, "mqtt://10.0.0.2:1883");
        // Unset sections keep their defaults
        assert_eq!(config.message_bus.queue_depth, 10);
        assert_eq!(config.provisioning.timeout_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_match_firmware() {
        let config = Config::default();
        assert_eq!(config.reconnect, ReconnectPolicy::new(5, 10, 0));
        assert_eq!(config.provisioning.timeout(), Duration::from_secs(60));
        assert_eq!(config.message_bus.qos, 1);
    }

    #[test]
    fn test_validate_rejects_zero_capacity_and_periods() {
        let mut config = Config::default();
        config.message_bus.queue_depth = 0;
        assert!(matches!(config.validate(), Err(InitError::InvalidConfig(_))));

        let mut config = Config::default();
        config.reconnect.short_interval_secs = 0;
        assert!(matches!(config.validate(), Err(InitError::InvalidConfig(_))));

        let mut config = Config::default();
        config.event_queue_depth = 0;
        assert!(matches!(config.validate(), Err(InitError::InvalidConfig(_))));
    }
}
