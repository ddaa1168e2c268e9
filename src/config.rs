//! Configuration file and settings management
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(unused)]
pub struct Network {
    /// Relays queried and published to when a form names none.
    pub relays: Vec<String>,
    pub query_timeout_ms: u64,
    pub publish_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(unused)]
pub struct Logging {
    pub level: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(unused)]
pub struct Settings {
    pub network: Network,
    pub logging: Logging,
}

impl Settings {
    /// Defaults, overridden by the config file (when it exists), then by
    /// `NFA__SECTION__KEY` environment variables.
    pub fn new(config_file_name: &Option<String>) -> Result<Self, ConfigError> {
        let default_settings = Self::default();
        let mut builder = Config::builder().add_source(Config::try_from(&default_settings)?);
        if let Some(name) = config_file_name {
            builder = builder.add_source(File::from(Path::new(name)).required(false));
        }
        let config = builder
            .add_source(
                Environment::with_prefix("NFA")
                    .try_parsing(true)
                    .separator("__"),
            )
            .build()?;
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.network.query_timeout_ms == 0 || self.network.publish_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "network timeouts must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.network.query_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.network.publish_timeout_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            network: Network {
                relays: vec![
                    "wss://relay.damus.io".to_owned(),
                    "wss://nos.lol".to_owned(),
                ],
                query_timeout_ms: 5000,
                publish_timeout_ms: 5000,
            },
            logging: Logging {
                level: "info".to_owned(),
            },
        }
    }
}
