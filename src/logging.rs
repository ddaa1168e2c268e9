//! Tracing subscriber setup.
use config::ConfigError;
use tracing::Level;

use crate::config::Logging;
use crate::error::{Error, Result};

/// Install a global fmt subscriber at the configured level.
///
/// Fails if the level does not parse or a subscriber is already installed.
pub fn init(logging: &Logging) -> Result<()> {
    let level = parse_level(&logging.level)?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| Error::Config(ConfigError::Message(e.to_string())))
}

fn parse_level(level: &str) -> Result<Level> {
    level
        .parse::<Level>()
        .map_err(|_| Error::Config(ConfigError::Message(format!("unknown log level {}", level))))
}
