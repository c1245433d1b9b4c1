//! Configuration for Homegate.
//!
//! One immutable record per subsystem. The running servers hold the active
//! configuration behind an atomic pointer swap; `set_config` validates a new
//! record, swaps it in and restarts listeners only when the bind point moved.

pub mod dhcp;
pub mod dns;
pub mod logging;

pub use dhcp::{Dhcp4Config, Dhcp6Config, DhcpConfig, RawDhcpOption};
pub use dns::DnsConfig;
pub use logging::LoggingConfig;

use crate::DomainError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub dhcp: DhcpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, DomainError> {
        let config: Config =
            toml::from_str(text).map_err(|e| DomainError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        self.dns.validate()?;
        self.dhcp.validate()?;
        Ok(())
    }
}
