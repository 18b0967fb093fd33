//! JSON configuration for the loopback device used by the demo binary.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{DeviceClass, DeviceInfo, FrameType, MacAddress, PortInfo, PortStatus};
use crate::port::MAX_PORTS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One port of the configured device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub id: u8,
    #[serde(default)]
    pub class: DeviceClass,
    #[serde(default = "default_frame_types")]
    pub rx_types: Vec<FrameType>,
    #[serde(default = "default_frame_types")]
    pub tx_types: Vec<FrameType>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_online")]
    pub online: bool,
    #[serde(default)]
    pub mac: Option<MacAddress>,
}

fn default_frame_types() -> Vec<FrameType> {
    vec![FrameType::Ethernet]
}

fn default_mtu() -> u32 {
    1500
}

fn default_online() -> bool {
    true
}

impl PortConfig {
    pub fn info(&self) -> PortInfo {
        PortInfo {
            class: self.class,
            rx_types: self.rx_types.clone(),
            tx_types: self.tx_types.clone(),
        }
    }

    pub fn status(&self) -> PortStatus {
        PortStatus {
            mtu: self.mtu,
            online: self.online,
        }
    }
}

/// Device capabilities and ports.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetdevConfig {
    pub device: DeviceInfo,
    pub ports: Vec<PortConfig>,
}

impl NetdevConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: NetdevConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("device info: {e}")))?;
        let mut seen = [false; MAX_PORTS];
        for port in &self.ports {
            let slot = seen
                .get_mut(usize::from(port.id))
                .ok_or_else(|| ConfigError::Invalid(format!("port id {} out of range", port.id)))?;
            if *slot {
                return Err(ConfigError::Invalid(format!("duplicate port id {}", port.id)));
            }
            *slot = true;
        }
        Ok(())
    }
}
