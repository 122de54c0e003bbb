use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serial::interface::{Parity, PortParameters};
use crate::serial::SentinelSet;

/// Raspberry Pi (Trading) Ltd, the vendor id MicroPython boards enumerate with
pub const RASPBERRY_PI_VENDOR_ID: u16 = 11914;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Connection and protocol settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub write_timeout_ms: u64,
    /// Wait after an I/O error before deciding between unplug and open failure
    pub settle_delay_ms: u64,
    /// Vendor allow-list; the first entry is the recognized firmware family
    pub supported_vendors: Vec<u16>,
    pub sentinels: SentinelSet,
}

impl Default for ReplSettings {
    fn default() -> Self {
        let port = PortParameters::default();
        Self {
            baud_rate: port.baud_rate,
            data_bits: port.data_bits,
            stop_bits: port.stop_bits,
            parity: port.parity,
            write_timeout_ms: 2000,
            settle_delay_ms: 2000,
            supported_vendors: vec![RASPBERRY_PI_VENDOR_ID],
            sentinels: SentinelSet::default(),
        }
    }
}

impl ReplSettings {
    /// Load settings from a JSON file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: ReplSettings = serde_json::from_str(&raw)?;
        settings.validate()?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.supported_vendors.is_empty() {
            return Err(ConfigError::Invalid("supported_vendors must not be empty".to_string()));
        }
        if self.sentinels.sync_complete.iter().all(|s| s.is_empty()) {
            return Err(ConfigError::Invalid("at least one sync-complete sentinel is required".to_string()));
        }
        Ok(())
    }

    pub fn port_parameters(&self) -> PortParameters {
        PortParameters {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn is_supported_vendor(&self, vendor_id: u16) -> bool {
        self.supported_vendors.contains(&vendor_id)
    }

    /// Boards from the first allow-listed vendor run the recognized firmware
    pub fn is_recognized_firmware(&self, vendor_id: u16) -> bool {
        self.supported_vendors.first() == Some(&vendor_id)
    }
}
