use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::classifier::FailureCode;

/// Attached USB device as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// Device path or name, e.g. `/dev/ttyACM0`
    pub name: String,
}

impl DeviceDescriptor {
    /// Human-readable label, `"<manufacturer> - <product>"`
    pub fn board_label(&self) -> String {
        format!(
            "{} - {}",
            self.manufacturer.as_deref().unwrap_or("Unknown"),
            self.product.as_deref().unwrap_or("Unknown")
        )
    }
}

/// Board reached by a successful connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    pub port: String,
    pub board: String,
    pub is_micropython: bool,
    pub connected_at: DateTime<Utc>,
}

impl BoardInfo {
    pub fn from_descriptor(device: &DeviceDescriptor, is_micropython: bool) -> Self {
        Self {
            port: device.name.clone(),
            board: device.board_label(),
            is_micropython,
            connected_at: Utc::now(),
        }
    }
}

/// Device connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionStatus {
    Connecting,
    Connected { board: BoardInfo },
    Failed { code: FailureCode, message: String },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. })
    }

    pub fn failure_code(&self) -> Option<FailureCode> {
        match self {
            ConnectionStatus::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Everything the coordinator reports upward
#[derive(Debug, Clone, PartialEq)]
pub enum ReplEvent {
    Status(ConnectionStatus),
    Data(String),
}

/// The single consumer of status changes and streamed output.
///
/// Sync replies do not pass through here; they go to the callback given to
/// `write_sync`.
pub trait ConnectionObserver: Send + Sync {
    fn on_status_change(&self, status: ConnectionStatus);

    fn on_streamed_data(&self, text: String);
}

impl ConnectionObserver for mpsc::UnboundedSender<ReplEvent> {
    fn on_status_change(&self, status: ConnectionStatus) {
        let _ = self.send(ReplEvent::Status(status));
    }

    fn on_streamed_data(&self, text: String) {
        let _ = self.send(ReplEvent::Data(text));
    }
}

/// Outcome of a platform permission prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionResult {
    pub device: DeviceDescriptor,
    pub granted: bool,
}

pub type PermissionSender = mpsc::UnboundedSender<PermissionResult>;
