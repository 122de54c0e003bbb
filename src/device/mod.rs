pub mod catalog;
pub mod classifier;
pub mod manager;
pub mod models;

pub use catalog::{DeviceCatalog, SerialDriver, SerialPortCatalog, SerialPortRef};
pub use classifier::FailureCode;
pub use manager::ConnectionManager;
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not connected")]
    NotConnected,

    #[error("No serial driver or port exposed by the device")]
    NoDriver,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
