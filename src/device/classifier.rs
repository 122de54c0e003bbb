use std::fmt;

use serde::{Deserialize, Serialize};

use super::DeviceError;
use crate::serial::SerialError;

/// Terminal connection failures reported to the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCode {
    NoDevices,
    CantOpenPort,
    ConnectionLost,
    PermissionDenied,
    NotSupported,
}

impl FailureCode {
    /// Stable numeric code shared with host applications
    pub fn code(&self) -> u8 {
        match self {
            FailureCode::NoDevices => 0,
            FailureCode::CantOpenPort => 1,
            FailureCode::ConnectionLost => 2,
            FailureCode::PermissionDenied => 3,
            FailureCode::NotSupported => 4,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FailureCode::NoDevices => "no USB devices attached",
            FailureCode::CantOpenPort => "unable to open the serial port",
            FailureCode::ConnectionLost => "device disconnected",
            FailureCode::PermissionDenied => "USB permission denied",
            FailureCode::NotSupported => "attached device is not a supported board",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Which failure a device-list query implies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome<'a, T> {
    Supported(&'a T),
    NotSupported,
    NoDevices,
}

/// First supported device in enumeration order, or the failure its absence implies
pub fn classify_discovery<'a, T>(devices: &'a [T], is_supported: impl Fn(&T) -> bool) -> DiscoveryOutcome<'a, T> {
    match devices.iter().find(|d| is_supported(*d)) {
        Some(device) => DiscoveryOutcome::Supported(device),
        None if devices.is_empty() => DiscoveryOutcome::NoDevices,
        None => DiscoveryOutcome::NotSupported,
    }
}

/// After an I/O error has settled: an empty bus means the board was
/// unplugged, anything else means the port is just unusable.
pub fn classify_io_error(devices_present: usize) -> FailureCode {
    if devices_present == 0 {
        FailureCode::ConnectionLost
    } else {
        FailureCode::CantOpenPort
    }
}

/// Failure code for an error raised while opening or configuring a port
pub fn classify_open_error(error: &DeviceError) -> FailureCode {
    let denied = match error {
        DeviceError::SerialError(SerialError::IoError(e)) => e.kind() == std::io::ErrorKind::PermissionDenied,
        DeviceError::SerialError(SerialError::SerialportError(e)) => {
            e.kind() == serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied)
        }
        _ => false,
    };
    if denied {
        FailureCode::PermissionDenied
    } else {
        FailureCode::CantOpenPort
    }
}
