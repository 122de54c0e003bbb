use serialport::SerialPortType;

use super::models::{DeviceDescriptor, PermissionResult, PermissionSender};
use super::{DeviceError, Result};
use crate::serial::{NativeSerialPort, SerialError, SerialPortIO};

/// One port exposed by a serial driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortRef {
    pub driver: String,
    pub index: usize,
    pub path: String,
}

/// Serial driver bound to a device, with its ports in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialDriver {
    pub name: String,
    pub ports: Vec<SerialPortRef>,
}

/// Platform USB stack as seen by the connection manager
pub trait DeviceCatalog: Send + Sync {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    fn has_permission(&self, device: &DeviceDescriptor) -> bool;

    /// Ask the platform for access. The answer arrives later on `notify`,
    /// possibly more than once.
    fn request_permission(&self, device: &DeviceDescriptor, notify: PermissionSender);

    fn find_drivers(&self, device: &DeviceDescriptor) -> Vec<SerialDriver>;

    fn open_port(&self, port: &SerialPortRef) -> Result<Box<dyn SerialPortIO>>;
}

/// Catalog over the host's USB-serial ports.
///
/// Desktop hosts have no permission prompt; access problems surface when the
/// port is opened.
pub struct SerialPortCatalog {
    baud_rate: u32,
}

impl SerialPortCatalog {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl DeviceCatalog for SerialPortCatalog {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let ports = serialport::available_ports().map_err(SerialError::SerialportError)?;
        let mut devices = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                devices.push(DeviceDescriptor {
                    vendor_id: usb_info.vid,
                    product_id: usb_info.pid,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                    name: port.port_name,
                });
            }
        }

        log::debug!("Found {} USB serial devices", devices.len());
        Ok(devices)
    }

    fn has_permission(&self, _device: &DeviceDescriptor) -> bool {
        true
    }

    fn request_permission(&self, device: &DeviceDescriptor, notify: PermissionSender) {
        let _ = notify.send(PermissionResult {
            device: device.clone(),
            granted: true,
        });
    }

    fn find_drivers(&self, device: &DeviceDescriptor) -> Vec<SerialDriver> {
        vec![SerialDriver {
            name: "cdc-acm".to_string(),
            ports: vec![SerialPortRef {
                driver: "cdc-acm".to_string(),
                index: 0,
                path: device.name.clone(),
            }],
        }]
    }

    fn open_port(&self, port: &SerialPortRef) -> Result<Box<dyn SerialPortIO>> {
        let native = NativeSerialPort::open(&port.path, self.baud_rate).map_err(DeviceError::SerialError)?;
        Ok(Box::new(native))
    }
}
