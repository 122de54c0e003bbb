#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use micro_repl_lib::device::{PermissionResult, PermissionSender, SerialDriver, SerialPortRef};
use micro_repl_lib::serial::interface::{PortEvent, PortParameters, SerialPortIO};
use micro_repl_lib::serial::SerialError;
use micro_repl_lib::{
    ConnectionManager, ConnectionStatus, DeviceCatalog, DeviceDescriptor, ReplEvent, ReplSettings,
};

pub const MICROPYTHON_VID: u16 = 11914;
pub const OTHER_VID: u16 = 0x1234;

pub fn board(vendor_id: u16, name: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id: 0x0005,
        manufacturer: Some("MicroPython".to_string()),
        product: Some("Board in FS mode".to_string()),
        name: name.to_string(),
    }
}

/// Shared view of the in-memory port so tests can inject traffic and inspect writes
#[derive(Default)]
pub struct PortProbe {
    pub written: Mutex<Vec<Vec<u8>>>,
    pub params: Mutex<Option<PortParameters>>,
    pub dtr: AtomicBool,
    pub open: AtomicBool,
    pub fail_dtr: AtomicBool,
    pub fail_writes: AtomicBool,
    pub closed_after_start: AtomicBool,
    pub events: Mutex<Option<mpsc::UnboundedSender<PortEvent>>>,
}

impl PortProbe {
    pub fn push_chunk(&self, chunk: &[u8]) {
        let guard = self.events.lock().unwrap();
        guard
            .as_ref()
            .expect("delivery not started")
            .send(PortEvent::Chunk(chunk.to_vec()))
            .unwrap();
    }

    pub fn push_io_error(&self, message: &str) {
        let guard = self.events.lock().unwrap();
        guard
            .as_ref()
            .expect("delivery not started")
            .send(PortEvent::IoError(message.to_string()))
            .unwrap();
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct MockPort {
    probe: Arc<PortProbe>,
}

#[async_trait::async_trait]
impl SerialPortIO for MockPort {
    fn set_parameters(&mut self, params: &PortParameters) -> Result<(), SerialError> {
        *self.probe.params.lock().unwrap() = Some(*params);
        Ok(())
    }

    fn set_dtr(&mut self, asserted: bool) -> Result<(), SerialError> {
        if self.probe.fail_dtr.load(Ordering::SeqCst) {
            return Err(SerialError::ProtocolError("DTR not supported".to_string()));
        }
        self.probe.dtr.store(asserted, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<(), SerialError> {
        if self.probe.fail_writes.load(Ordering::SeqCst) {
            return Err(SerialError::Timeout);
        }
        self.probe.written.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn start_delivery(&mut self, events: mpsc::UnboundedSender<PortEvent>) -> Result<(), SerialError> {
        *self.probe.events.lock().unwrap() = Some(events);
        if self.probe.closed_after_start.load(Ordering::SeqCst) {
            self.probe.open.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.probe.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.probe.open.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockCatalog {
    pub devices: Mutex<Vec<DeviceDescriptor>>,
    pub permitted: AtomicBool,
    pub no_drivers: AtomicBool,
    pub permission_requests: Mutex<Vec<(DeviceDescriptor, PermissionSender)>>,
    pub opened: AtomicUsize,
    pub probe: Arc<PortProbe>,
}

impl MockCatalog {
    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Arc<Self> {
        let catalog = Self::default();
        *catalog.devices.lock().unwrap() = devices;
        catalog.permitted.store(true, Ordering::SeqCst);
        Arc::new(catalog)
    }

    pub fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        *self.devices.lock().unwrap() = devices;
    }

    /// Deliver a platform answer to the most recent permission request
    pub fn answer_permission(&self, granted: bool) {
        let requests = self.permission_requests.lock().unwrap();
        let (device, notify) = requests.last().expect("no permission requested");
        let _ = notify.send(PermissionResult {
            device: device.clone(),
            granted,
        });
    }

    pub fn permission_request_count(&self) -> usize {
        self.permission_requests.lock().unwrap().len()
    }
}

impl DeviceCatalog for MockCatalog {
    fn list_devices(&self) -> micro_repl_lib::device::Result<Vec<DeviceDescriptor>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn has_permission(&self, _device: &DeviceDescriptor) -> bool {
        self.permitted.load(Ordering::SeqCst)
    }

    fn request_permission(&self, device: &DeviceDescriptor, notify: PermissionSender) {
        self.permission_requests
            .lock()
            .unwrap()
            .push((device.clone(), notify));
    }

    fn find_drivers(&self, device: &DeviceDescriptor) -> Vec<SerialDriver> {
        if self.no_drivers.load(Ordering::SeqCst) {
            return Vec::new();
        }
        vec![SerialDriver {
            name: "mock-cdc".to_string(),
            ports: vec![SerialPortRef {
                driver: "mock-cdc".to_string(),
                index: 0,
                path: device.name.clone(),
            }],
        }]
    }

    fn open_port(&self, _port: &SerialPortRef) -> micro_repl_lib::device::Result<Box<dyn SerialPortIO>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.probe.open.store(true, Ordering::SeqCst);
        Ok(Box::new(MockPort {
            probe: self.probe.clone(),
        }))
    }
}

pub struct Harness {
    pub catalog: Arc<MockCatalog>,
    pub manager: ConnectionManager,
    pub events: mpsc::UnboundedReceiver<ReplEvent>,
}

pub fn test_settings() -> ReplSettings {
    ReplSettings {
        settle_delay_ms: 20,
        ..ReplSettings::default()
    }
}

impl Harness {
    pub fn new(catalog: Arc<MockCatalog>) -> Self {
        Self::with_settings(catalog, test_settings())
    }

    pub fn with_settings(catalog: Arc<MockCatalog>, settings: ReplSettings) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(catalog.clone(), Arc::new(tx), settings);
        Self { catalog, manager, events }
    }

    /// Start the manager and return once it reports `Connected`
    pub async fn connected(catalog: Arc<MockCatalog>) -> Self {
        let mut harness = Self::new(catalog);
        harness.manager.start().await;
        assert_eq!(harness.next_status().await, ConnectionStatus::Connecting);
        let status = harness.next_status().await;
        assert!(status.is_connected(), "expected Connected, got {:?}", status);
        harness
    }

    pub async fn next_event(&mut self) -> ReplEvent {
        timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    pub async fn next_status(&mut self) -> ConnectionStatus {
        loop {
            if let ReplEvent::Status(status) = self.next_event().await {
                return status;
            }
        }
    }

    pub async fn next_data(&mut self) -> String {
        loop {
            if let ReplEvent::Data(text) = self.next_event().await {
                return text;
            }
        }
    }

    /// True if no event shows up within `wait`
    pub async fn quiet_for(&mut self, wait: Duration) -> bool {
        timeout(wait, self.events.recv()).await.is_err()
    }
}
