use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::catalog::DeviceCatalog;
use super::classifier::{classify_discovery, classify_io_error, classify_open_error, DiscoveryOutcome, FailureCode};
use super::models::{BoardInfo, ConnectionObserver, ConnectionStatus, DeviceDescriptor, PermissionResult};
use super::{DeviceError, Result};
use crate::config::ReplSettings;
use crate::serial::{ReplSession, SyncResponse, WriteCallback};

/// Drives discovery, permission, port setup and the protocol session for a
/// single board, and reports every status change to one observer.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    catalog: Arc<dyn DeviceCatalog>,
    observer: Arc<dyn ConnectionObserver>,
    settings: ReplSettings,
    state: Mutex<ManagerState>,
}

struct ManagerState {
    status: ConnectionStatus,
    permission_granted: bool,
    permission_listener: Option<JoinHandle<()>>,
    session: Option<ReplSession>,
    /// Bumped on every opened session so a stale I/O error cannot fail a newer one
    generation: u64,
    torn_down: bool,
}

impl ManagerState {
    fn port_open(&self) -> bool {
        self.session.as_ref().map_or(false, |s| !s.is_closed())
    }
}

impl ConnectionManager {
    pub fn new(
        catalog: Arc<dyn DeviceCatalog>,
        observer: Arc<dyn ConnectionObserver>,
        settings: ReplSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                catalog,
                observer,
                settings,
                state: Mutex::new(ManagerState {
                    status: ConnectionStatus::Connecting,
                    permission_granted: false,
                    permission_listener: None,
                    session: None,
                    generation: 0,
                    torn_down: false,
                }),
            }),
        }
    }

    pub fn settings(&self) -> &ReplSettings {
        &self.inner.settings
    }

    /// Setup hook: report `Connecting`, then look for a board
    pub async fn start(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.torn_down = false;
            self.emit_locked(&mut state, ConnectionStatus::Connecting);
        }
        self.discover().await;
    }

    /// Pick the first allow-listed device and move on to the permission check
    pub async fn discover(&self) {
        let devices = match self.inner.catalog.list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                log::error!("Device enumeration failed: {}", e);
                Vec::new()
            }
        };
        log::info!("Discovery found {} attached devices", devices.len());

        let settings = &self.inner.settings;
        let device = match classify_discovery(&devices, |d| settings.is_supported_vendor(d.vendor_id)) {
            DiscoveryOutcome::Supported(device) => device.clone(),
            DiscoveryOutcome::NotSupported => {
                self.fail(FailureCode::NotSupported, String::new()).await;
                return;
            }
            DiscoveryOutcome::NoDevices => {
                self.fail(FailureCode::NoDevices, String::new()).await;
                return;
            }
        };

        log::info!("Supported board found: {} on {}", device.board_label(), device.name);
        self.ensure_permission(device).await;
    }

    /// Connect right away if access is already granted, otherwise ask the
    /// platform and wait for its answer on a fresh subscription.
    pub async fn ensure_permission(&self, device: DeviceDescriptor) {
        let mut state = self.inner.state.lock().await;
        if state.torn_down {
            return;
        }

        if self.inner.catalog.has_permission(&device) {
            state.permission_granted = true;
            self.connect_locked(&mut state, &device);
            return;
        }

        log::info!("Requesting USB permission for {}", device.name);
        let (tx, mut rx) = mpsc::unbounded_channel::<PermissionResult>();
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let listener = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                ConnectionManager { inner }.handle_permission_result(result).await;
            }
        });

        if let Some(previous) = state.permission_listener.replace(listener) {
            previous.abort();
        }
        state.permission_granted = false;
        drop(state);

        self.inner.catalog.request_permission(&device, tx);
    }

    /// Apply a grant/deny notification.
    ///
    /// Notifications are ignored once permission was granted or a port is open,
    /// so a re-delivered answer can neither reconnect nor fail a live session.
    pub async fn handle_permission_result(&self, result: PermissionResult) {
        let mut state = self.inner.state.lock().await;
        if state.torn_down {
            return;
        }
        if state.permission_granted || state.port_open() {
            log::warn!(
                "Ignoring duplicate permission notification for {} (granted: {})",
                result.device.name,
                result.granted
            );
            return;
        }

        // First answer wins; when this runs on the listener task the abort
        // lands on its next receive.
        if let Some(listener) = state.permission_listener.take() {
            listener.abort();
        }

        if result.granted {
            log::info!("USB permission granted for {}", result.device.name);
            state.permission_granted = true;
            self.connect_locked(&mut state, &result.device);
        } else {
            log::warn!("USB permission denied for {}", result.device.name);
            self.fail_locked(&mut state, FailureCode::PermissionDenied, String::new());
        }
    }

    /// Destroy hook: drop the permission subscription and close the port
    pub async fn teardown(&self) {
        let mut state = self.inner.state.lock().await;
        state.torn_down = true;
        if let Some(listener) = state.permission_listener.take() {
            listener.abort();
        }
        if let Some(session) = state.session.take() {
            session.shutdown();
        }
        state.permission_granted = false;
        log::info!("Connection manager torn down");
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().await.status.clone()
    }

    pub async fn session(&self) -> Option<ReplSession> {
        self.inner.state.lock().await.session.clone()
    }

    pub async fn write_sync<F>(&self, command: &str, on_response: F) -> Result<()>
    where
        F: FnOnce(SyncResponse) + Send + 'static,
    {
        let session = self.session().await.ok_or(DeviceError::NotConnected)?;
        session.write_sync(command, on_response)?;
        Ok(())
    }

    pub async fn request(&self, command: &str, timeout: Duration) -> Result<SyncResponse> {
        let session = self.session().await.ok_or(DeviceError::NotConnected)?;
        Ok(session.request(command, timeout).await?)
    }

    pub async fn write(&self, command: &str, on_written: Option<WriteCallback>) -> Result<()> {
        let session = self.session().await.ok_or(DeviceError::NotConnected)?;
        session.write(command, on_written)?;
        Ok(())
    }

    pub async fn write_command(&self, raw: &[u8], on_written: Option<WriteCallback>) -> Result<()> {
        let session = self.session().await.ok_or(DeviceError::NotConnected)?;
        session.write_command(raw, on_written)?;
        Ok(())
    }

    fn connect_locked(&self, state: &mut ManagerState, device: &DeviceDescriptor) {
        if let Some(previous) = state.session.take() {
            log::info!("Closing previous session before reconnecting");
            previous.shutdown();
        }
        state.generation += 1;
        match self.open_session(device, state.generation) {
            Ok(session) => {
                state.session = Some(session);
                let board = BoardInfo::from_descriptor(
                    device,
                    self.inner.settings.is_recognized_firmware(device.vendor_id),
                );
                log::info!("Connected to {} on {}", board.board, board.port);
                self.emit_locked(state, ConnectionStatus::Connected { board });
            }
            Err(e) => {
                log::error!("Failed to open {}: {}", device.name, e);
                self.fail_locked(state, classify_open_error(&e), e.to_string());
            }
        }
    }

    fn open_session(&self, device: &DeviceDescriptor, generation: u64) -> Result<ReplSession> {
        let catalog = &self.inner.catalog;
        let settings = &self.inner.settings;

        let port_ref = catalog
            .find_drivers(device)
            .into_iter()
            .next()
            .and_then(|driver| driver.ports.into_iter().next())
            .ok_or(DeviceError::NoDriver)?;

        let mut port = catalog.open_port(&port_ref)?;
        let configured = port
            .set_parameters(&settings.port_parameters())
            // The REPL's CDC profile only starts talking once DTR is raised
            .and_then(|_| port.set_dtr(true));
        if let Err(e) = configured {
            port.close();
            return Err(e.into());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = port.start_delivery(events_tx) {
            port.close();
            return Err(e.into());
        }
        if !port.is_open() {
            return Err(DeviceError::SerialError(crate::serial::SerialError::ConnectionFailed(
                format!("{} did not stay open", port_ref.path),
            )));
        }

        let observer = self.inner.observer.clone();
        let weak = Arc::downgrade(&self.inner);
        let session = ReplSession::spawn(
            port,
            events_rx,
            settings.sentinels.clone(),
            settings.write_timeout(),
            Arc::new(move |text: String| observer.on_streamed_data(text)),
            Box::new(move |message: String| {
                if let Some(inner) = weak.upgrade() {
                    tokio::spawn(ConnectionManager { inner }.handle_io_error(generation, message));
                }
            }),
        );
        Ok(session)
    }

    /// Mask the error as `Connecting`, let the bus settle, then decide whether
    /// the board was unplugged or its port is just unusable.
    async fn handle_io_error(self, generation: u64, message: String) {
        {
            let mut state = self.inner.state.lock().await;
            if state.torn_down || state.generation != generation {
                return;
            }
            if let Some(session) = state.session.take() {
                session.shutdown();
            }
            self.emit_locked(&mut state, ConnectionStatus::Connecting);
        }

        tokio::time::sleep(self.inner.settings.settle_delay()).await;

        let present = match self.inner.catalog.list_devices() {
            Ok(devices) => devices.len(),
            Err(e) => {
                log::warn!("Device enumeration after I/O error failed: {}", e);
                0
            }
        };

        let mut state = self.inner.state.lock().await;
        if state.torn_down || state.generation != generation {
            return;
        }
        self.fail_locked(&mut state, classify_io_error(present), message);
    }

    async fn fail(&self, code: FailureCode, message: String) {
        let mut state = self.inner.state.lock().await;
        self.fail_locked(&mut state, code, message);
    }

    fn fail_locked(&self, state: &mut ManagerState, code: FailureCode, message: String) {
        if let Some(session) = state.session.take() {
            session.shutdown();
        }
        log::warn!("Connection failed: {} ({})", code, message);
        self.emit_locked(state, ConnectionStatus::Failed { code, message });
    }

    fn emit_locked(&self, state: &mut ManagerState, status: ConnectionStatus) {
        state.status = status.clone();
        self.inner.observer.on_status_change(status);
    }
}
