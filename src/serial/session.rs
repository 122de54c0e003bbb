//! Session task owning an open port.
//!
//! All mutable protocol state lives inside one spawned task. Callers talk to
//! it through [`ReplSession`], which only enqueues commands, so none of the
//! write entry points block or await.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use super::interface::{PortEvent, SerialPortIO};
use super::protocol::{frame_command, ControlSequence, Delivery, ReplProtocol, SentinelSet, SyncResponse};
use super::{Result, SerialError};

pub type SyncCallback = Box<dyn FnOnce(SyncResponse) + Send>;
pub type WriteCallback = Box<dyn FnOnce() + Send>;
pub type StreamSink = Arc<dyn Fn(String) + Send + Sync>;
pub type IoErrorSink = Box<dyn FnOnce(String) + Send>;

pub enum SessionCommand {
    WriteSync { id: u64, frame: Vec<u8>, on_response: SyncCallback },
    Write { frame: Vec<u8>, on_written: Option<WriteCallback> },
    AbandonSync { id: u64 },
    Shutdown,
}

struct PendingSync {
    id: u64,
    started: Instant,
    on_response: SyncCallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionMetrics {
    pub chunks_received: u64,
    pub chunks_streamed: u64,
    pub empty_chunks_dropped: u64,
    pub sync_completed: u64,
    pub sync_diagnostics: u64,
    pub sync_rejected: u64,
    pub sync_abandoned: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    pub utf8_decode_errors: u64,
    pub sync_last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// Handle to a running session
#[derive(Clone)]
pub struct ReplSession {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    sync_in_flight: Arc<AtomicBool>,
    next_sync_id: Arc<AtomicU64>,
    metrics_rx: watch::Receiver<SessionMetrics>,
}

impl ReplSession {
    /// Spawn the session task over a port whose delivery already targets `events_rx`
    pub fn spawn(
        port: Box<dyn SerialPortIO>,
        events_rx: mpsc::UnboundedReceiver<PortEvent>,
        sentinels: SentinelSet,
        write_timeout: Duration,
        on_stream: StreamSink,
        on_io_error: IoErrorSink,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = watch::channel(SessionMetrics::default());
        let sync_in_flight = Arc::new(AtomicBool::new(false));

        let task = SessionTask {
            port,
            protocol: ReplProtocol::new(sentinels),
            write_timeout,
            sync_in_flight: sync_in_flight.clone(),
            metrics: SessionMetrics::default(),
            metrics_tx,
            on_stream,
        };
        tokio::spawn(task.run(cmd_rx, events_rx, on_io_error));

        Self {
            cmd_tx,
            sync_in_flight,
            next_sync_id: Arc::new(AtomicU64::new(1)),
            metrics_rx,
        }
    }

    /// Frame `command`, enter sync mode and hand the full reply to `on_response`.
    ///
    /// Fails with [`SerialError::SyncInFlight`] while an earlier exchange is
    /// outstanding. If the write itself fails the exchange is dropped and
    /// `on_response` never runs.
    pub fn write_sync<F>(&self, command: &str, on_response: F) -> Result<()>
    where
        F: FnOnce(SyncResponse) + Send + 'static,
    {
        self.start_sync(command, Box::new(on_response)).map(|_| ())
    }

    fn start_sync(&self, command: &str, on_response: SyncCallback) -> Result<u64> {
        if self
            .sync_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("Rejected sync command while another is in flight");
            return Err(SerialError::SyncInFlight);
        }

        let id = self.next_sync_id.fetch_add(1, Ordering::Relaxed);
        let cmd = SessionCommand::WriteSync {
            id,
            frame: frame_command(command),
            on_response,
        };
        if self.cmd_tx.send(cmd).is_err() {
            self.sync_in_flight.store(false, Ordering::Release);
            return Err(SerialError::SessionClosed);
        }
        Ok(id)
    }

    /// Sync exchange with a caller-side deadline.
    ///
    /// On timeout the pending exchange is abandoned so later exchanges can run.
    pub async fn request(&self, command: &str, timeout: Duration) -> Result<SyncResponse> {
        let (tx, rx) = oneshot::channel();
        let id = self.start_sync(
            command,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        )?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SerialError::ResponseDropped),
            Err(_) => {
                log::warn!("No reply to {:?} within {:?}, abandoning exchange", command, timeout);
                let _ = self.cmd_tx.send(SessionCommand::AbandonSync { id });
                Err(SerialError::Timeout)
            }
        }
    }

    /// Framed write in stream mode; replies arrive through the stream sink
    pub fn write(&self, command: &str, on_written: Option<WriteCallback>) -> Result<()> {
        self.enqueue_write(frame_command(command), on_written)
    }

    /// Unframed write for control sequences that must not provoke a prompt
    pub fn write_command(&self, raw: &[u8], on_written: Option<WriteCallback>) -> Result<()> {
        self.enqueue_write(raw.to_vec(), on_written)
    }

    pub fn send_control(&self, control: ControlSequence) -> Result<()> {
        self.write_command(control.as_bytes(), None)
    }

    pub fn is_sync_in_flight(&self) -> bool {
        self.sync_in_flight.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<SessionMetrics> {
        self.metrics_rx.clone()
    }

    /// Close the port and stop the task
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
    }

    fn enqueue_write(&self, frame: Vec<u8>, on_written: Option<WriteCallback>) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::Write { frame, on_written })
            .map_err(|_| SerialError::SessionClosed)
    }
}

struct SessionTask {
    port: Box<dyn SerialPortIO>,
    protocol: ReplProtocol<PendingSync>,
    write_timeout: Duration,
    sync_in_flight: Arc<AtomicBool>,
    metrics: SessionMetrics,
    metrics_tx: watch::Sender<SessionMetrics>,
    on_stream: StreamSink,
}

impl SessionTask {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
        mut events_rx: mpsc::UnboundedReceiver<PortEvent>,
        on_io_error: IoErrorSink,
    ) {
        let mut io_error = None;

        loop {
            tokio::select! {
                biased;
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(SessionCommand::WriteSync { id, frame, on_response }) => {
                            let pending = PendingSync { id, started: Instant::now(), on_response };
                            self.write_sync(frame, pending).await
                        }
                        Some(SessionCommand::Write { frame, on_written }) => self.write(frame, on_written).await,
                        Some(SessionCommand::AbandonSync { id }) => self.abandon_sync(id),
                        Some(SessionCommand::Shutdown) | None => break,
                    }
                },
                maybe_event = events_rx.recv() => {
                    match maybe_event {
                        Some(PortEvent::Chunk(chunk)) => self.on_bytes_received(&chunk),
                        Some(PortEvent::IoError(msg)) => {
                            log::error!("Serial I/O error: {}", msg);
                            self.metrics.last_error = Some(msg.clone());
                            io_error = Some(msg);
                            break;
                        }
                        None => {
                            io_error = Some("delivery channel closed".to_string());
                            break;
                        }
                    }
                },
            }
        }

        self.port.close();
        self.sync_in_flight.store(false, Ordering::Release);
        if self.protocol.abandon_sync().is_some() {
            log::debug!("Session ended with a sync exchange outstanding");
        }
        self.publish_metrics();

        if let Some(msg) = io_error {
            on_io_error(msg);
        }
    }

    async fn write_sync(&mut self, frame: Vec<u8>, pending: PendingSync) {
        if let Err(rejected) = self.protocol.begin_sync(pending) {
            // The handle's flag already serialises exchanges; this only
            // guards against a command sent around it.
            log::warn!("Dropping sync exchange {} while another is outstanding", rejected.id);
            self.metrics.sync_rejected += 1;
            self.publish_metrics();
            return;
        }

        if !self.send(&frame).await {
            // Release the slot before the callback is dropped
            self.sync_in_flight.store(false, Ordering::Release);
            self.protocol.abandon_sync();
        }
    }

    async fn write(&mut self, frame: Vec<u8>, on_written: Option<WriteCallback>) {
        if self.send(&frame).await {
            if let Some(callback) = on_written {
                callback();
            }
        }
    }

    async fn send(&mut self, frame: &[u8]) -> bool {
        match self.port.write(frame, self.write_timeout).await {
            Ok(()) => {
                self.metrics.bytes_written += frame.len() as u64;
                self.publish_metrics();
                true
            }
            Err(e) => {
                log::warn!("Dropping write of {} bytes: {}", frame.len(), e);
                self.metrics.write_failures += 1;
                self.metrics.last_error = Some(e.to_string());
                self.publish_metrics();
                false
            }
        }
    }

    fn abandon_sync(&mut self, id: u64) {
        let current = self.protocol.pending().map(|p| p.id);
        if current != Some(id) {
            log::debug!("Abandon for sync exchange {} ignored, it already finished", id);
            return;
        }
        self.sync_in_flight.store(false, Ordering::Release);
        self.protocol.abandon_sync();
        self.metrics.sync_abandoned += 1;
        self.publish_metrics();
    }

    fn on_bytes_received(&mut self, chunk: &[u8]) {
        self.metrics.chunks_received += 1;
        log::debug!("Received {} bytes", chunk.len());

        match self.protocol.feed(chunk) {
            Delivery::Dropped => self.metrics.empty_chunks_dropped += 1,
            Delivery::Accumulated => {}
            Delivery::Streamed(text) => {
                self.metrics.chunks_streamed += 1;
                (self.on_stream)(text);
            }
            Delivery::SyncComplete { responder, response } => {
                self.metrics.sync_completed += 1;
                if response.is_diagnostic() {
                    self.metrics.sync_diagnostics += 1;
                }
                self.metrics.sync_last_latency_ms = Some(responder.started.elapsed().as_millis() as u64);
                log::debug!("Sync exchange {} complete: {:?}", responder.id, response.text);
                self.sync_in_flight.store(false, Ordering::Release);
                (responder.on_response)(response);
            }
        }
        self.metrics.utf8_decode_errors = self.protocol.decode_errors();
        self.publish_metrics();
    }

    fn publish_metrics(&self) {
        let _ = self.metrics_tx.send(self.metrics.clone());
    }
}
