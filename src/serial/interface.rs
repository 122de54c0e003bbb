use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use super::{Result, SerialError};

pub const BAUD_RATE: u32 = 115200;
const READ_BUFFER_SIZE: usize = 1024;

/// Inbound traffic pushed by a running port
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Chunk(Vec<u8>),
    IoError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Line settings applied to a freshly opened port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortParameters {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for PortParameters {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

/// One opened serial connection.
///
/// Ports are configured while idle, then `start_delivery` hands every inbound
/// chunk and the first I/O error to the given channel. Writes stay available
/// on the caller's side after delivery starts.
#[async_trait]
pub trait SerialPortIO: Send {
    fn set_parameters(&mut self, params: &PortParameters) -> Result<()>;

    fn set_dtr(&mut self, asserted: bool) -> Result<()>;

    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    fn start_delivery(&mut self, events: mpsc::UnboundedSender<PortEvent>) -> Result<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

enum PortState {
    Idle(SerialStream),
    Delivering {
        writer: WriteHalf<SerialStream>,
        pump: JoinHandle<()>,
    },
    Closed,
}

/// `SerialPortIO` over a tokio-serial stream
pub struct NativeSerialPort {
    port_name: String,
    state: PortState,
}

impl NativeSerialPort {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let stream = tokio_serial::new(port_name, baud_rate)
            .open_native_async()
            .map_err(|e| {
                log::error!("Failed to open {}: {}", port_name, e);
                SerialError::SerialportError(e)
            })?;

        log::info!("Opened serial port {}", port_name);
        Ok(Self {
            port_name: port_name.to_string(),
            state: PortState::Idle(stream),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn idle_stream(&mut self) -> Result<&mut SerialStream> {
        match &mut self.state {
            PortState::Idle(stream) => Ok(stream),
            PortState::Delivering { .. } => Err(SerialError::ProtocolError(
                "Port settings are locked once delivery has started".to_string(),
            )),
            PortState::Closed => Err(SerialError::ConnectionFailed("Port closed".to_string())),
        }
    }
}

#[async_trait]
impl SerialPortIO for NativeSerialPort {
    fn set_parameters(&mut self, params: &PortParameters) -> Result<()> {
        let data_bits = match params.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => return Err(SerialError::ProtocolError(format!("Unsupported data bits: {}", other))),
        };
        let stop_bits = match params.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => return Err(SerialError::ProtocolError(format!("Unsupported stop bits: {}", other))),
        };

        let stream = self.idle_stream()?;
        stream.set_baud_rate(params.baud_rate)?;
        stream.set_data_bits(data_bits)?;
        stream.set_stop_bits(stop_bits)?;
        stream.set_parity(params.parity.into())?;
        Ok(())
    }

    fn set_dtr(&mut self, asserted: bool) -> Result<()> {
        self.idle_stream()?.write_data_terminal_ready(asserted)?;
        Ok(())
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let write_op = async {
            match &mut self.state {
                PortState::Idle(stream) => {
                    stream.write_all(data).await?;
                    stream.flush().await
                }
                PortState::Delivering { writer, .. } => {
                    writer.write_all(data).await?;
                    writer.flush().await
                }
                PortState::Closed => Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "port closed",
                )),
            }
        };

        tokio::time::timeout(timeout, write_op)
            .await
            .map_err(|_| SerialError::Timeout)?
            .map_err(SerialError::IoError)
    }

    fn start_delivery(&mut self, events: mpsc::UnboundedSender<PortEvent>) -> Result<()> {
        let stream = match std::mem::replace(&mut self.state, PortState::Closed) {
            PortState::Idle(stream) => stream,
            other => {
                self.state = other;
                return Err(SerialError::ProtocolError("Delivery already started".to_string()));
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        let pump = tokio::spawn(read_pump(self.port_name.clone(), reader, events));
        self.state = PortState::Delivering { writer, pump };
        Ok(())
    }

    fn close(&mut self) {
        if let PortState::Delivering { pump, .. } = &self.state {
            pump.abort();
        }
        if !matches!(self.state, PortState::Closed) {
            log::info!("Closing serial port {}", self.port_name);
        }
        self.state = PortState::Closed;
    }

    fn is_open(&self) -> bool {
        !matches!(self.state, PortState::Closed)
    }
}

impl Drop for NativeSerialPort {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_pump(
    port_name: String,
    mut reader: ReadHalf<SerialStream>,
    events: mpsc::UnboundedSender<PortEvent>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(PortEvent::IoError(format!("{}: end of stream", port_name)));
                break;
            }
            Ok(n) => {
                if events.send(PortEvent::Chunk(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                log::error!("Read pump on {} failed: {}", port_name, e);
                let _ = events.send(PortEvent::IoError(e.to_string()));
                break;
            }
        }
    }
    log::debug!("Read pump on {} stopped", port_name);
}
