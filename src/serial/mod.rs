pub mod interface;
pub mod protocol;
pub mod session;

pub use interface::{NativeSerialPort, PortEvent, PortParameters, SerialPortIO};
pub use protocol::{frame_command, ControlSequence, ReplProtocol, SentinelSet, SyncResponse};
pub use session::{ReplSession, SessionMetrics, WriteCallback};

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Another synchronous exchange is still in flight")]
    SyncInFlight,

    #[error("Session closed")]
    SessionClosed,

    #[error("Response dropped before completion")]
    ResponseDropped,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
