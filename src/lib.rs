pub mod serial;
pub mod device;
pub mod config;

pub use config::ReplSettings;
pub use device::{
    BoardInfo, ConnectionManager, ConnectionObserver, ConnectionStatus, DeviceCatalog, DeviceDescriptor,
    FailureCode, ReplEvent, SerialPortCatalog,
};
pub use serial::{ControlSequence, ReplSession, SerialError, SyncResponse};
