pub mod frame;
pub mod interface;
pub mod queue;
pub mod transport;

pub use frame::{Frame, FrameDecoder, MessageId};
pub use interface::{SerialConnector, SerialInterface, SystemPortEnumerator};
pub use queue::{QueueBuilder, QueueHandle};
pub use transport::{Connector, PortEnumerator, Transport};

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Command queue closed")]
    QueueClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
