pub mod manager;
pub mod models;
pub mod registry;
pub mod session;

pub use manager::SessionManager;
pub use models::*;
pub use registry::PortRegistry;
pub use session::Session;

use crate::serial::frame::MessageId;
use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Invalid handle: {0}")]
    InvalidHandle(SessionHandle),

    #[error("Invalid slot {0}, expected 4, 5 or 6")]
    InvalidSlot(u8),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Transport error: {0}")]
    Transport(#[from] SerialError),

    #[error("Slot busy: {0}")]
    SlotBusy(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Stage parameters unavailable for slot {0}")]
    StageParamsUnavailable(u8),

    #[error("Device fault: {0}")]
    DeviceFault(String),

    #[error("Port enumeration failed: {0}")]
    EnumerationError(String),

    #[error("File {0} already exists")]
    FileExists(u8),

    #[error("File {0} not found")]
    FileNotFound(u8),

    #[error("Unsupported file attributes 0x{0:02X}")]
    InvalidAttribute(u8),
}

impl DeviceError {
    /// Signed status code, always negative
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::InvalidHandle(_) => -1,
            DeviceError::InvalidSlot(_) => -2,
            DeviceError::DeviceNotFound(_) => -3,
            DeviceError::Transport(_) => -4,
            DeviceError::SlotBusy(_) => -5,
            DeviceError::OutOfRange(_) => -6,
            DeviceError::PermissionDenied(_) => -7,
            DeviceError::StageParamsUnavailable(_) => -8,
            DeviceError::DeviceFault(_) => -9,
            DeviceError::EnumerationError(_) => -10,
            DeviceError::FileExists(_) => -11,
            DeviceError::FileNotFound(_) => -12,
            DeviceError::InvalidAttribute(_) => -13,
        }
    }

    /// Map an error code reported by the controller firmware.
    /// `target` is the slot or file name the failed request addressed.
    pub fn from_device_code(failed_id: u16, code: u16, target: u8) -> Self {
        let context = format!("controller rejected 0x{:04X}", failed_id);
        match code {
            DeviceErrorCode::INVALID_SLOT => DeviceError::InvalidSlot(target),
            DeviceErrorCode::BUSY => DeviceError::SlotBusy(context),
            DeviceErrorCode::OUT_OF_RANGE => DeviceError::OutOfRange(context),
            DeviceErrorCode::PERMISSION => DeviceError::PermissionDenied(context),
            DeviceErrorCode::FILE_EXISTS => DeviceError::FileExists(target),
            DeviceErrorCode::FILE_NOT_FOUND => DeviceError::FileNotFound(target),
            DeviceErrorCode::INVALID_ATTRIBUTE => DeviceError::InvalidAttribute(target),
            DeviceErrorCode::NO_STAGE_PARAMS => DeviceError::StageParamsUnavailable(target),
            DeviceErrorCode::FAULT => DeviceError::DeviceFault(context),
            other => DeviceError::Transport(SerialError::ProtocolError(format!(
                "{} with unknown code {}",
                context, other
            ))),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, DeviceError::Transport(_))
    }
}

/// Error codes sent back by the controller in `HW_RICH_RESPONSE`
pub struct DeviceErrorCode;

impl DeviceErrorCode {
    pub const INVALID_SLOT: u16 = 1;
    pub const BUSY: u16 = 2;
    pub const OUT_OF_RANGE: u16 = 3;
    pub const PERMISSION: u16 = 4;
    pub const FILE_EXISTS: u16 = 5;
    pub const FILE_NOT_FOUND: u16 = 6;
    pub const INVALID_ATTRIBUTE: u16 = 7;
    pub const NO_STAGE_PARAMS: u16 = 8;
    pub const FAULT: u16 = 9;

    /// Reply id carrying these codes
    pub const FRAME_ID: u16 = MessageId::HW_RICH_RESPONSE;
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// 0 on success, the error's negative code otherwise
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}
