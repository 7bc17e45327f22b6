//! Host-side driver for MCM301 style three-slot stepper motor controllers.
//!
//! A [`SessionManager`] discovers controllers on the host's serial ports and
//! opens one [`Session`] per controller. Each session serialises its traffic
//! through a request queue and tracks the motion state of slots 4, 5 and 6.
//! Stage motion, persistent parameters, status polling and the embedded file
//! system are all methods on `Session`.
pub mod config;
pub mod device;
pub mod efs;
pub mod serial;
pub mod stage;
pub mod status;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::DriverSettings;
pub use device::{
    status_code, DeviceError, ErrorState, PortDescriptor, Result, Session, SessionHandle, SessionInfo,
    SessionManager, SlotId,
};
pub use efs::{EfsFileInfo, EfsHardwareInfo, FileAttributes};
pub use stage::{HomeDirection, JogDirection, MotionState, PersistKind, SoftLimitMode, SoftLimits, StageParams};
pub use status::{BoardStatus, HardwareInfo, MotorStatus, StatusBits};
