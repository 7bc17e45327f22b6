use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::device::{DeviceError, Result};

bitflags! {
    /// File permission bits, separately for the host application and the firmware
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FileAttributes: u8 {
        const APP_READ = 0x01;
        const APP_WRITE = 0x02;
        const APP_DELETE = 0x04;
        const FIRMWARE_READ = 0x08;
        const FIRMWARE_WRITE = 0x10;
        const FIRMWARE_DELETE = 0x20;
    }
}

impl FileAttributes {
    /// Reject bits outside the six defined ones
    pub fn from_wire(raw: u8) -> Result<Self> {
        FileAttributes::from_bits(raw).ok_or(DeviceError::InvalidAttribute(raw))
    }

    pub fn allows(self, access: Access) -> bool {
        self.contains(access.required_bit())
    }
}

/// Operation checked against a file's attributes, always in the application context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Delete,
}

impl Access {
    pub fn required_bit(self) -> FileAttributes {
        match self {
            Access::Read => FileAttributes::APP_READ,
            Access::Write => FileAttributes::APP_WRITE,
            Access::Delete => FileAttributes::APP_DELETE,
        }
    }
}

/// Geometry and capacity of the controller's file storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EfsHardwareInfo {
    pub available: bool,
    pub version: u8,
    pub page_size: u16,
    pub pages_supported: u16,
    pub maximum_files: u16,
    pub files_remain: u16,
    pub pages_remain: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EfsFileInfo {
    pub name: u8,
    pub exists: bool,
    /// Created by the application rather than the firmware
    pub owned: bool,
    pub attributes: FileAttributes,
    pub length_pages: u16,
}

impl EfsFileInfo {
    pub fn size_bytes(&self, page_size: u16) -> u32 {
        self.length_pages as u32 * page_size as u32
    }

    /// Check that `[address, address + len)` lies inside the file and that
    /// `access` is allowed
    pub fn check_access(&self, access: Access, address: u32, len: usize, page_size: u16) -> Result<()> {
        if !self.attributes.allows(access) {
            return Err(DeviceError::PermissionDenied(format!(
                "file {} does not allow {:?}",
                self.name, access
            )));
        }
        let end = address as u64 + len as u64;
        let extent = self.size_bytes(page_size) as u64;
        if end > extent {
            return Err(DeviceError::OutOfRange(format!(
                "bytes {}..{} outside file {} of {} bytes",
                address, end, self.name, extent
            )));
        }
        Ok(())
    }
}
