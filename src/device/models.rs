use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DeviceError;

/// One serial port as reported by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub device_name: String,
    pub serial_number: String,
    pub descriptor: String,
    pub vendor_name: String,
}

impl PortDescriptor {
    /// Parse a `device_name,serial_number,descriptor,vendor_name` record.
    ///
    /// Fields may be empty but all four must be present; anything past the
    /// fourth comma belongs to the vendor name.
    pub fn parse_record(record: &str) -> Option<Self> {
        let mut fields = record.trim().splitn(4, ',').map(str::trim);
        let device_name = fields.next()?.to_string();
        let serial_number = fields.next()?.to_string();
        let descriptor = fields.next()?.to_string();
        let vendor_name = fields.next()?.to_string();
        if device_name.is_empty() {
            return None;
        }
        Some(Self {
            device_name,
            serial_number,
            descriptor,
            vendor_name,
        })
    }

    pub fn to_record(&self) -> String {
        format!(
            "{},{},{},{}",
            self.device_name,
            self.serial_number.replace(',', " "),
            self.descriptor.replace(',', " "),
            self.vendor_name
        )
    }
}

/// Index of an open session. Indices are reused after `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle(pub u32);

impl SessionHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage slot on the controller backplane (4, 5 or 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SlotId(u8);

impl SlotId {
    pub const FIRST: u8 = 4;
    pub const LAST: u8 = 6;
    pub const ALL: [SlotId; 3] = [SlotId(4), SlotId(5), SlotId(6)];

    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero based position used for per-slot tables
    pub fn index(self) -> usize {
        (self.0 - Self::FIRST) as usize
    }
}

impl TryFrom<u8> for SlotId {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::FIRST..=Self::LAST).contains(&value) {
            Ok(SlotId(value))
        } else {
            Err(DeviceError::InvalidSlot(value))
        }
    }
}

impl From<SlotId> for u8 {
    fn from(slot: SlotId) -> u8 {
        slot.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public view of an open session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub handle: SessionHandle,
    pub port: PortDescriptor,
    pub baud_rate: u32,
    pub timeout_secs: u32,
    pub opened_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn serial_number(&self) -> &str {
        &self.port.serial_number
    }
}

/// Link health of a session, derived from its queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorState {
    Ok,
    Timeout,
    LinkFault(String),
    Closed,
}

impl ErrorState {
    pub fn is_ok(&self) -> bool {
        matches!(self, ErrorState::Ok)
    }

    /// Status code in the same numbering as `DeviceError::code`
    pub fn code(&self) -> i32 {
        match self {
            ErrorState::Ok => 0,
            ErrorState::Timeout | ErrorState::LinkFault(_) => -4,
            ErrorState::Closed => -1,
        }
    }
}
