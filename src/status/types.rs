use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Motor status word reported by a status update
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StatusBits: u32 {
        const CW_HARD_LIMIT = 0x0000_0001;
        const CCW_HARD_LIMIT = 0x0000_0002;
        const CW_SOFT_LIMIT = 0x0000_0004;
        const CCW_SOFT_LIMIT = 0x0000_0008;
        const MOVING_CW = 0x0000_0010;
        const MOVING_CCW = 0x0000_0020;
        const JOGGING_CW = 0x0000_0040;
        const JOGGING_CCW = 0x0000_0080;
        const MOTOR_CONNECTED = 0x0000_0100;
        const HOMING = 0x0000_0200;
        const HOMED = 0x0000_0400;
        const ENABLED = 0x8000_0000;
    }
}

impl StatusBits {
    pub const ANY_LIMIT: StatusBits = StatusBits::CW_HARD_LIMIT
        .union(StatusBits::CCW_HARD_LIMIT)
        .union(StatusBits::CW_SOFT_LIMIT)
        .union(StatusBits::CCW_SOFT_LIMIT);

    pub fn is_moving(self) -> bool {
        self.intersects(StatusBits::MOVING_CW | StatusBits::MOVING_CCW)
    }

    pub fn is_jogging(self) -> bool {
        self.intersects(StatusBits::JOGGING_CW | StatusBits::JOGGING_CCW)
    }

    pub fn on_limit(self) -> bool {
        self.intersects(Self::ANY_LIMIT)
    }
}

bitflags! {
    /// Plug-and-play health of the stage in a slot. Empty means normal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PnpStatus: u32 {
        const NO_DEVICE = 0x0001;
        const ONE_WIRE_ERROR = 0x0002;
        const UNKNOWN_ONE_WIRE_VERSION = 0x0004;
        const ONE_WIRE_CORRUPTED = 0x0008;
        const SERIAL_NUMBER_MISMATCH = 0x0010;
        const SIGNATURE_NOT_ALLOWED = 0x0020;
        const CONFIGURATION_ERROR = 0x0040;
        const CONFIGURATION_SET_MISSING = 0x0080;
        const CONFIGURATION_STRUCT_MISSING = 0x0100;
    }
}

/// Encoder count and status word of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorStatus {
    pub encoder_count: i32,
    pub bits: StatusBits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardStatus {
    pub board_temperature: f64,
    pub cpu_temperature: f64,
    pub high_voltage: f64,
    /// One bit per slot, bit 0 is slot 4
    pub slot_error_bits: u8,
    pub captured_at: DateTime<Utc>,
}

impl BoardStatus {
    pub fn has_slot_errors(&self) -> bool {
        self.slot_error_bits != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub interim: u8,
    pub minor: u8,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.interim, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpidVersion {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub firmware: FirmwareVersion,
    pub cpid: CpidVersion,
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits_from_wire() {
        let bits = StatusBits::from_bits_retain(0x8000_0504);
        assert!(bits.contains(StatusBits::ENABLED | StatusBits::HOMED | StatusBits::MOTOR_CONNECTED));
        assert!(bits.on_limit());
        assert!(!bits.is_moving());
        assert!(StatusBits::from_bits_retain(0x40).is_jogging());
    }

    #[test]
    fn test_pnp_normal_is_empty() {
        assert!(PnpStatus::from_bits_truncate(0).is_empty());
        assert_eq!(PnpStatus::from_bits_truncate(0x11), PnpStatus::NO_DEVICE | PnpStatus::SERIAL_NUMBER_MISMATCH);
    }
}
