//! Host-side copies of per-slot configuration and their persistence.
//!
//! Setters write through to the controller and update the copy; getters read
//! the controller and refresh it. Values live in controller RAM until
//! `commit` stores the group in EEPROM, so an uncommitted value is lost on
//! `restart_board`.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceError, Result, Session, SlotId};
use crate::serial::frame::{Frame, MessageId, PayloadReader, PayloadWriter};
use crate::serial::queue::Request;

pub const TITLE_WIDTH: usize = 16;
pub const MAX_TITLE_LEN: usize = 15;
pub const MAX_DIM: u8 = 100;

/// Reported for a clockwise limit that is not set
pub const CW_LIMIT_ABSENT: i32 = i32::MAX;
/// Reported for a counter-clockwise limit that is not set
pub const CCW_LIMIT_ABSENT: i32 = i32::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SoftLimits {
    pub cw: Option<i32>,
    pub ccw: Option<i32>,
}

impl SoftLimits {
    /// Wire values, absent limits as their sentinel
    pub fn raw(&self) -> (i32, i32) {
        (self.cw.unwrap_or(CW_LIMIT_ABSENT), self.ccw.unwrap_or(CCW_LIMIT_ABSENT))
    }

    pub fn from_raw(cw: i32, ccw: i32) -> Self {
        Self {
            cw: (cw != CW_LIMIT_ABSENT).then_some(cw),
            ccw: (ccw != CCW_LIMIT_ABSENT).then_some(ccw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SoftLimitMode {
    SetCcwFromCurrent = 1,
    SetCwFromCurrent = 2,
    ClearBoth = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HomeDirection {
    Clockwise = 0,
    CounterClockwise = 1,
}

impl TryFrom<u8> for HomeDirection {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(HomeDirection::Clockwise),
            1 => Ok(HomeDirection::CounterClockwise),
            other => Err(DeviceError::OutOfRange(format!("home direction {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JogDirection {
    CounterClockwise = 0,
    Clockwise = 1,
}

impl TryFrom<u8> for JogDirection {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(JogDirection::CounterClockwise),
            1 => Ok(JogDirection::Clockwise),
            other => Err(DeviceError::OutOfRange(format!("jog direction {}", other))),
        }
    }
}

/// Parameter group stored by `commit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistKind {
    SoftLimits,
    Home,
    JogParams,
}

impl PersistKind {
    /// Message id that names the group in the EEPROM store command
    pub fn group_id(self) -> u16 {
        match self {
            PersistKind::SoftLimits => MessageId::MOT_SET_SOFTLIMITS,
            PersistKind::Home => MessageId::MOT_SET_HOMEPARAMS,
            PersistKind::JogParams => MessageId::MOT_SET_JOGPARAMS,
        }
    }

    pub fn from_group_id(id: u16) -> Option<Self> {
        match id {
            MessageId::MOT_SET_SOFTLIMITS => Some(PersistKind::SoftLimits),
            MessageId::MOT_SET_HOMEPARAMS => Some(PersistKind::Home),
            MessageId::MOT_SET_JOGPARAMS => Some(PersistKind::JogParams),
            _ => None,
        }
    }
}

/// Last known configuration of one slot, `None` until read or written
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotParameters {
    pub jog_step: Option<u32>,
    pub soft_limits: Option<SoftLimits>,
    pub home_direction: Option<HomeDirection>,
    pub title: Option<String>,
}

#[derive(Debug, Default)]
pub struct ParameterStore {
    slots: [SlotParameters; 3],
    dirty: HashSet<(SlotId, PersistKind)>,
    system_dim: Option<u8>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, slot: SlotId) -> &SlotParameters {
        &self.slots[slot.index()]
    }

    fn slot_mut(&mut self, slot: SlotId) -> &mut SlotParameters {
        &mut self.slots[slot.index()]
    }

    pub fn mark_dirty(&mut self, slot: SlotId, kind: PersistKind) {
        self.dirty.insert((slot, kind));
    }

    pub fn is_dirty(&self, slot: SlotId, kind: PersistKind) -> bool {
        self.dirty.contains(&(slot, kind))
    }

    pub fn clear_dirty(&mut self, slot: SlotId, kind: PersistKind) {
        self.dirty.remove(&(slot, kind));
    }

    pub fn system_dim(&self) -> Option<u8> {
        self.system_dim
    }

    /// Forget one slot, e.g. after its configuration was erased
    pub fn reset_slot(&mut self, slot: SlotId) {
        *self.slot_mut(slot) = SlotParameters::default();
        self.dirty.retain(|(s, _)| *s != slot);
    }

    /// Forget everything, the controller reloaded its stored values
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Session {
    pub async fn set_jog_params(&self, slot: u8, step_size: u32) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        if step_size == 0 {
            return Err(DeviceError::OutOfRange("jog step size must be positive".to_string()));
        }
        let _guard = self.slots.try_claim(id)?;
        let payload = PayloadWriter::for_slot(slot).put_u32(step_size).finish();
        self.command(Request::acked("set_jog_params", Frame::long(MessageId::MOT_SET_JOGPARAMS, payload)))
            .await?;

        let mut params = self.params.lock().await;
        params.slot_mut(id).jog_step = Some(step_size);
        params.mark_dirty(id, PersistKind::JogParams);
        Ok(())
    }

    pub async fn get_jog_params(&self, slot: u8) -> Result<u32> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        let reply = self
            .query_slot("get_jog_params", id, MessageId::MOT_REQ_JOGPARAMS, MessageId::MOT_GET_JOGPARAMS)
            .await?;
        let step = PayloadReader::after_slot(reply.payload())?.u32()?;
        self.params.lock().await.slot_mut(id).jog_step = Some(step);
        Ok(step)
    }

    /// Set one or both soft limits relative to the current encoder position
    pub async fn set_soft_limit(&self, slot: u8, mode: SoftLimitMode) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        let frame = Frame::short(MessageId::MOT_SET_SOFTLIMITS, slot, mode as u8);
        self.command(Request::acked("set_soft_limit", frame)).await?;

        let mut params = self.params.lock().await;
        // Limits taken from the position are only known after the next read
        params.slot_mut(id).soft_limits = match mode {
            SoftLimitMode::ClearBoth => Some(SoftLimits::default()),
            _ => None,
        };
        params.mark_dirty(id, PersistKind::SoftLimits);
        Ok(())
    }

    pub async fn set_soft_limit_values(&self, slot: u8, limits: SoftLimits) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        if let (Some(cw), Some(ccw)) = (limits.cw, limits.ccw) {
            if cw <= ccw {
                return Err(DeviceError::OutOfRange(format!(
                    "clockwise limit {} must be above counter-clockwise limit {}",
                    cw, ccw
                )));
            }
        }
        let _guard = self.slots.try_claim(id)?;
        let (cw, ccw) = limits.raw();
        let payload = PayloadWriter::for_slot(slot).put_i32(cw).put_i32(ccw).finish();
        self.command(Request::acked(
            "set_soft_limit_values",
            Frame::long(MessageId::MOT_SET_SOFTLIMITVALUES, payload),
        ))
        .await?;

        let mut params = self.params.lock().await;
        params.slot_mut(id).soft_limits = Some(limits);
        params.mark_dirty(id, PersistKind::SoftLimits);
        Ok(())
    }

    pub async fn get_soft_limits(&self, slot: u8) -> Result<SoftLimits> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        let reply = self
            .query_slot("get_soft_limits", id, MessageId::MOT_REQ_SOFTLIMITS, MessageId::MOT_GET_SOFTLIMITS)
            .await?;
        let mut reader = PayloadReader::after_slot(reply.payload())?;
        let cw_set = reader.u8()? != 0;
        let cw = reader.i32()?;
        let ccw_set = reader.u8()? != 0;
        let ccw = reader.i32()?;
        let limits = SoftLimits {
            cw: cw_set.then_some(cw),
            ccw: ccw_set.then_some(ccw),
        };
        self.params.lock().await.slot_mut(id).soft_limits = Some(limits);
        Ok(limits)
    }

    pub async fn set_home_info(&self, slot: u8, direction: HomeDirection) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        let frame = Frame::short(MessageId::MOT_SET_HOMEPARAMS, slot, direction as u8);
        self.command(Request::acked("set_home_info", frame)).await?;

        let mut params = self.params.lock().await;
        params.slot_mut(id).home_direction = Some(direction);
        params.mark_dirty(id, PersistKind::Home);
        Ok(())
    }

    pub async fn get_home_info(&self, slot: u8) -> Result<HomeDirection> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        let reply = self
            .query_slot("get_home_info", id, MessageId::MOT_REQ_HOMEPARAMS, MessageId::MOT_GET_HOMEPARAMS)
            .await?;
        let direction = HomeDirection::try_from(reply.params().1)?;
        self.params.lock().await.slot_mut(id).home_direction = Some(direction);
        Ok(direction)
    }

    pub async fn set_slot_title(&self, slot: u8, title: &str) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        if title.is_empty() || title.len() > MAX_TITLE_LEN {
            return Err(DeviceError::OutOfRange(format!(
                "slot title must be 1 to {} bytes, got {}",
                MAX_TITLE_LEN,
                title.len()
            )));
        }
        let _guard = self.slots.try_claim(id)?;
        let payload = PayloadWriter::for_slot(slot).put_fixed_str(title, TITLE_WIDTH).finish();
        self.command(Request::acked("set_slot_title", Frame::long(MessageId::MOD_SET_SLOTTITLE, payload)))
            .await?;
        self.params.lock().await.slot_mut(id).title = Some(title.to_string());
        Ok(())
    }

    pub async fn get_slot_title(&self, slot: u8) -> Result<String> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        let reply = self
            .query_slot("get_slot_title", id, MessageId::MOD_REQ_SLOTTITLE, MessageId::MOD_GET_SLOTTITLE)
            .await?;
        let title = PayloadReader::after_slot(reply.payload())?.fixed_str(TITLE_WIDTH)?;
        self.params.lock().await.slot_mut(id).title = Some(title.clone());
        Ok(title)
    }

    /// Front panel LED brightness, 0 to 100
    pub async fn set_system_dim(&self, dim: u8) -> Result<()> {
        if dim > MAX_DIM {
            return Err(DeviceError::OutOfRange(format!("dim level {} above {}", dim, MAX_DIM)));
        }
        self.command(Request::acked("set_system_dim", Frame::short(MessageId::MOD_SET_SYSTEMDIM, dim, 0)))
            .await?;
        self.params.lock().await.system_dim = Some(dim);
        Ok(())
    }

    pub async fn get_system_dim(&self) -> Result<u8> {
        let request = Request::new(
            "get_system_dim",
            Frame::short(MessageId::MOD_REQ_SYSTEMDIM, 0, 0),
            MessageId::MOD_GET_SYSTEMDIM,
        );
        let dim = self.command(request).await?.params().0;
        self.params.lock().await.system_dim = Some(dim);
        Ok(dim)
    }

    /// Store the current values of one group in EEPROM.
    ///
    /// Values are not re-sent; whatever the controller holds is stored.
    pub async fn commit(&self, slot: u8, kind: PersistKind) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        let payload = PayloadWriter::for_slot(slot).put_u16(kind.group_id()).finish();
        self.command(Request::acked("commit", Frame::long(MessageId::MOT_SET_EEPROMPARAMS, payload)))
            .await?;
        self.params.lock().await.clear_dirty(id, kind);
        log::debug!("Committed {:?} of slot {}", kind, id);
        Ok(())
    }

    /// Cached parameters of a slot, no device I/O
    pub async fn parameters(&self, slot: u8) -> Result<SlotParameters> {
        let id = SlotId::try_from(slot)?;
        Ok(self.params.lock().await.slot(id).clone())
    }

    /// Whether a group was changed since its last commit
    pub async fn is_dirty(&self, slot: u8, kind: PersistKind) -> Result<bool> {
        let id = SlotId::try_from(slot)?;
        Ok(self.params.lock().await.is_dirty(id, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_limit_sentinels() {
        let limits = SoftLimits::from_raw(CW_LIMIT_ABSENT, -500);
        assert_eq!(limits, SoftLimits { cw: None, ccw: Some(-500) });
        assert_eq!(limits.raw(), (i32::MAX, -500));
        assert_eq!(SoftLimits::default().raw(), (2147483647, -2147483648));
    }

    #[test]
    fn test_persist_group_ids() {
        for kind in [PersistKind::SoftLimits, PersistKind::Home, PersistKind::JogParams] {
            assert_eq!(PersistKind::from_group_id(kind.group_id()), Some(kind));
        }
        assert_eq!(PersistKind::from_group_id(MessageId::MOT_MOVE_HOME), None);
    }

    #[test]
    fn test_dirty_tracking() {
        let mut store = ParameterStore::new();
        let slot = SlotId::try_from(5).unwrap();
        store.mark_dirty(slot, PersistKind::Home);
        assert!(store.is_dirty(slot, PersistKind::Home));
        assert!(!store.is_dirty(slot, PersistKind::JogParams));
        store.reset_slot(slot);
        assert!(!store.is_dirty(slot, PersistKind::Home));
    }
}
