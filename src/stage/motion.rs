use std::time::Duration;

use crate::device::{DeviceError, Result, Session, SlotId};
use crate::serial::frame::{Frame, MessageId, PayloadWriter};
use crate::serial::queue::Request;
use crate::status::StatusBits;
use super::params::JogDirection;
use super::state::{MotionState, Slot, Transition};

pub const MAX_VELOCITY_PERCENT: u8 = 100;

impl Session {
    pub async fn set_enable(&self, slot: u8, enable: bool) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        let input = if enable { Transition::Enable } else { Transition::Disable };
        let next = self.slots.check(id, input).await?;

        let frame = Frame::short(MessageId::MOD_SET_CHANENABLESTATE, slot, if enable { 0x01 } else { 0x02 });
        self.command(Request::acked("set_enable", frame)).await?;
        self.slots.set_state(id, next).await;
        log::debug!("Slot {} {}", id, if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    pub async fn home(&self, slot: u8) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let frame = Frame::short(MessageId::MOT_MOVE_HOME, slot, 0);
        self.start_motion(id, Transition::Home, Request::acked("home", frame))
            .await
    }

    pub async fn move_absolute(&self, slot: u8, target: i32) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let payload = PayloadWriter::for_slot(slot).put_i32(target).finish();
        let frame = Frame::long(MessageId::MOT_MOVE_ABSOLUTE, payload);
        self.start_motion(id, Transition::MoveAbsolute, Request::acked("move_absolute", frame))
            .await
    }

    /// Start a continuous jog in `direction`. It runs until `move_stop` or a
    /// limit; the controller's jog parameters set the step rate.
    pub async fn move_jog(&self, slot: u8, direction: JogDirection) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let frame = Frame::short(MessageId::MOT_MOVE_JOG, slot, direction as u8);
        self.start_motion(id, Transition::Jog, Request::acked("move_jog", frame))
            .await
    }

    /// Continuous move at `percent` of the stage's maximum speed. 0 stops.
    pub async fn set_velocity(&self, slot: u8, direction: JogDirection, percent: u8) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        if percent > MAX_VELOCITY_PERCENT {
            return Err(DeviceError::OutOfRange(format!("velocity {}% above 100%", percent)));
        }
        if percent == 0 {
            return self.move_stop(slot).await;
        }
        let payload = PayloadWriter::for_slot(slot)
            .put_u8(direction as u8)
            .put_u8(percent)
            .finish();
        let frame = Frame::long(MessageId::MOT_MOVE_VELOCITY, payload);
        self.start_motion(id, Transition::Jog, Request::acked("set_velocity", frame))
            .await
    }

    /// Stop whatever the slot is doing. Nothing is sent for an idle slot.
    pub async fn move_stop(&self, slot: u8) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        let current = self.slots.state(id).await;
        if matches!(current, MotionState::Idle | MotionState::Disabled) {
            return Ok(());
        }

        self.slots.mark_stopping(id).await;
        let frame = Frame::short(MessageId::MOT_MOVE_STOP, slot, 0);
        match self.command(Request::acked("move_stop", frame)).await {
            Ok(_) => {
                self.slots.begin(id, Transition::Stop).await?;
                Ok(())
            }
            Err(e) if e.is_transport() => {
                self.slots.clear_stopping(id).await;
                self.slots.set_state(id, MotionState::Unknown).await;
                Err(e)
            }
            Err(e) => {
                self.slots.clear_stopping(id).await;
                Err(e)
            }
        }
    }

    pub async fn set_encoder_counter(&self, slot: u8, count: i32) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        self.slots.check(id, Transition::SetEncoder).await?;

        let payload = PayloadWriter::for_slot(slot).put_i32(count).finish();
        self.command(Request::acked("set_encoder_counter", Frame::long(MessageId::MOT_SET_ENCCOUNTER, payload)))
            .await?;
        self.slots.update(id, |s| s.encoder_count = count).await;
        Ok(())
    }

    /// Flash the slot's LED
    pub async fn identify(&self, slot: u8) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        self.command(Request::acked("identify", Frame::short(MessageId::MOD_IDENTIFY, slot, 0)))
            .await?;
        Ok(())
    }

    /// Reset the slot's stored configuration to factory values
    pub async fn erase_configuration(&self, slot: u8) -> Result<()> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        if self.slots.state(id).await.is_busy() {
            return Err(DeviceError::SlotBusy(format!("slot {} is moving", id)));
        }
        self.command(Request::acked("erase_configuration", Frame::short(MessageId::MOD_ERASE_CONFIG, slot, 0)))
            .await?;
        self.params.lock().await.reset_slot(id);
        Ok(())
    }

    /// Reboot the controller. Slots come back disabled with their stored
    /// parameters; cached copies are dropped.
    pub async fn restart_board(&self) -> Result<()> {
        let mut guards = Vec::with_capacity(SlotId::ALL.len());
        for id in SlotId::ALL {
            guards.push(self.slots.try_claim(id)?);
            if self.slots.state(id).await.is_busy() {
                return Err(DeviceError::SlotBusy(format!("slot {} is moving", id)));
            }
        }

        self.command(Request::acked("restart_board", Frame::short(MessageId::HW_RESTART, 0, 0)))
            .await?;
        for id in SlotId::ALL {
            self.slots
                .update(id, |s| {
                    s.state = MotionState::Disabled;
                    s.stop_pending = None;
                })
                .await;
        }
        self.params.lock().await.reset();
        *self.efs_info.lock().await = None;
        log::info!("Controller {} restarted", self.serial_number());
        Ok(())
    }

    /// Current logical state, no device I/O
    pub async fn motion_state(&self, slot: u8) -> Result<MotionState> {
        let id = SlotId::try_from(slot)?;
        Ok(self.slots.state(id).await)
    }

    /// Cached slot view, no device I/O
    pub async fn slot(&self, slot: u8) -> Result<Slot> {
        let id = SlotId::try_from(slot)?;
        Ok(self.slots.snapshot(id).await)
    }

    /// Poll the device and bring the logical state in line with it
    pub async fn refresh_state(&self, slot: u8) -> Result<MotionState> {
        let id = SlotId::try_from(slot)?;
        let _guard = self.slots.try_claim(id)?;
        let status = self.read_mot_status(id).await?;

        let mut settled = MotionState::Unknown;
        self.slots
            .update(id, |s| {
                s.encoder_count = status.encoder_count;
                s.status = status.bits;
                s.state = reconcile(s.state, status.bits);
                settled = s.state;
            })
            .await;
        log::debug!("Slot {} refreshed to {:?}", id, settled);
        Ok(settled)
    }

    /// Wait until the slot is no longer homing or moving.
    ///
    /// Jogging is not waited for, a continuous jog only ends on stop or a limit.
    pub async fn wait_for_motion(&self, slot: u8, timeout: Duration) -> Result<MotionState> {
        let id = SlotId::try_from(slot)?;
        let mut rx = self.slots.subscribe(id);
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| !matches!(state, MotionState::Homing | MotionState::Moving)),
        )
        .await
        .map_err(|_| crate::serial::SerialError::Timeout)?;

        match settled {
            Ok(state) => Ok(*state),
            Err(_) => Err(DeviceError::Transport(crate::serial::SerialError::QueueClosed)),
        }
    }

    /// Set the state before sending; roll back if the controller refuses,
    /// mark `Unknown` if the link fails.
    async fn start_motion(&self, id: SlotId, input: Transition, request: Request) -> Result<()> {
        let _guard = self.slots.try_claim(id)?;
        let previous = self.slots.begin(id, input).await?;

        match self.command(request).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_transport() => {
                log::warn!("Link failed during {:?} on slot {}, state unknown", input, id);
                self.slots.set_state(id, MotionState::Unknown).await;
                Err(e)
            }
            Err(e) => {
                self.slots.set_state(id, previous).await;
                Err(e)
            }
        }
    }
}

/// Logical state implied by a status word, given the state we believed
fn reconcile(believed: MotionState, bits: StatusBits) -> MotionState {
    if !bits.contains(StatusBits::ENABLED) {
        return MotionState::Disabled;
    }
    let homing = bits.contains(StatusBits::HOMING);
    let moving = bits.is_moving();
    let jogging = bits.is_jogging();

    match believed {
        MotionState::Homing if !homing => MotionState::Idle,
        MotionState::Moving if !moving => MotionState::Idle,
        MotionState::Jogging if !jogging || bits.on_limit() => MotionState::Idle,
        MotionState::Disabled | MotionState::Unknown => {
            if homing {
                MotionState::Homing
            } else if jogging {
                MotionState::Jogging
            } else if moving {
                MotionState::Moving
            } else {
                MotionState::Idle
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_clears_finished_motion() {
        let enabled = StatusBits::ENABLED | StatusBits::MOTOR_CONNECTED;
        assert_eq!(reconcile(MotionState::Moving, enabled), MotionState::Idle);
        assert_eq!(reconcile(MotionState::Moving, enabled | StatusBits::MOVING_CW), MotionState::Moving);
        assert_eq!(
            reconcile(MotionState::Jogging, enabled | StatusBits::JOGGING_CW | StatusBits::CW_SOFT_LIMIT),
            MotionState::Idle
        );
        assert_eq!(reconcile(MotionState::Homing, enabled | StatusBits::HOMING), MotionState::Homing);
    }

    #[test]
    fn test_reconcile_resolves_unknown() {
        assert_eq!(reconcile(MotionState::Unknown, StatusBits::empty()), MotionState::Disabled);
        assert_eq!(reconcile(MotionState::Unknown, StatusBits::ENABLED), MotionState::Idle);
        assert_eq!(
            reconcile(MotionState::Unknown, StatusBits::ENABLED | StatusBits::MOVING_CCW),
            MotionState::Moving
        );
        assert_eq!(reconcile(MotionState::Error, StatusBits::ENABLED), MotionState::Error);
    }
}
