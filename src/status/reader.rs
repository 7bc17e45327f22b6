//! Read-only status queries.
//!
//! None of these take the slot busy guard or touch the logical motion state,
//! so they can be polled while a slot is moving.
use chrono::Utc;

use crate::device::{DeviceError, Result, Session, SlotId};
use crate::serial::frame::{Frame, MessageId, PayloadReader};
use crate::serial::queue::Request;
use crate::stage::StageParams;
use super::types::*;

pub const DEVICE_TYPE_WIDTH: usize = 16;
pub const MODEL_WIDTH: usize = 8;

impl Session {
    pub(crate) async fn read_mot_status(&self, id: SlotId) -> Result<MotorStatus> {
        let reply = self
            .query_slot("mot_status", id, MessageId::MOT_REQ_STATUSUPDATE, MessageId::MOT_GET_STATUSUPDATE)
            .await?;
        let mut reader = PayloadReader::after_slot(reply.payload())?;
        let encoder_count = reader.i32()?;
        let bits = StatusBits::from_bits_retain(reader.u32()?);
        Ok(MotorStatus { encoder_count, bits })
    }

    /// Encoder count and status word of a slot
    pub async fn mot_status(&self, slot: u8) -> Result<MotorStatus> {
        let id = SlotId::try_from(slot)?;
        self.read_mot_status(id).await
    }

    pub async fn get_enable_state(&self, slot: u8) -> Result<bool> {
        let id = SlotId::try_from(slot)?;
        let reply = self
            .query_slot(
                "get_enable_state",
                id,
                MessageId::MOD_REQ_CHANENABLESTATE,
                MessageId::MOD_GET_CHANENABLESTATE,
            )
            .await?;
        Ok(reply.params().1 == 0x01)
    }

    pub async fn pnp_status(&self, slot: u8) -> Result<PnpStatus> {
        let id = SlotId::try_from(slot)?;
        let reply = self
            .query_slot("pnp_status", id, MessageId::MOD_REQ_PNPSTATUS, MessageId::MOD_GET_PNPSTATUS)
            .await?;
        let raw = PayloadReader::after_slot(reply.payload())?.u32()?;
        let status = PnpStatus::from_bits_retain(raw);
        if !status.is_empty() {
            log::debug!("Slot {} plug-and-play status {:?}", id, status);
        }
        Ok(status)
    }

    pub async fn board_status(&self) -> Result<BoardStatus> {
        let request = Request::new(
            "board_status",
            Frame::short(MessageId::MOD_REQ_BOARDSTATUS, 0, 0),
            MessageId::MOD_GET_BOARDSTATUS,
        );
        let reply = self.command(request).await?;
        let mut reader = PayloadReader::new(reply.payload());
        Ok(BoardStatus {
            board_temperature: reader.f64()?,
            cpu_temperature: reader.f64()?,
            high_voltage: reader.f64()?,
            slot_error_bits: reader.u8()?,
            captured_at: Utc::now(),
        })
    }

    /// Board status, failing with `DeviceFault` if any slot reports an error
    pub async fn check_board_health(&self) -> Result<BoardStatus> {
        let status = self.board_status().await?;
        if status.has_slot_errors() {
            let failing: Vec<String> = SlotId::ALL
                .iter()
                .filter(|id| status.slot_error_bits & (1 << id.index()) != 0)
                .map(|id| id.to_string())
                .collect();
            return Err(DeviceError::DeviceFault(format!(
                "error reported on slot(s) {}",
                failing.join(", ")
            )));
        }
        Ok(status)
    }

    pub async fn hardware_info(&self) -> Result<HardwareInfo> {
        let request = Request::new(
            "hardware_info",
            Frame::short(MessageId::HW_REQ_INFO, 0, 0),
            MessageId::HW_GET_INFO,
        );
        let reply = self.command(request).await?;
        let mut reader = PayloadReader::new(reply.payload());
        let minor = reader.u8()?;
        let interim = reader.u8()?;
        let major = reader.u8()?;
        let cpid_major = reader.u8()?;
        let cpid_minor = reader.u8()?;
        let model = reader.fixed_str(MODEL_WIDTH)?;
        Ok(HardwareInfo {
            firmware: FirmwareVersion { major, interim, minor },
            cpid: CpidVersion { major: cpid_major, minor: cpid_minor },
            model,
        })
    }

    /// Name of the stage in a slot, `None` when the slot is empty
    pub async fn slot_device_type(&self, slot: u8) -> Result<Option<String>> {
        let id = SlotId::try_from(slot)?;
        let reply = self
            .query_slot("slot_device_type", id, MessageId::MOD_REQ_DEVICETYPE, MessageId::MOD_GET_DEVICETYPE)
            .await?;
        let name = PayloadReader::after_slot(reply.payload())?.fixed_str(DEVICE_TYPE_WIDTH)?;
        Ok((!name.is_empty()).then_some(name))
    }

    /// Read the stage parameters and cache them for unit conversion.
    ///
    /// The first successful read is kept for the rest of the session.
    pub async fn stage_params(&self, slot: u8) -> Result<StageParams> {
        let id = SlotId::try_from(slot)?;
        if let Some(cached) = self.converter.read().await.params(id) {
            return Ok(cached);
        }

        let reply = self
            .query_slot("stage_params", id, MessageId::MOT_REQ_STAGEPARAMS, MessageId::MOT_GET_STAGEPARAMS)
            .await?;
        let mut reader = PayloadReader::after_slot(reply.payload())?;
        let params = StageParams {
            counts_per_unit: reader.u32()?,
            nm_per_count: reader.f32()?,
            min_position: reader.u32()?,
            max_position: reader.u32()?,
            max_speed: reader.f64()?,
            max_acceleration: reader.f64()?,
        };
        Ok(self.converter.write().await.store(id, params))
    }
}
