//! In-memory model of a three-slot controller.
//!
//! Speaks the same frames as the firmware. Moves complete instantly and the
//! end-of-move event follows the acknowledgement, unless moves are held, in
//! which case they run until stopped. Jogs are continuous and
//! advance one jog step per frame the controller handles, so a jog only
//! makes progress while the host keeps talking to it.
use std::collections::BTreeMap;
use std::time::Duration;

use crate::device::{DeviceErrorCode, SlotId};
use crate::efs::FileAttributes;
use crate::serial::frame::{Frame, MessageId, PayloadReader, PayloadWriter};
use crate::serial::SerialError;
use crate::stage::params::{CCW_LIMIT_ABSENT, CW_LIMIT_ABSENT, MAX_DIM, TITLE_WIDTH};
use crate::stage::{HomeDirection, JogDirection, PersistKind, SoftLimits, StageParams};
use crate::status::reader::{DEVICE_TYPE_WIDTH, MODEL_WIDTH};
use crate::status::{PnpStatus, StatusBits};

pub const DEFAULT_JOG_STEP: u32 = 100;
pub const EFS_PAGE_SIZE: u16 = 256;
pub const EFS_PAGES: u16 = 64;
pub const EFS_MAX_FILES: u16 = 8;

type Reply = std::result::Result<Vec<Frame>, u16>;

#[derive(Debug, Clone, PartialEq)]
struct SlotConfig {
    jog_step: u32,
    soft_limits: SoftLimits,
    home_direction: HomeDirection,
    title: String,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            jog_step: DEFAULT_JOG_STEP,
            soft_limits: SoftLimits::default(),
            home_direction: HomeDirection::Clockwise,
            title: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct SimSlot {
    enabled: bool,
    encoder: i32,
    homed: bool,
    jog: Option<JogDirection>,
    /// Home or move that was acked but has not finished
    held: Option<HeldMove>,
    latched_limits: StatusBits,
    volatile: SlotConfig,
    stored: SlotConfig,
    device_type: Option<String>,
    stage: Option<StageParams>,
    fault_next_motion: bool,
}

impl SimSlot {
    fn new() -> Self {
        Self {
            enabled: false,
            encoder: 0,
            homed: false,
            jog: None,
            held: None,
            latched_limits: StatusBits::empty(),
            volatile: SlotConfig::default(),
            stored: SlotConfig::default(),
            device_type: Some("LNR50".to_string()),
            stage: Some(StageParams {
                counts_per_unit: 2000,
                nm_per_count: 100.0,
                min_position: 0,
                max_position: 500_000,
                max_speed: 5.0,
                max_acceleration: 10.0,
            }),
            fault_next_motion: false,
        }
    }

    fn status_bits(&self) -> StatusBits {
        let mut bits = self.latched_limits;
        if self.enabled {
            bits |= StatusBits::ENABLED;
        }
        if self.device_type.is_some() {
            bits |= StatusBits::MOTOR_CONNECTED;
        }
        if self.homed {
            bits |= StatusBits::HOMED;
        }
        match self.held {
            Some(HeldMove::Home) => bits |= StatusBits::HOMING,
            Some(HeldMove::Absolute(target)) if target >= self.encoder => bits |= StatusBits::MOVING_CW,
            Some(HeldMove::Absolute(_)) => bits |= StatusBits::MOVING_CCW,
            None => {}
        }
        match self.jog {
            Some(JogDirection::Clockwise) => bits |= StatusBits::JOGGING_CW,
            Some(JogDirection::CounterClockwise) => bits |= StatusBits::JOGGING_CCW,
            None => {}
        }
        bits
    }

    fn travel(&self) -> (i32, i32) {
        match &self.stage {
            Some(stage) => (stage.min_position as i32, stage.max_position as i32),
            None => (i32::MIN, i32::MAX),
        }
    }

    /// Clamp `target` to the soft limits and travel range.
    /// Returns the reachable position and the limit bit that stopped it.
    fn clamp(&self, target: i32) -> (i32, Option<StatusBits>) {
        let (min, max) = self.travel();
        let limits = self.volatile.soft_limits;
        if let Some(cw) = limits.cw {
            if target >= cw {
                return (cw, Some(StatusBits::CW_SOFT_LIMIT));
            }
        }
        if let Some(ccw) = limits.ccw {
            if target <= ccw {
                return (ccw, Some(StatusBits::CCW_SOFT_LIMIT));
            }
        }
        if target >= max {
            return (max, Some(StatusBits::CW_HARD_LIMIT));
        }
        if target <= min {
            return (min, Some(StatusBits::CCW_HARD_LIMIT));
        }
        (target, None)
    }
}

#[derive(Debug, Clone, Copy)]
enum HeldMove {
    Home,
    Absolute(i32),
}

#[derive(Debug, Clone)]
struct SimFile {
    attributes: FileAttributes,
    owned: bool,
    pages: u16,
    data: Vec<u8>,
}

/// Simulated controller, shared between a test and its `MockTransport`
#[derive(Debug)]
pub struct SimulatedController {
    serial_number: String,
    /// major, interim, minor
    firmware: (u8, u8, u8),
    cpid: (u8, u8),
    slots: [SimSlot; 3],
    dim: u8,
    slot_error_bits: u8,
    files: BTreeMap<u8, SimFile>,
    silent: bool,
    hold_moves: bool,
    reply_delay: Option<Duration>,
    link_down: bool,
    refuse_connections: bool,
    open_links: usize,
    received: Vec<u16>,
}

impl SimulatedController {
    pub fn new(serial_number: &str) -> Self {
        Self {
            serial_number: serial_number.to_string(),
            firmware: (2, 1, 1),
            cpid: (1, 0),
            slots: [SimSlot::new(), SimSlot::new(), SimSlot::new()],
            dim: 50,
            slot_error_bits: 0,
            files: BTreeMap::new(),
            silent: false,
            hold_moves: false,
            reply_delay: None,
            link_down: false,
            refuse_connections: false,
            open_links: 0,
            received: Vec::new(),
        }
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Swallow requests without answering, so every request times out
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Ack homes and absolute moves without finishing them. The slot keeps
    /// reporting motion until it is stopped.
    pub fn set_hold_moves(&mut self, hold: bool) {
        self.hold_moves = hold;
    }

    /// Deliver the replies to the next frame only after `delay`
    pub fn delay_next_reply(&mut self, delay: Duration) {
        self.reply_delay = Some(delay);
    }

    pub(crate) fn take_reply_delay(&mut self) -> Option<Duration> {
        self.reply_delay.take()
    }

    /// Make transport reads and writes fail with an I/O error
    pub fn set_link_down(&mut self, down: bool) {
        self.link_down = down;
    }

    pub fn is_link_down(&self) -> bool {
        self.link_down
    }

    pub fn set_refuse_connections(&mut self, refuse: bool) {
        self.refuse_connections = refuse;
    }

    pub fn refuses_connections(&self) -> bool {
        self.refuse_connections
    }

    pub(crate) fn link_opened(&mut self) {
        self.open_links += 1;
    }

    pub(crate) fn link_closed(&mut self) {
        self.open_links = self.open_links.saturating_sub(1);
    }

    /// Number of transports currently open to this controller
    pub fn open_links(&self) -> usize {
        self.open_links
    }

    /// Report a fault instead of completing the next home or move on `slot`
    pub fn fail_next_motion(&mut self, slot: SlotId) {
        self.slots[slot.index()].fault_next_motion = true;
    }

    /// Unplug the stage from `slot`
    pub fn remove_stage(&mut self, slot: SlotId) {
        let sim = &mut self.slots[slot.index()];
        sim.device_type = None;
        sim.stage = None;
    }

    pub fn set_stage_params(&mut self, slot: SlotId, params: StageParams) {
        self.slots[slot.index()].stage = Some(params);
    }

    pub fn set_slot_error_bits(&mut self, bits: u8) {
        self.slot_error_bits = bits;
    }

    pub fn encoder(&self, slot: SlotId) -> i32 {
        self.slots[slot.index()].encoder
    }

    pub fn is_enabled(&self, slot: SlotId) -> bool {
        self.slots[slot.index()].enabled
    }

    pub fn is_jogging(&self, slot: SlotId) -> bool {
        self.slots[slot.index()].jog.is_some()
    }

    pub fn is_moving(&self, slot: SlotId) -> bool {
        self.slots[slot.index()].held.is_some()
    }

    /// Add a file as if the firmware had created it
    pub fn add_firmware_file(&mut self, name: u8, attributes: FileAttributes, pages: u16) {
        self.files.insert(
            name,
            SimFile {
                attributes,
                owned: false,
                pages,
                data: vec![0; pages as usize * EFS_PAGE_SIZE as usize],
            },
        );
    }

    /// Ids of every frame received, in order
    pub fn received(&self) -> &[u16] {
        &self.received
    }

    pub fn count_received(&self, id: u16) -> usize {
        self.received.iter().filter(|&&r| r == id).count()
    }

    /// Handle one host frame and return what the controller sends back
    pub fn handle(&mut self, frame: &Frame) -> Vec<Frame> {
        self.received.push(frame.id);
        let events = self.tick();
        if self.silent {
            return Vec::new();
        }
        let mut out = match self.dispatch(frame) {
            Ok(replies) => replies,
            Err(code) => {
                let slot = frame.slot().filter(|_| MessageId::is_slot_addressed(frame.id));
                vec![error_frame(frame.id, code, slot)]
            }
        };
        out.extend(events);
        out
    }

    /// Advance every jog by one step
    fn tick(&mut self) -> Vec<Frame> {
        let mut events = Vec::new();
        for id in SlotId::ALL {
            let sim = &mut self.slots[id.index()];
            let Some(direction) = sim.jog else { continue };
            let step = sim.volatile.jog_step as i64;
            let target = match direction {
                JogDirection::Clockwise => sim.encoder as i64 + step,
                JogDirection::CounterClockwise => sim.encoder as i64 - step,
            };
            let target = target.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            let (position, limit) = sim.clamp(target);
            sim.encoder = position;
            if let Some(bit) = limit {
                sim.latched_limits |= bit;
                sim.jog = None;
                events.push(event(MessageId::MOT_MOVE_STOPPED, id.number()));
            }
        }
        events
    }

    fn slot_of(frame: &Frame) -> std::result::Result<SlotId, u16> {
        frame
            .slot()
            .and_then(|s| SlotId::try_from(s).ok())
            .ok_or(DeviceErrorCode::INVALID_SLOT)
    }

    fn dispatch(&mut self, frame: &Frame) -> Reply {
        match frame.id {
            MessageId::HW_REQ_INFO => Ok(vec![self.hardware_info()]),
            MessageId::HW_RESTART => Ok(vec![self.restart()]),
            MessageId::MOD_SET_SYSTEMDIM => {
                let dim = frame.params().0;
                if dim > MAX_DIM {
                    return Err(DeviceErrorCode::OUT_OF_RANGE);
                }
                self.dim = dim;
                Ok(vec![ack(0)])
            }
            MessageId::MOD_REQ_SYSTEMDIM => Ok(vec![reply_short(MessageId::MOD_GET_SYSTEMDIM, self.dim, 0)]),
            MessageId::MOD_REQ_BOARDSTATUS => Ok(vec![reply_long(
                MessageId::MOD_GET_BOARDSTATUS,
                PayloadWriter::new()
                    .put_f64(31.5)
                    .put_f64(42.0)
                    .put_f64(47.8)
                    .put_u8(self.slot_error_bits)
                    .finish(),
            )]),
            MessageId::EFS_REQ_HWINFO => Ok(vec![self.efs_hardware_info()]),
            MessageId::EFS_REQ_FILEINFO => Ok(vec![self.efs_file_info(frame.params().0)]),
            MessageId::EFS_SET_FILEINFO => self.efs_set_file_info(frame.payload()),
            MessageId::EFS_SET_FILEDATA => self.efs_write(frame.payload()),
            MessageId::EFS_REQ_FILEDATA => self.efs_read(frame.payload()),
            id if id >= 0x0200 => {
                let slot = Self::slot_of(frame)?;
                self.dispatch_slot(slot, frame)
            }
            _ => Err(DeviceErrorCode::OUT_OF_RANGE),
        }
    }

    fn dispatch_slot(&mut self, id: SlotId, frame: &Frame) -> Reply {
        let n = id.number();
        let hold = self.hold_moves;
        let sim = &mut self.slots[id.index()];

        match frame.id {
            MessageId::MOD_SET_CHANENABLESTATE => {
                sim.enabled = frame.params().1 == 0x01;
                if !sim.enabled {
                    sim.jog = None;
                    sim.held = None;
                }
                Ok(vec![ack(n)])
            }
            MessageId::MOD_REQ_CHANENABLESTATE => Ok(vec![reply_short(
                MessageId::MOD_GET_CHANENABLESTATE,
                n,
                if sim.enabled { 0x01 } else { 0x02 },
            )]),
            MessageId::MOD_IDENTIFY => Ok(vec![ack(n)]),
            MessageId::MOT_SET_ENCCOUNTER => {
                sim.encoder = PayloadReader::after_slot(frame.payload())
                    .and_then(|mut r| r.i32())
                    .map_err(malformed)?;
                Ok(vec![ack(n)])
            }
            MessageId::MOT_SET_JOGPARAMS => {
                let step = PayloadReader::after_slot(frame.payload())
                    .and_then(|mut r| r.u32())
                    .map_err(malformed)?;
                if step == 0 {
                    return Err(DeviceErrorCode::OUT_OF_RANGE);
                }
                sim.volatile.jog_step = step;
                Ok(vec![ack(n)])
            }
            MessageId::MOT_REQ_JOGPARAMS => Ok(vec![reply_long(
                MessageId::MOT_GET_JOGPARAMS,
                PayloadWriter::for_slot(n).put_u32(sim.volatile.jog_step).finish(),
            )]),
            MessageId::MOT_SET_SOFTLIMITS => {
                let limits = &mut sim.volatile.soft_limits;
                match frame.params().1 {
                    1 => limits.ccw = Some(sim.encoder),
                    2 => limits.cw = Some(sim.encoder),
                    3 => *limits = SoftLimits::default(),
                    _ => return Err(DeviceErrorCode::OUT_OF_RANGE),
                }
                sim.latched_limits.remove(StatusBits::CW_SOFT_LIMIT | StatusBits::CCW_SOFT_LIMIT);
                Ok(vec![ack(n)])
            }
            MessageId::MOT_SET_SOFTLIMITVALUES => {
                let mut reader = PayloadReader::after_slot(frame.payload()).map_err(malformed)?;
                let cw = reader.i32().map_err(malformed)?;
                let ccw = reader.i32().map_err(malformed)?;
                sim.volatile.soft_limits = SoftLimits::from_raw(cw, ccw);
                sim.latched_limits.remove(StatusBits::CW_SOFT_LIMIT | StatusBits::CCW_SOFT_LIMIT);
                Ok(vec![ack(n)])
            }
            MessageId::MOT_REQ_SOFTLIMITS => {
                let limits = sim.volatile.soft_limits;
                Ok(vec![reply_long(
                    MessageId::MOT_GET_SOFTLIMITS,
                    PayloadWriter::for_slot(n)
                        .put_u8(limits.cw.is_some() as u8)
                        .put_i32(limits.cw.unwrap_or(CW_LIMIT_ABSENT))
                        .put_u8(limits.ccw.is_some() as u8)
                        .put_i32(limits.ccw.unwrap_or(CCW_LIMIT_ABSENT))
                        .finish(),
                )])
            }
            MessageId::MOT_SET_HOMEPARAMS => {
                sim.volatile.home_direction =
                    HomeDirection::try_from(frame.params().1).map_err(|_| DeviceErrorCode::OUT_OF_RANGE)?;
                Ok(vec![ack(n)])
            }
            MessageId::MOT_REQ_HOMEPARAMS => Ok(vec![reply_short(
                MessageId::MOT_GET_HOMEPARAMS,
                n,
                sim.volatile.home_direction as u8,
            )]),
            MessageId::MOT_MOVE_HOME => {
                Self::check_can_move(sim)?;
                if std::mem::take(&mut sim.fault_next_motion) {
                    return Ok(vec![ack(n), event(MessageId::MOT_MOVE_FAULT, n)]);
                }
                sim.latched_limits = StatusBits::empty();
                if hold {
                    sim.held = Some(HeldMove::Home);
                    return Ok(vec![ack(n)]);
                }
                sim.encoder = 0;
                sim.homed = true;
                Ok(vec![ack(n), event(MessageId::MOT_MOVE_HOMED, n)])
            }
            MessageId::MOT_MOVE_ABSOLUTE => {
                let target = PayloadReader::after_slot(frame.payload())
                    .and_then(|mut r| r.i32())
                    .map_err(malformed)?;
                Self::check_can_move(sim)?;
                let (min, max) = sim.travel();
                if target < min || target > max {
                    return Err(DeviceErrorCode::OUT_OF_RANGE);
                }
                if std::mem::take(&mut sim.fault_next_motion) {
                    return Ok(vec![ack(n), event(MessageId::MOT_MOVE_FAULT, n)]);
                }
                sim.latched_limits = StatusBits::empty();
                if hold {
                    sim.held = Some(HeldMove::Absolute(target));
                    return Ok(vec![ack(n)]);
                }
                let limits = sim.volatile.soft_limits;
                let stop = match (limits.cw, limits.ccw) {
                    (Some(cw), _) if target > cw => Some((cw, StatusBits::CW_SOFT_LIMIT)),
                    (_, Some(ccw)) if target < ccw => Some((ccw, StatusBits::CCW_SOFT_LIMIT)),
                    _ => None,
                };
                match stop {
                    Some((position, bit)) => {
                        sim.encoder = position;
                        sim.latched_limits |= bit;
                        Ok(vec![ack(n), event(MessageId::MOT_MOVE_STOPPED, n)])
                    }
                    None => {
                        sim.encoder = target;
                        Ok(vec![ack(n), event(MessageId::MOT_MOVE_COMPLETED, n)])
                    }
                }
            }
            MessageId::MOT_MOVE_JOG => {
                let direction = JogDirection::try_from(frame.params().1).map_err(|_| DeviceErrorCode::OUT_OF_RANGE)?;
                Self::check_can_move(sim)?;
                sim.latched_limits = StatusBits::empty();
                sim.jog = Some(direction);
                Ok(vec![ack(n)])
            }
            MessageId::MOT_MOVE_VELOCITY => {
                let mut reader = PayloadReader::after_slot(frame.payload()).map_err(malformed)?;
                let direction = reader
                    .u8()
                    .ok()
                    .and_then(|d| JogDirection::try_from(d).ok())
                    .ok_or(DeviceErrorCode::OUT_OF_RANGE)?;
                let percent = reader.u8().map_err(malformed)?;
                if percent == 0 || percent > 100 {
                    return Err(DeviceErrorCode::OUT_OF_RANGE);
                }
                Self::check_can_move(sim)?;
                sim.latched_limits = StatusBits::empty();
                sim.jog = Some(direction);
                Ok(vec![ack(n)])
            }
            MessageId::MOT_MOVE_STOP => {
                sim.jog = None;
                sim.held = None;
                Ok(vec![ack(n), event(MessageId::MOT_MOVE_STOPPED, n)])
            }
            MessageId::MOT_REQ_STATUSUPDATE => Ok(vec![reply_long(
                MessageId::MOT_GET_STATUSUPDATE,
                PayloadWriter::for_slot(n)
                    .put_i32(sim.encoder)
                    .put_u32(sim.status_bits().bits())
                    .finish(),
            )]),
            MessageId::MOT_SET_EEPROMPARAMS => {
                let group = PayloadReader::after_slot(frame.payload())
                    .and_then(|mut r| r.u16())
                    .map_err(malformed)?;
                match PersistKind::from_group_id(group).ok_or(DeviceErrorCode::OUT_OF_RANGE)? {
                    PersistKind::SoftLimits => sim.stored.soft_limits = sim.volatile.soft_limits,
                    PersistKind::Home => sim.stored.home_direction = sim.volatile.home_direction,
                    PersistKind::JogParams => sim.stored.jog_step = sim.volatile.jog_step,
                }
                Ok(vec![ack(n)])
            }
            MessageId::MOD_SET_SLOTTITLE => {
                sim.volatile.title = PayloadReader::after_slot(frame.payload())
                    .and_then(|mut r| r.fixed_str(TITLE_WIDTH))
                    .map_err(malformed)?;
                sim.stored.title = sim.volatile.title.clone();
                Ok(vec![ack(n)])
            }
            MessageId::MOD_REQ_SLOTTITLE => Ok(vec![reply_long(
                MessageId::MOD_GET_SLOTTITLE,
                PayloadWriter::for_slot(n)
                    .put_fixed_str(&sim.volatile.title, TITLE_WIDTH)
                    .finish(),
            )]),
            MessageId::MOD_REQ_PNPSTATUS => {
                let pnp = if sim.device_type.is_some() { PnpStatus::empty() } else { PnpStatus::NO_DEVICE };
                Ok(vec![reply_long(
                    MessageId::MOD_GET_PNPSTATUS,
                    PayloadWriter::for_slot(n).put_u32(pnp.bits()).finish(),
                )])
            }
            MessageId::MOT_REQ_STAGEPARAMS => {
                let stage = sim.stage.ok_or(DeviceErrorCode::NO_STAGE_PARAMS)?;
                Ok(vec![reply_long(
                    MessageId::MOT_GET_STAGEPARAMS,
                    PayloadWriter::for_slot(n)
                        .put_u32(stage.counts_per_unit)
                        .put_f32(stage.nm_per_count)
                        .put_u32(stage.min_position)
                        .put_u32(stage.max_position)
                        .put_f64(stage.max_speed)
                        .put_f64(stage.max_acceleration)
                        .finish(),
                )])
            }
            MessageId::MOD_REQ_DEVICETYPE => Ok(vec![reply_long(
                MessageId::MOD_GET_DEVICETYPE,
                PayloadWriter::for_slot(n)
                    .put_fixed_str(sim.device_type.as_deref().unwrap_or(""), DEVICE_TYPE_WIDTH)
                    .finish(),
            )]),
            MessageId::MOD_ERASE_CONFIG => {
                sim.volatile = SlotConfig::default();
                sim.stored = SlotConfig::default();
                Ok(vec![ack(n)])
            }
            _ => Err(DeviceErrorCode::OUT_OF_RANGE),
        }
    }

    fn check_can_move(sim: &SimSlot) -> std::result::Result<(), u16> {
        if !sim.enabled || sim.device_type.is_none() {
            return Err(DeviceErrorCode::FAULT);
        }
        if sim.jog.is_some() || sim.held.is_some() {
            return Err(DeviceErrorCode::BUSY);
        }
        Ok(())
    }

    fn hardware_info(&self) -> Frame {
        let (major, interim, minor) = self.firmware;
        reply_long(
            MessageId::HW_GET_INFO,
            PayloadWriter::new()
                .put_u8(minor)
                .put_u8(interim)
                .put_u8(major)
                .put_u8(self.cpid.0)
                .put_u8(self.cpid.1)
                .put_fixed_str("MCM301", MODEL_WIDTH)
                .finish(),
        )
    }

    fn restart(&mut self) -> Frame {
        for sim in &mut self.slots {
            sim.enabled = false;
            sim.jog = None;
            sim.held = None;
            sim.homed = false;
            sim.latched_limits = StatusBits::empty();
            sim.volatile = sim.stored.clone();
        }
        ack(0)
    }

    fn efs_pages_used(&self) -> u16 {
        self.files.values().map(|f| f.pages).sum()
    }

    fn efs_hardware_info(&self) -> Frame {
        reply_long(
            MessageId::EFS_GET_HWINFO,
            PayloadWriter::new()
                .put_u8(1)
                .put_u8(1)
                .put_u16(EFS_PAGE_SIZE)
                .put_u16(EFS_PAGES)
                .put_u16(EFS_MAX_FILES)
                .put_u16(EFS_MAX_FILES - self.files.len() as u16)
                .put_u16(EFS_PAGES - self.efs_pages_used())
                .finish(),
        )
    }

    fn efs_file_info(&self, name: u8) -> Frame {
        let mut payload = PayloadWriter::new();
        payload.put_u8(name);
        match self.files.get(&name) {
            Some(file) => payload
                .put_u8(1)
                .put_u8(file.owned as u8)
                .put_u8(file.attributes.bits())
                .put_u16(file.pages),
            None => payload.put_u8(0).put_u8(0).put_u8(0).put_u16(0),
        };
        reply_long(MessageId::EFS_GET_FILEINFO, payload.finish())
    }

    fn efs_set_file_info(&mut self, payload: &[u8]) -> Reply {
        let mut reader = PayloadReader::new(payload);
        let name = reader.u8().map_err(malformed)?;
        let raw = reader.u8().map_err(malformed)?;
        let pages = reader.u16().map_err(malformed)?;
        let attributes = FileAttributes::from_bits(raw).ok_or(DeviceErrorCode::INVALID_ATTRIBUTE)?;

        if pages == 0 {
            let file = self.files.get(&name).ok_or(DeviceErrorCode::FILE_NOT_FOUND)?;
            if !file.attributes.contains(FileAttributes::APP_DELETE) {
                return Err(DeviceErrorCode::PERMISSION);
            }
            self.files.remove(&name);
        } else {
            if self.files.contains_key(&name) {
                return Err(DeviceErrorCode::FILE_EXISTS);
            }
            if self.files.len() as u16 >= EFS_MAX_FILES || pages > EFS_PAGES - self.efs_pages_used() {
                return Err(DeviceErrorCode::OUT_OF_RANGE);
            }
            self.files.insert(
                name,
                SimFile {
                    attributes,
                    owned: true,
                    pages,
                    data: vec![0; pages as usize * EFS_PAGE_SIZE as usize],
                },
            );
        }
        Ok(vec![ack(0)])
    }

    /// Locate a data request inside its file, enforcing one page per request
    fn efs_span(&self, name: u8, address: u32, len: usize, required: FileAttributes) -> std::result::Result<std::ops::Range<usize>, u16> {
        let file = self.files.get(&name).ok_or(DeviceErrorCode::FILE_NOT_FOUND)?;
        if !file.attributes.contains(required) {
            return Err(DeviceErrorCode::PERMISSION);
        }
        let start = address as usize;
        let end = start + len;
        let page = EFS_PAGE_SIZE as usize;
        let crosses_page = len > 0 && start / page != (end - 1) / page;
        if end > file.data.len() || crosses_page {
            return Err(DeviceErrorCode::OUT_OF_RANGE);
        }
        Ok(start..end)
    }

    fn efs_write(&mut self, payload: &[u8]) -> Reply {
        let mut reader = PayloadReader::new(payload);
        let (name, address, len) = data_header(&mut reader).map_err(malformed)?;
        let data = reader.bytes(len as usize).map_err(malformed)?;
        let span = self.efs_span(name, address, data.len(), FileAttributes::APP_WRITE)?;
        if let Some(file) = self.files.get_mut(&name) {
            file.data[span].copy_from_slice(data);
        }
        Ok(vec![ack(0)])
    }

    fn efs_read(&self, payload: &[u8]) -> Reply {
        let mut reader = PayloadReader::new(payload);
        let (name, address, len) = data_header(&mut reader).map_err(malformed)?;
        let span = self.efs_span(name, address, len as usize, FileAttributes::APP_READ)?;
        let data = self.files.get(&name).map(|f| &f.data[span]).unwrap_or_default();
        Ok(vec![reply_long(
            MessageId::EFS_GET_FILEDATA,
            PayloadWriter::new()
                .put_u8(name)
                .put_u32(address)
                .put_u16(len)
                .put_bytes(data)
                .finish(),
        )])
    }
}

fn data_header(reader: &mut PayloadReader<'_>) -> crate::serial::Result<(u8, u32, u16)> {
    Ok((reader.u8()?, reader.u32()?, reader.u16()?))
}

fn malformed(_: SerialError) -> u16 {
    DeviceErrorCode::OUT_OF_RANGE
}

fn ack(slot: u8) -> Frame {
    reply_short(MessageId::HW_RESPONSE, slot, 0)
}

fn event(id: u16, slot: u8) -> Frame {
    reply_short(id, slot, 0)
}

fn reply_short(id: u16, param1: u8, param2: u8) -> Frame {
    Frame::short(id, param1, param2).into_reply()
}

fn reply_long(id: u16, payload: Vec<u8>) -> Frame {
    Frame::long(id, payload).into_reply()
}

fn error_frame(failed_id: u16, code: u16, slot: Option<u8>) -> Frame {
    let mut payload = PayloadWriter::new();
    payload.put_u16(failed_id).put_u16(code);
    if let Some(slot) = slot {
        payload.put_u16(slot as u16);
    }
    reply_long(MessageId::HW_RICH_RESPONSE, payload.finish())
}
