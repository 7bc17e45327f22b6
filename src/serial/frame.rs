//! Binary framing used on the controller link.
//!
//! Every frame starts with a six byte header:
//!
//! ```text
//! [id_lo, id_hi, a, b, dest, src]
//! ```
//!
//! Short frames carry two parameter bytes in `a`/`b`. Long frames store the
//! payload length in `a`/`b`, set bit 0x80 on `dest` and are followed by the
//! payload. Multi-byte values are little endian.

use super::{Result, SerialError};

pub const HEADER_LEN: usize = 6;
pub const HOST_ADDRESS: u8 = 0x01;
pub const CONTROLLER_ADDRESS: u8 = 0x50;
pub const LONG_FRAME_FLAG: u8 = 0x80;
/// Largest payload accepted from the device
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// Message identifiers understood by the controller firmware
pub struct MessageId;

impl MessageId {
    pub const HW_REQ_INFO: u16 = 0x0005;
    pub const HW_GET_INFO: u16 = 0x0006;
    pub const EFS_REQ_HWINFO: u16 = 0x0060;
    pub const EFS_GET_HWINFO: u16 = 0x0061;
    pub const EFS_SET_FILEINFO: u16 = 0x0062;
    pub const EFS_REQ_FILEINFO: u16 = 0x0063;
    pub const EFS_GET_FILEINFO: u16 = 0x0064;
    pub const EFS_SET_FILEDATA: u16 = 0x0065;
    pub const EFS_REQ_FILEDATA: u16 = 0x0066;
    pub const EFS_GET_FILEDATA: u16 = 0x0067;
    pub const HW_RESPONSE: u16 = 0x0080;
    pub const HW_RICH_RESPONSE: u16 = 0x0081;
    pub const MOD_SET_CHANENABLESTATE: u16 = 0x0210;
    pub const MOD_REQ_CHANENABLESTATE: u16 = 0x0211;
    pub const MOD_GET_CHANENABLESTATE: u16 = 0x0212;
    pub const MOD_IDENTIFY: u16 = 0x0223;
    pub const MOT_SET_ENCCOUNTER: u16 = 0x0409;
    pub const MOT_SET_JOGPARAMS: u16 = 0x0416;
    pub const MOT_REQ_JOGPARAMS: u16 = 0x0417;
    pub const MOT_GET_JOGPARAMS: u16 = 0x0418;
    pub const MOT_SET_SOFTLIMITS: u16 = 0x0423;
    pub const MOT_SET_SOFTLIMITVALUES: u16 = 0x0424;
    pub const MOT_REQ_SOFTLIMITS: u16 = 0x0425;
    pub const MOT_GET_SOFTLIMITS: u16 = 0x0426;
    pub const MOT_SET_HOMEPARAMS: u16 = 0x0440;
    pub const MOT_REQ_HOMEPARAMS: u16 = 0x0441;
    pub const MOT_GET_HOMEPARAMS: u16 = 0x0442;
    pub const MOT_MOVE_HOME: u16 = 0x0443;
    pub const MOT_MOVE_HOMED: u16 = 0x0444;
    pub const MOT_MOVE_ABSOLUTE: u16 = 0x0453;
    pub const MOT_MOVE_VELOCITY: u16 = 0x0457;
    pub const MOT_MOVE_COMPLETED: u16 = 0x0464;
    pub const MOT_MOVE_STOP: u16 = 0x0465;
    pub const MOT_MOVE_STOPPED: u16 = 0x0466;
    pub const MOT_MOVE_FAULT: u16 = 0x0468;
    pub const MOT_MOVE_JOG: u16 = 0x046A;
    pub const MOT_REQ_STATUSUPDATE: u16 = 0x0480;
    pub const MOT_GET_STATUSUPDATE: u16 = 0x0481;
    pub const MOT_SET_EEPROMPARAMS: u16 = 0x04B9;
    pub const MOD_SET_SLOTTITLE: u16 = 0x04C0;
    pub const MOD_REQ_SLOTTITLE: u16 = 0x04C1;
    pub const MOD_GET_SLOTTITLE: u16 = 0x04C2;
    pub const MOD_SET_SYSTEMDIM: u16 = 0x04C3;
    pub const MOD_REQ_SYSTEMDIM: u16 = 0x04C4;
    pub const MOD_GET_SYSTEMDIM: u16 = 0x04C5;
    pub const MOD_REQ_PNPSTATUS: u16 = 0x04C6;
    pub const MOD_GET_PNPSTATUS: u16 = 0x04C7;
    pub const MOD_REQ_BOARDSTATUS: u16 = 0x04C8;
    pub const MOD_GET_BOARDSTATUS: u16 = 0x04C9;
    pub const MOT_REQ_STAGEPARAMS: u16 = 0x04CA;
    pub const MOT_GET_STAGEPARAMS: u16 = 0x04CB;
    pub const MOD_REQ_DEVICETYPE: u16 = 0x04CC;
    pub const MOD_GET_DEVICETYPE: u16 = 0x04CD;
    pub const MOD_ERASE_CONFIG: u16 = 0x04CE;
    pub const HW_RESTART: u16 = 0x04CF;

    /// Frames the controller sends without a matching request
    pub fn is_unsolicited(id: u16) -> bool {
        matches!(
            id,
            Self::MOT_MOVE_HOMED | Self::MOT_MOVE_COMPLETED | Self::MOT_MOVE_STOPPED | Self::MOT_MOVE_FAULT
        )
    }

    /// Requests whose first parameter (or first payload word) is a slot.
    /// Ids below 0x0200 (hardware info, file system) never carry one.
    pub fn is_slot_addressed(id: u16) -> bool {
        id >= 0x0200
            && !matches!(
                id,
                Self::HW_RESTART | Self::MOD_SET_SYSTEMDIM | Self::MOD_REQ_SYSTEMDIM | Self::MOD_REQ_BOARDSTATUS
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Short { param1: u8, param2: u8 },
    Long(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub dest: u8,
    pub source: u8,
    pub body: FrameBody,
}

impl Frame {
    /// Host to controller short frame
    pub fn short(id: u16, param1: u8, param2: u8) -> Self {
        Self {
            id,
            dest: CONTROLLER_ADDRESS,
            source: HOST_ADDRESS,
            body: FrameBody::Short { param1, param2 },
        }
    }

    /// Host to controller frame with payload
    pub fn long(id: u16, payload: Vec<u8>) -> Self {
        Self {
            id,
            dest: CONTROLLER_ADDRESS,
            source: HOST_ADDRESS,
            body: FrameBody::Long(payload),
        }
    }

    /// Swap addresses, used for replies built by the controller side
    pub fn into_reply(mut self) -> Self {
        self.dest = HOST_ADDRESS;
        self.source = CONTROLLER_ADDRESS;
        self
    }

    pub fn params(&self) -> (u8, u8) {
        match self.body {
            FrameBody::Short { param1, param2 } => (param1, param2),
            FrameBody::Long(_) => (0, 0),
        }
    }

    pub fn payload(&self) -> &[u8] {
        match &self.body {
            FrameBody::Long(payload) => payload,
            FrameBody::Short { .. } => &[],
        }
    }

    /// Slot byte of a slot-addressed frame
    pub fn slot(&self) -> Option<u8> {
        match &self.body {
            FrameBody::Short { param1, .. } => Some(*param1),
            FrameBody::Long(payload) if payload.len() >= 2 => Some(payload[0]),
            FrameBody::Long(_) => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let id = self.id.to_le_bytes();
        match &self.body {
            FrameBody::Short { param1, param2 } => {
                vec![id[0], id[1], *param1, *param2, self.dest, self.source]
            }
            FrameBody::Long(payload) => {
                let len = (payload.len() as u16).to_le_bytes();
                let mut buffer = Vec::with_capacity(HEADER_LEN + payload.len());
                buffer.extend_from_slice(&[id[0], id[1], len[0], len[1], self.dest | LONG_FRAME_FLAG, self.source]);
                buffer.extend_from_slice(payload);
                buffer
            }
        }
    }
}

/// Accumulates raw bytes and yields complete frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Next complete frame, `Ok(None)` while more bytes are needed.
    ///
    /// A header with an oversized payload length is dropped together with
    /// everything buffered so the stream can resynchronise.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let id = u16::from_le_bytes([self.buffer[0], self.buffer[1]]);
        let dest = self.buffer[4];
        let source = self.buffer[5];

        if dest & LONG_FRAME_FLAG == 0 {
            let frame = Frame {
                id,
                dest,
                source,
                body: FrameBody::Short { param1: self.buffer[2], param2: self.buffer[3] },
            };
            self.buffer.drain(..HEADER_LEN);
            return Ok(Some(frame));
        }

        let len = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            self.buffer.clear();
            return Err(SerialError::ProtocolError(format!(
                "Frame 0x{:04X} announces {} byte payload",
                id, len
            )));
        }
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buffer.drain(..HEADER_LEN + len);
        Ok(Some(Frame {
            id,
            dest: dest & !LONG_FRAME_FLAG,
            source,
            body: FrameBody::Long(payload),
        }))
    }
}

/// Little endian payload builder
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buffer: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload that starts with the slot identifier
    pub fn for_slot(slot: u8) -> Self {
        let mut writer = Self::new();
        writer.put_u16(slot as u16);
        writer
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_f32(&mut self, value: f32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_f64(&mut self, value: f64) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(value);
        self
    }

    /// Fixed width, zero padded string field
    pub fn put_fixed_str(&mut self, value: &str, width: usize) -> &mut Self {
        let bytes = value.as_bytes();
        let take = bytes.len().min(width);
        self.buffer.extend_from_slice(&bytes[..take]);
        self.buffer.resize(self.buffer.len() + (width - take), 0);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

/// Little endian payload cursor
pub struct PayloadReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Skip the leading slot identifier
    pub fn after_slot(data: &'a [u8]) -> Result<Self> {
        let mut reader = Self::new(data);
        reader.u16()?;
        Ok(reader)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.offset + n > self.data.len() {
            return Err(SerialError::ProtocolError(format!(
                "Payload too short: need {} bytes at offset {}, have {}",
                n,
                self.offset,
                self.data.len()
            )));
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Zero terminated string inside a fixed width field
    pub fn fixed_str(&mut self, width: usize) -> Result<String> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).trim().to_string())
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_frame_layout() {
        let frame = Frame::short(MessageId::MOT_MOVE_HOME, 4, 0);
        assert_eq!(frame.to_bytes(), vec![0x43, 0x04, 4, 0, CONTROLLER_ADDRESS, HOST_ADDRESS]);
    }

    #[test]
    fn test_long_frame_layout() {
        let payload = PayloadWriter::for_slot(5).put_i32(-2).finish();
        let bytes = Frame::long(MessageId::MOT_MOVE_ABSOLUTE, payload).to_bytes();
        assert_eq!(&bytes[..6], &[0x53, 0x04, 6, 0, CONTROLLER_ADDRESS | LONG_FRAME_FLAG, HOST_ADDRESS]);
        assert_eq!(&bytes[6..], &[5, 0, 0xFE, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_decoder_handles_split_and_batched_input() {
        let first = Frame::short(MessageId::HW_RESPONSE, 4, 0).into_reply();
        let second = Frame::long(MessageId::MOT_GET_STATUSUPDATE, PayloadWriter::for_slot(4).put_i32(1000).put_u32(0x100).finish())
            .into_reply();
        let mut stream = first.to_bytes();
        stream.extend(second.to_bytes());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream[..4]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&stream[4..9]);
        assert_eq!(decoder.next_frame().unwrap(), Some(first));
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&stream[9..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(second));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_rejects_oversized_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x81, 0x00, 0xFF, 0xFF, HOST_ADDRESS | LONG_FRAME_FLAG, CONTROLLER_ADDRESS]);
        assert!(matches!(decoder.next_frame(), Err(SerialError::ProtocolError(_))));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_payload_reader_short_input() {
        let mut reader = PayloadReader::new(&[1, 2, 3]);
        assert_eq!(reader.u16().unwrap(), 0x0201);
        assert!(reader.u32().is_err());
    }

    #[test]
    fn test_fixed_str_roundtrip() {
        let payload = PayloadWriter::new().put_fixed_str("Stage X", 16).finish();
        assert_eq!(payload.len(), 16);
        assert_eq!(PayloadReader::new(&payload).fixed_str(16).unwrap(), "Stage X");
    }
}
