//! Per-session request queue types
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::serial::frame::{Frame, MessageId, PayloadReader};
use crate::serial::SerialError;

/// One request/reply exchange on the link
#[derive(Debug, Clone)]
pub struct Request {
    pub label: &'static str,
    pub frame: Frame,
    /// Message id that completes the exchange (`HW_RESPONSE` for plain acks)
    pub reply_id: u16,
}

impl Request {
    pub fn new(label: &'static str, frame: Frame, reply_id: u16) -> Self {
        Self { label, frame, reply_id }
    }

    /// Request answered by a generic acknowledgement
    pub fn acked(label: &'static str, frame: Frame) -> Self {
        Self::new(label, frame, MessageId::HW_RESPONSE)
    }

    /// Whether `frame` completes this request
    pub fn is_answered_by(&self, frame: &Frame) -> bool {
        if frame.id == MessageId::HW_RICH_RESPONSE {
            return self.is_failed_by(frame);
        }
        if frame.id != self.reply_id {
            return false;
        }
        match (self.frame.slot(), frame.slot()) {
            (Some(sent), Some(got)) if self.is_slot_addressed() => sent == got,
            _ => true,
        }
    }

    /// Error frames name the failed id and, for slot requests, the slot
    fn is_failed_by(&self, frame: &Frame) -> bool {
        let mut reader = PayloadReader::new(frame.payload());
        let Ok(failed) = reader.u16() else {
            return false;
        };
        if failed != self.frame.id {
            return false;
        }
        let slot = reader.u16().and_then(|_code| reader.u16());
        match (self.frame.slot(), slot) {
            (Some(sent), Ok(got)) if self.is_slot_addressed() => sent as u16 == got,
            _ => true,
        }
    }

    fn is_slot_addressed(&self) -> bool {
        MessageId::is_slot_addressed(self.frame.id)
    }
}

pub enum QueueCommand {
    Transact {
        request: Request,
        responder: oneshot::Sender<Result<Frame, SerialError>>,
    },
    Shutdown,
}

impl std::fmt::Debug for QueueCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueCommand::Transact { request, .. } => write!(f, "Transact({})", request.label),
            QueueCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEventKind {
    Homed,
    MoveCompleted,
    MoveStopped,
    Fault,
}

/// Frame the controller sent on its own, e.g. end of a move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub slot: u8,
    pub kind: DeviceEventKind,
    pub code: u8,
}

impl DeviceEvent {
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let kind = match frame.id {
            MessageId::MOT_MOVE_HOMED => DeviceEventKind::Homed,
            MessageId::MOT_MOVE_COMPLETED => DeviceEventKind::MoveCompleted,
            MessageId::MOT_MOVE_STOPPED => DeviceEventKind::MoveStopped,
            MessageId::MOT_MOVE_FAULT => DeviceEventKind::Fault,
            _ => return None,
        };
        let (slot, code) = frame.params();
        Some(Self { slot, kind, code })
    }
}

/// Link health counters published by the queue worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub requests_completed: u64,
    pub request_timeouts: u64,
    pub link_errors: u64,
    pub unexpected_frames: u64,
    /// Frames dropped after a timeout as late replies
    pub stale_replies: u64,
    pub events_received: u64,
    pub last_latency_ms: Option<u64>,
    /// Error of the most recent exchange, cleared by the next success
    pub last_error: Option<String>,
    pub last_error_was_timeout: bool,
    pub closed: bool,
}
