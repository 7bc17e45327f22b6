//! Per-slot motion state tracking.
//!
//! Every slot owns a logical `MotionState` that changes only through
//! [`next_state`]. Commands move the state before the frame is sent, device
//! events move it when they arrive. A slot also carries a busy guard so a
//! second operation on the same slot fails fast with `SlotBusy` instead of
//! queueing behind the first one.
//!
//! Events carry no reference to the command that caused them. The
//! `MoveStopped` that answers a stop can arrive after the next motion has
//! started, so each slot counts the motions it starts and remembers which
//! one a stop was sent for.
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::device::{DeviceError, Result, SlotId};
use crate::serial::queue::DeviceEventKind;
use crate::status::StatusBits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotionState {
    Disabled,
    Idle,
    Homing,
    Moving,
    Jogging,
    Error,
    /// Link failed while a motion command was outstanding
    Unknown,
}

impl MotionState {
    /// A motion is (or may be) in progress
    pub fn is_busy(self) -> bool {
        matches!(self, MotionState::Homing | MotionState::Moving | MotionState::Jogging)
    }
}

/// Inputs accepted by the slot state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Enable,
    Disable,
    Home,
    MoveAbsolute,
    Jog,
    Stop,
    SetEncoder,
    Homed,
    MoveCompleted,
    MoveStopped,
    Fault,
}

impl Transition {
    pub fn is_event(self) -> bool {
        matches!(
            self,
            Transition::Homed | Transition::MoveCompleted | Transition::MoveStopped | Transition::Fault
        )
    }
}

impl From<DeviceEventKind> for Transition {
    fn from(kind: DeviceEventKind) -> Self {
        match kind {
            DeviceEventKind::Homed => Transition::Homed,
            DeviceEventKind::MoveCompleted => Transition::MoveCompleted,
            DeviceEventKind::MoveStopped => Transition::MoveStopped,
            DeviceEventKind::Fault => Transition::Fault,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Slot is moving or in a state that does not accept the command
    Busy,
    /// Slot is in `Error`, only enable/disable/stop clear it
    Faulted,
}

/// Transition table.
///
/// Commands that do not fit the current state are rejected. Events that do
/// not fit are ignored and leave the state as it is.
pub fn next_state(state: MotionState, input: Transition) -> std::result::Result<MotionState, Rejection> {
    use MotionState::*;

    match input {
        Transition::Enable => match state {
            Disabled | Idle | Error | Unknown => Ok(Idle),
            _ => Err(Rejection::Busy),
        },
        Transition::Disable => {
            if state.is_busy() {
                Err(Rejection::Busy)
            } else {
                Ok(Disabled)
            }
        }
        Transition::Home => start_motion(state, Homing),
        Transition::MoveAbsolute => start_motion(state, Moving),
        Transition::Jog => start_motion(state, Jogging),
        Transition::Stop => match state {
            Disabled => Ok(Disabled),
            _ => Ok(Idle),
        },
        Transition::SetEncoder => match state {
            Disabled | Idle | Error => Ok(state),
            _ => Err(Rejection::Busy),
        },
        Transition::Homed => Ok(if state == Homing { Idle } else { state }),
        Transition::MoveCompleted => Ok(if state == Moving { Idle } else { state }),
        Transition::MoveStopped => Ok(if state.is_busy() { Idle } else { state }),
        Transition::Fault => Ok(match state {
            Idle | Homing | Moving | Jogging | Unknown => Error,
            other => other,
        }),
    }
}

fn start_motion(state: MotionState, target: MotionState) -> std::result::Result<MotionState, Rejection> {
    match state {
        MotionState::Idle => Ok(target),
        MotionState::Error => Err(Rejection::Faulted),
        _ => Err(Rejection::Busy),
    }
}

/// Cached view of one slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub state: MotionState,
    pub enabled: bool,
    /// Last encoder count seen in a status poll or set by the host
    pub encoder_count: i32,
    pub status: StatusBits,
    /// Bumped every time a home, move or jog starts
    #[serde(skip)]
    pub(crate) generation: u64,
    /// Motion a stop was sent for, until its `MoveStopped` arrives
    #[serde(skip)]
    pub(crate) stop_pending: Option<u64>,
}

impl Slot {
    fn new(id: SlotId) -> Self {
        Self {
            id,
            state: MotionState::Disabled,
            enabled: false,
            encoder_count: 0,
            status: StatusBits::empty(),
            generation: 0,
            stop_pending: None,
        }
    }
}

struct SlotCell {
    slot: Mutex<Slot>,
    busy: AtomicBool,
    state_tx: watch::Sender<MotionState>,
}

/// Releases the slot's busy flag on drop
pub struct SlotGuard<'a> {
    cell: &'a SlotCell,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.cell.busy.store(false, Ordering::Release);
    }
}

/// State of the three slots of one session
pub struct SlotTable {
    cells: [SlotCell; 3],
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    pub fn new() -> Self {
        let cells = SlotId::ALL.map(|id| SlotCell {
            slot: Mutex::new(Slot::new(id)),
            busy: AtomicBool::new(false),
            state_tx: watch::channel(MotionState::Disabled).0,
        });
        Self { cells }
    }

    fn cell(&self, id: SlotId) -> &SlotCell {
        &self.cells[id.index()]
    }

    /// Take the busy guard or fail with `SlotBusy`
    pub fn try_claim(&self, id: SlotId) -> Result<SlotGuard<'_>> {
        let cell = self.cell(id);
        if cell
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeviceError::SlotBusy(format!(
                "slot {} has an operation in flight",
                id
            )));
        }
        Ok(SlotGuard { cell })
    }

    pub async fn state(&self, id: SlotId) -> MotionState {
        self.cell(id).slot.lock().await.state
    }

    pub async fn snapshot(&self, id: SlotId) -> Slot {
        self.cell(id).slot.lock().await.clone()
    }

    pub fn subscribe(&self, id: SlotId) -> watch::Receiver<MotionState> {
        self.cell(id).state_tx.subscribe()
    }

    /// Validate a command against the current state without changing it
    pub async fn check(&self, id: SlotId, input: Transition) -> Result<MotionState> {
        let current = self.state(id).await;
        next_state(current, input).map_err(|rejection| reject(id, current, input, rejection))
    }

    /// Apply a command, returning the state it replaced
    pub async fn begin(&self, id: SlotId, input: Transition) -> Result<MotionState> {
        let cell = self.cell(id);
        let mut slot = cell.slot.lock().await;
        let previous = slot.state;
        let next = next_state(previous, input).map_err(|rejection| reject(id, previous, input, rejection))?;
        if matches!(input, Transition::Home | Transition::MoveAbsolute | Transition::Jog) {
            slot.generation += 1;
        }
        Self::store(cell, &mut slot, next);
        Ok(previous)
    }

    /// Tie the next `MoveStopped` to the motion running now
    pub async fn mark_stopping(&self, id: SlotId) {
        let mut slot = self.cell(id).slot.lock().await;
        slot.stop_pending = Some(slot.generation);
    }

    /// The stop did not reach the device, no `MoveStopped` will follow
    pub async fn clear_stopping(&self, id: SlotId) {
        self.cell(id).slot.lock().await.stop_pending = None;
    }

    /// Apply a device event
    pub async fn apply_event(&self, id: SlotId, kind: DeviceEventKind) -> MotionState {
        let cell = self.cell(id);
        let mut slot = cell.slot.lock().await;
        if kind == DeviceEventKind::MoveStopped {
            if let Some(stopped) = slot.stop_pending.take() {
                if stopped != slot.generation {
                    log::debug!("Slot {} ignoring stop of an earlier motion", id);
                    return slot.state;
                }
            }
        }
        // Events never reject
        let next = next_state(slot.state, kind.into()).unwrap_or(slot.state);
        if next != slot.state {
            log::debug!("Slot {} {:?} -> {:?} on {:?}", id, slot.state, next, kind);
        }
        Self::store(cell, &mut slot, next);
        next
    }

    /// Overwrite the state, used to roll back or mark the slot `Unknown`
    pub async fn set_state(&self, id: SlotId, state: MotionState) {
        let cell = self.cell(id);
        let mut slot = cell.slot.lock().await;
        Self::store(cell, &mut slot, state);
    }

    pub async fn update<F>(&self, id: SlotId, f: F)
    where
        F: FnOnce(&mut Slot),
    {
        let cell = self.cell(id);
        let mut slot = cell.slot.lock().await;
        f(&mut *slot);
        let state = slot.state;
        Self::store(cell, &mut slot, state);
    }

    fn store(cell: &SlotCell, slot: &mut Slot, state: MotionState) {
        slot.state = state;
        slot.enabled = state != MotionState::Disabled;
        cell.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

fn reject(id: SlotId, state: MotionState, input: Transition, rejection: Rejection) -> DeviceError {
    match rejection {
        Rejection::Busy => DeviceError::SlotBusy(format!("slot {} is {:?}, cannot {:?}", id, state, input)),
        Rejection::Faulted => DeviceError::DeviceFault(format!(
            "slot {} is in error state, re-enable or stop it before {:?}",
            id, input
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MotionState::*;

    #[test]
    fn test_motion_requires_idle() {
        assert_eq!(next_state(Idle, Transition::MoveAbsolute), Ok(Moving));
        assert_eq!(next_state(Idle, Transition::Home), Ok(Homing));
        assert_eq!(next_state(Moving, Transition::Home), Err(Rejection::Busy));
        assert_eq!(next_state(Disabled, Transition::Jog), Err(Rejection::Busy));
        assert_eq!(next_state(Error, Transition::MoveAbsolute), Err(Rejection::Faulted));
        assert_eq!(next_state(Unknown, Transition::MoveAbsolute), Err(Rejection::Busy));
    }

    #[test]
    fn test_enable_and_disable() {
        assert_eq!(next_state(Disabled, Transition::Enable), Ok(Idle));
        assert_eq!(next_state(Error, Transition::Enable), Ok(Idle));
        assert_eq!(next_state(Jogging, Transition::Enable), Err(Rejection::Busy));
        assert_eq!(next_state(Idle, Transition::Disable), Ok(Disabled));
        assert_eq!(next_state(Homing, Transition::Disable), Err(Rejection::Busy));
    }

    #[test]
    fn test_stop_preempts_motion() {
        for state in [Homing, Moving, Jogging, Error, Unknown, Idle] {
            assert_eq!(next_state(state, Transition::Stop), Ok(Idle));
        }
        assert_eq!(next_state(Disabled, Transition::Stop), Ok(Disabled));
    }

    #[test]
    fn test_events_only_end_matching_motion() {
        assert_eq!(next_state(Homing, Transition::Homed), Ok(Idle));
        assert_eq!(next_state(Moving, Transition::Homed), Ok(Moving));
        assert_eq!(next_state(Moving, Transition::MoveCompleted), Ok(Idle));
        assert_eq!(next_state(Jogging, Transition::MoveStopped), Ok(Idle));
        assert_eq!(next_state(Disabled, Transition::MoveStopped), Ok(Disabled));
        assert_eq!(next_state(Moving, Transition::Fault), Ok(Error));
        assert_eq!(next_state(Disabled, Transition::Fault), Ok(Disabled));
    }

    #[tokio::test]
    async fn test_guard_rejects_second_claim() {
        let table = SlotTable::new();
        let slot = SlotId::try_from(4).unwrap();
        let guard = table.try_claim(slot).unwrap();
        assert!(matches!(table.try_claim(slot), Err(DeviceError::SlotBusy(_))));
        assert!(table.try_claim(SlotId::try_from(5).unwrap()).is_ok());
        drop(guard);
        assert!(table.try_claim(slot).is_ok());
    }

    #[tokio::test]
    async fn test_begin_publishes_state() {
        let table = SlotTable::new();
        let slot = SlotId::try_from(6).unwrap();
        let mut rx = table.subscribe(slot);

        assert!(matches!(table.begin(slot, Transition::Home).await, Err(DeviceError::SlotBusy(_))));
        assert_eq!(table.begin(slot, Transition::Enable).await.unwrap(), Disabled);
        assert_eq!(table.begin(slot, Transition::Home).await.unwrap(), Idle);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Homing);

        assert_eq!(table.apply_event(slot, DeviceEventKind::Homed).await, Idle);
        assert!(table.snapshot(slot).await.enabled);
    }

    #[tokio::test]
    async fn test_late_stop_event_spares_next_motion() {
        let table = SlotTable::new();
        let slot = SlotId::try_from(4).unwrap();
        table.begin(slot, Transition::Enable).await.unwrap();
        table.begin(slot, Transition::Jog).await.unwrap();

        table.mark_stopping(slot).await;
        table.begin(slot, Transition::Stop).await.unwrap();
        table.begin(slot, Transition::MoveAbsolute).await.unwrap();

        assert_eq!(table.apply_event(slot, DeviceEventKind::MoveStopped).await, Moving);
        // A second stop event is a real one, e.g. a limit
        assert_eq!(table.apply_event(slot, DeviceEventKind::MoveStopped).await, Idle);
    }

    #[tokio::test]
    async fn test_stop_event_before_ack_ends_motion() {
        let table = SlotTable::new();
        let slot = SlotId::try_from(5).unwrap();
        table.begin(slot, Transition::Enable).await.unwrap();
        table.begin(slot, Transition::Home).await.unwrap();

        table.mark_stopping(slot).await;
        assert_eq!(table.apply_event(slot, DeviceEventKind::MoveStopped).await, Idle);
        assert!(table.snapshot(slot).await.stop_pending.is_none());
    }
}
