use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::DriverSettings;
use crate::efs::EfsHardwareInfo;
use crate::serial::frame::{Frame, MessageId, PayloadReader};
use crate::serial::queue::{DeviceEvent, QueueMetrics, Request};
use crate::serial::{QueueBuilder, QueueHandle, Transport};
use crate::stage::{ParameterStore, SlotTable, UnitConverter};
use super::{DeviceError, ErrorState, PortDescriptor, Result, SessionHandle, SessionInfo, SlotId};

/// How long `shutdown` waits for the worker before aborting it
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// One open controller.
///
/// All device I/O goes through the session's request queue. Slot, parameter,
/// file system and status operations are implemented on this type in their
/// own modules.
pub struct Session {
    info: SessionInfo,
    queue: QueueHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) slots: Arc<SlotTable>,
    pub(crate) params: Mutex<ParameterStore>,
    pub(crate) converter: RwLock<UnitConverter>,
    pub(crate) efs_info: Mutex<Option<EfsHardwareInfo>>,
}

impl Session {
    /// Start the queue worker and event task on an open transport
    pub(crate) fn start(
        handle: SessionHandle,
        port: PortDescriptor,
        transport: Box<dyn Transport>,
        baud_rate: u32,
        timeout_secs: u32,
        settings: &DriverSettings,
    ) -> Arc<Self> {
        let (queue, worker) = QueueBuilder::new(transport, Duration::from_secs(timeout_secs as u64))
            .idle_read(Duration::from_millis(settings.idle_read_ms))
            .stale_window(Duration::from_millis(settings.stale_reply_ms))
            .capacities(settings.command_capacity, settings.event_capacity)
            .build();

        let slots = Arc::new(SlotTable::new());
        let event_task = tokio::spawn(apply_events(slots.clone(), queue.subscribe_events()));

        Arc::new(Self {
            info: SessionInfo {
                handle,
                port,
                baud_rate,
                timeout_secs,
                opened_at: Utc::now(),
            },
            queue,
            worker: Mutex::new(Some(worker)),
            event_task: Mutex::new(Some(event_task)),
            slots,
            params: Mutex::new(ParameterStore::new()),
            converter: RwLock::new(UnitConverter::new()),
            efs_info: Mutex::new(None),
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn handle(&self) -> SessionHandle {
        self.info.handle
    }

    pub fn serial_number(&self) -> &str {
        self.info.serial_number()
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    /// Health of the link, derived from the outcome of the last exchange
    pub fn error_state(&self) -> ErrorState {
        let metrics = self.queue.metrics();
        if metrics.closed || self.queue.is_closed() {
            return ErrorState::Closed;
        }
        match metrics.last_error {
            None => ErrorState::Ok,
            Some(_) if metrics.last_error_was_timeout => ErrorState::Timeout,
            Some(message) => ErrorState::LinkFault(message),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.queue.subscribe_events()
    }

    /// Send a request and turn a controller error reply into a `DeviceError`
    pub(crate) async fn command(&self, request: Request) -> Result<Frame> {
        let target = request.frame.slot().unwrap_or(0);
        log::debug!("Session {} -> {}", self.info.handle, request.label);
        let frame = self.queue.transact(request).await?;
        if frame.id == MessageId::HW_RICH_RESPONSE {
            let mut reader = PayloadReader::new(frame.payload());
            let failed_id = reader.u16()?;
            let code = reader.u16()?;
            let error = DeviceError::from_device_code(failed_id, code, target);
            log::debug!("Controller rejected 0x{:04X}: {}", failed_id, error);
            return Err(error);
        }
        Ok(frame)
    }

    /// Short slot-addressed request answered by `reply_id`
    pub(crate) async fn query_slot(&self, label: &'static str, slot: SlotId, id: u16, reply_id: u16) -> Result<Frame> {
        self.command(Request::new(label, Frame::short(id, slot.number(), 0), reply_id))
            .await
    }

    /// Stop the worker and event task. The transport is closed by the worker.
    pub(crate) async fn shutdown(&self) {
        self.queue.shutdown().await;

        if let Some(worker) = self.worker.lock().await.take() {
            let abort = worker.abort_handle();
            if tokio::time::timeout(WORKER_STOP_TIMEOUT, worker).await.is_err() {
                log::warn!("Queue worker of session {} did not stop, aborting", self.info.handle);
                abort.abort();
            }
        }
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        log::info!("Session {} ({}) closed", self.info.handle, self.serial_number());
    }
}

async fn apply_events(slots: Arc<SlotTable>, mut events: broadcast::Receiver<DeviceEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Ok(slot) = SlotId::try_from(event.slot) else {
                    log::warn!("Event {:?} for unknown slot {}", event.kind, event.slot);
                    continue;
                };
                slots.apply_event(slot, event.kind).await;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Missed {} device events, slot states may be stale", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
