//! Single consumer of a session's request queue.
//!
//! The worker owns the transport. Requests run strictly one at a time in
//! submission order; frames the controller sends on its own are broadcast as
//! `DeviceEvent`s whenever they show up, during a request or while idle.
//! Replies carry no sequence number, so after a timeout the worker drops
//! whatever arrives within the stale window before taking the next request.
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::serial::frame::{Frame, FrameDecoder};
use crate::serial::{Result, SerialError, Transport};
use super::types::*;

const READ_CHUNK: usize = 512;

#[derive(Clone)]
pub struct QueueHandle {
    cmd_tx: mpsc::Sender<QueueCommand>,
    events_tx: broadcast::Sender<DeviceEvent>,
    metrics_rx: watch::Receiver<QueueMetrics>,
}

impl QueueHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events_tx.subscribe()
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.metrics_rx.borrow().clone()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<QueueMetrics> {
        self.metrics_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed() || self.metrics_rx.borrow().closed
    }

    /// Queue a request and wait for the frame that answers it
    pub async fn transact(&self, request: Request) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(QueueCommand::Transact { request, responder: tx })
            .await
            .map_err(|_| SerialError::QueueClosed)?;
        rx.await.map_err(|_| SerialError::QueueClosed)?
    }

    /// Ask the worker to close the transport and exit
    pub async fn shutdown(&self) {
        if self.cmd_tx.send(QueueCommand::Shutdown).await.is_err() {
            log::debug!("Queue worker already stopped");
        }
    }
}

pub struct QueueBuilder {
    transport: Box<dyn Transport>,
    command_timeout: Duration,
    idle_read: Duration,
    stale_window: Duration,
    command_capacity: usize,
    event_capacity: usize,
}

impl QueueBuilder {
    pub fn new(transport: Box<dyn Transport>, command_timeout: Duration) -> Self {
        Self {
            transport,
            command_timeout,
            idle_read: Duration::from_millis(10),
            stale_window: Duration::from_millis(250),
            command_capacity: 64,
            event_capacity: 256,
        }
    }

    /// How long the idle worker waits for a request before draining input
    pub fn idle_read(mut self, idle_read: Duration) -> Self {
        self.idle_read = idle_read;
        self
    }

    /// How long input is discarded after a request times out
    pub fn stale_window(mut self, stale_window: Duration) -> Self {
        self.stale_window = stale_window;
        self
    }

    pub fn capacities(mut self, command_capacity: usize, event_capacity: usize) -> Self {
        self.command_capacity = command_capacity.max(1);
        self.event_capacity = event_capacity.max(1);
        self
    }

    /// Spawn the worker; must be called inside a tokio runtime
    pub fn build(self) -> (QueueHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(self.command_capacity);
        let (events_tx, _events_rx) = broadcast::channel(self.event_capacity);
        let (metrics_tx, metrics_rx) = watch::channel(QueueMetrics::default());

        let worker = QueueWorker {
            transport: self.transport,
            decoder: FrameDecoder::new(),
            events_tx: events_tx.clone(),
            metrics_tx,
            metrics: QueueMetrics::default(),
            command_timeout: self.command_timeout,
            stale_window: self.stale_window,
        };
        let task = tokio::spawn(worker.run(cmd_rx, self.idle_read));

        (QueueHandle { cmd_tx, events_tx, metrics_rx }, task)
    }
}

struct QueueWorker {
    transport: Box<dyn Transport>,
    decoder: FrameDecoder,
    events_tx: broadcast::Sender<DeviceEvent>,
    metrics_tx: watch::Sender<QueueMetrics>,
    metrics: QueueMetrics,
    command_timeout: Duration,
    stale_window: Duration,
}

impl QueueWorker {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<QueueCommand>, idle_read: Duration) {
        loop {
            match timeout(idle_read, cmd_rx.recv()).await {
                Ok(Some(QueueCommand::Transact { request, responder })) => {
                    let started = Instant::now();
                    let outcome = self.exchange(&request).await;
                    self.record(&request, &outcome, started);
                    let timed_out = matches!(outcome, Err(SerialError::Timeout));
                    if responder.send(outcome).is_err() {
                        log::debug!("Caller of '{}' went away before the reply", request.label);
                    }
                    if timed_out {
                        self.discard_late_replies(&request).await;
                    }
                }
                Ok(Some(QueueCommand::Shutdown)) | Ok(None) => break,
                Err(_) => self.drain_unsolicited().await,
            }
        }

        self.transport.close().await;
        self.metrics.closed = true;
        self.publish();
        cmd_rx.close();
        // Fail everything that was queued behind the shutdown
        while let Ok(command) = cmd_rx.try_recv() {
            if let QueueCommand::Transact { responder, .. } = command {
                let _ = responder.send(Err(SerialError::QueueClosed));
            }
        }
    }

    async fn exchange(&mut self, request: &Request) -> Result<Frame> {
        let bytes = request.frame.to_bytes();
        log::trace!("tx {} {}", request.label, hex::encode(&bytes));
        self.transport.write_all(&bytes).await?;

        let deadline = Instant::now() + self.command_timeout;
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            while let Some(frame) = self.decoder.next_frame()? {
                if self.dispatch_event(&frame) {
                    continue;
                }
                if request.is_answered_by(&frame) {
                    return Ok(frame);
                }
                self.metrics.unexpected_frames += 1;
                log::warn!(
                    "Discarding frame 0x{:04X} while waiting for '{}'",
                    frame.id,
                    request.label
                );
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SerialError::Timeout);
            }
            let n = self.transport.read(&mut buffer, remaining).await?;
            log::trace!("rx {}", hex::encode(&buffer[..n]));
            self.decoder.extend(&buffer[..n]);
        }
    }

    /// Drop replies to a timed out request so the next one cannot take them.
    /// Events are still dispatched.
    async fn discard_late_replies(&mut self, request: &Request) {
        let deadline = Instant::now() + self.stale_window;
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            loop {
                match self.decoder.next_frame() {
                    Ok(Some(frame)) => {
                        if self.dispatch_event(&frame) {
                            continue;
                        }
                        self.metrics.stale_replies += 1;
                        log::debug!("Dropped late frame 0x{:04X} after '{}' timed out", frame.id, request.label);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Dropped corrupt input: {}", e);
                        self.decoder.clear();
                        break;
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.transport.read(&mut buffer, remaining).await {
                Ok(n) => {
                    log::trace!("rx late {}", hex::encode(&buffer[..n]));
                    self.decoder.extend(&buffer[..n]);
                }
                Err(SerialError::Timeout) => break,
                Err(e) => {
                    log::debug!("Link error while discarding late replies: {}", e);
                    break;
                }
            }
        }
        self.publish();
    }

    /// Pick up frames that arrived between requests
    async fn drain_unsolicited(&mut self) {
        let mut buffer = [0u8; READ_CHUNK];
        match self.transport.read(&mut buffer, Duration::from_millis(1)).await {
            Ok(n) => {
                log::trace!("rx idle {}", hex::encode(&buffer[..n]));
                self.decoder.extend(&buffer[..n]);
            }
            Err(SerialError::Timeout) => {}
            Err(e) => {
                let msg = e.to_string();
                if self.metrics.last_error.as_deref() != Some(msg.as_str()) {
                    log::warn!("Link error while idle: {}", msg);
                    self.metrics.link_errors += 1;
                    self.metrics.last_error = Some(msg);
                    self.metrics.last_error_was_timeout = false;
                    self.publish();
                }
                return;
            }
        }

        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    if !self.dispatch_event(&frame) {
                        self.metrics.unexpected_frames += 1;
                        log::warn!("Discarding unsolicited frame 0x{:04X}", frame.id);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Dropped corrupt input: {}", e);
                    break;
                }
            }
        }
    }

    fn dispatch_event(&mut self, frame: &Frame) -> bool {
        match DeviceEvent::from_frame(frame) {
            Some(event) => {
                log::debug!("Device event {:?} on slot {}", event.kind, event.slot);
                self.metrics.events_received += 1;
                // No subscribers is fine, the session may be closing
                let _ = self.events_tx.send(event);
                true
            }
            None => false,
        }
    }

    fn record(&mut self, request: &Request, outcome: &Result<Frame>, started: Instant) {
        match outcome {
            Ok(_) => {
                self.metrics.requests_completed += 1;
                self.metrics.last_latency_ms = Some(started.elapsed().as_millis() as u64);
                self.metrics.last_error = None;
                self.metrics.last_error_was_timeout = false;
            }
            Err(SerialError::Timeout) => {
                log::warn!("Command '{}' timed out after {:?}", request.label, self.command_timeout);
                self.metrics.request_timeouts += 1;
                self.metrics.last_error = Some(format!("'{}' timed out", request.label));
                self.metrics.last_error_was_timeout = true;
            }
            Err(e) => {
                log::warn!("Command '{}' failed: {}", request.label, e);
                self.metrics.link_errors += 1;
                self.metrics.last_error = Some(e.to_string());
                self.metrics.last_error_was_timeout = false;
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.metrics_tx.send_replace(self.metrics.clone());
    }
}
