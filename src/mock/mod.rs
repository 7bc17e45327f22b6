//! Simulated controllers behind the transport traits, for tests and demos.
//!
//! ```no_run
//! # async fn demo() -> mcm_host_lib::device::Result<()> {
//! use mcm_host_lib::mock::MockBench;
//!
//! let bench = MockBench::new(&["SN123"]);
//! let manager = bench.manager();
//! let handle = manager.open("SN123", 9600, 5).await?;
//! let session = manager.session(handle).await?;
//! session.set_enable(4, true).await?;
//! # Ok(())
//! # }
//! ```
pub mod controller;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::DriverSettings;
use crate::device::{PortDescriptor, SessionManager};
use crate::serial::frame::{Frame, FrameDecoder};
use crate::serial::{Connector, PortEnumerator, Result, SerialError, Transport};

pub use controller::SimulatedController;

pub type SharedController = Arc<Mutex<SimulatedController>>;

/// Lock a shared controller, recovering from a panicked holder
pub fn lock(controller: &SharedController) -> MutexGuard<'_, SimulatedController> {
    controller.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn link_down() -> SerialError {
    SerialError::IoError(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "simulated link down"))
}

/// Byte-level transport into a `SimulatedController`
pub struct MockTransport {
    controller: SharedController,
    decoder: FrameDecoder,
    pending: VecDeque<u8>,
    /// Replies held back by `SimulatedController::delay_next_reply`
    delayed: Vec<(Instant, Vec<u8>)>,
    closed: bool,
}

impl MockTransport {
    pub fn new(controller: SharedController) -> Self {
        lock(&controller).link_opened();
        Self {
            controller,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            delayed: Vec::new(),
            closed: false,
        }
    }
}

impl MockTransport {
    fn release_delayed(&mut self) {
        let now = Instant::now();
        let (ready, waiting): (Vec<_>, Vec<_>) = self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = waiting;
        for (_, bytes) in ready {
            self.pending.extend(bytes);
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(SerialError::ConnectionFailed("mock transport closed".to_string()));
        }
        let mut controller = lock(&self.controller);
        if controller.is_link_down() {
            return Err(link_down());
        }
        self.decoder.extend(data);
        while let Some(frame) = self.decoder.next_frame()? {
            let bytes: Vec<u8> = controller.handle(&frame).iter().flat_map(Frame::to_bytes).collect();
            match controller.take_reply_delay() {
                Some(delay) => self.delayed.push((Instant::now() + delay, bytes)),
                None => self.pending.extend(bytes),
            }
        }
        Ok(())
    }

    async fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        let down = lock(&self.controller).is_link_down();
        if down {
            return Err(link_down());
        }
        self.release_delayed();
        if self.pending.is_empty() {
            let deadline = Instant::now() + timeout;
            match self.delayed.iter().map(|(ready, _)| *ready).min() {
                Some(ready) if ready <= deadline => tokio::time::sleep_until(ready).await,
                _ => {
                    tokio::time::sleep(timeout).await;
                    return Err(SerialError::Timeout);
                }
            }
            self.release_delayed();
        }
        let n = buffer.len().min(self.pending.len());
        for (slot, byte) in buffer.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            lock(&self.controller).link_closed();
        }
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        if !self.closed {
            lock(&self.controller).link_closed();
        }
    }
}

/// Connects to simulated controllers by serial number
#[derive(Default)]
pub struct MockConnector {
    controllers: Mutex<BTreeMap<String, SharedController>>,
}

impl MockConnector {
    pub fn add(&self, controller: SharedController) {
        let serial = lock(&controller).serial_number().to_string();
        self.controllers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(serial, controller);
    }

    fn get(&self, serial_number: &str) -> Option<SharedController> {
        self.controllers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(serial_number)
            .cloned()
    }

    fn serial_numbers(&self) -> Vec<String> {
        self.controllers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        port: &PortDescriptor,
        _baud_rate: u32,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        let controller = self
            .get(&port.serial_number)
            .ok_or_else(|| SerialError::PortNotFound(port.device_name.clone()))?;
        if lock(&controller).refuses_connections() {
            return Err(SerialError::ConnectionFailed(format!("{} refused the connection", port.device_name)));
        }
        Ok(Box::new(MockTransport::new(controller)))
    }
}

/// Lists one port per simulated controller plus any extra raw records
pub struct MockEnumerator {
    connector: Arc<MockConnector>,
    extra: Mutex<Vec<String>>,
    failing: Mutex<bool>,
}

impl MockEnumerator {
    pub fn new(connector: Arc<MockConnector>) -> Self {
        Self {
            connector,
            extra: Mutex::new(Vec::new()),
            failing: Mutex::new(false),
        }
    }

    /// Append a raw record, e.g. a malformed one
    pub fn add_record(&self, record: &str) {
        self.extra
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = failing;
    }
}

impl PortEnumerator for MockEnumerator {
    fn list(&self) -> Result<Vec<String>> {
        if *self.failing.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            return Err(SerialError::PortNotFound("simulated enumeration failure".to_string()));
        }
        let mut records: Vec<String> = self
            .connector
            .serial_numbers()
            .iter()
            .enumerate()
            .map(|(i, serial)| format!("/dev/ttyMCM{},{},MCM301,Thorlabs", i, serial))
            .collect();
        records.extend(self.extra.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).iter().cloned());
        Ok(records)
    }
}

/// A set of simulated controllers wired to an enumerator and connector
pub struct MockBench {
    controllers: Vec<SharedController>,
    connector: Arc<MockConnector>,
    enumerator: Arc<MockEnumerator>,
}

impl MockBench {
    pub fn new(serial_numbers: &[&str]) -> Self {
        let connector = Arc::new(MockConnector::default());
        let controllers: Vec<SharedController> = serial_numbers
            .iter()
            .map(|serial| Arc::new(Mutex::new(SimulatedController::new(serial))))
            .collect();
        for controller in &controllers {
            connector.add(controller.clone());
        }
        let enumerator = Arc::new(MockEnumerator::new(connector.clone()));
        Self {
            controllers,
            connector,
            enumerator,
        }
    }

    pub fn controller(&self, serial_number: &str) -> Option<SharedController> {
        self.controllers
            .iter()
            .find(|c| lock(c).serial_number() == serial_number)
            .cloned()
    }

    pub fn enumerator(&self) -> Arc<MockEnumerator> {
        self.enumerator.clone()
    }

    pub fn manager(&self) -> SessionManager {
        SessionManager::new(self.enumerator.clone(), self.connector.clone())
    }

    pub fn manager_with(&self, settings: DriverSettings) -> SessionManager {
        SessionManager::with_settings(self.enumerator.clone(), self.connector.clone(), settings)
    }
}
