use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::config::DriverSettings;
use crate::serial::{Connector, PortEnumerator, SerialConnector, SystemPortEnumerator};
use super::{DeviceError, ErrorState, PortDescriptor, PortRegistry, Result, Session, SessionHandle, SessionInfo};

/// Owns every open session.
///
/// Handles are indices into an arena; a freed index is handed out again by
/// the next `open`. A caller still holding the `Arc<Session>` of a closed
/// session only gets `QueueClosed` transport errors from it.
pub struct SessionManager {
    registry: PortRegistry,
    connector: Arc<dyn Connector>,
    settings: DriverSettings,
    sessions: RwLock<Vec<Option<Arc<Session>>>>,
    // Serialises open so two callers cannot connect the same serial twice
    open_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(enumerator: Arc<dyn PortEnumerator>, connector: Arc<dyn Connector>) -> Self {
        Self::with_settings(enumerator, connector, DriverSettings::default())
    }

    pub fn with_settings(
        enumerator: Arc<dyn PortEnumerator>,
        connector: Arc<dyn Connector>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            registry: PortRegistry::new(enumerator),
            connector,
            settings,
            sessions: RwLock::new(Vec::new()),
            open_lock: Mutex::new(()),
        }
    }

    /// Manager over the host's real serial ports
    pub fn system(settings: DriverSettings) -> Self {
        Self::with_settings(Arc::new(SystemPortEnumerator), Arc::new(SerialConnector), settings)
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn list_ports(&self) -> Result<Vec<PortDescriptor>> {
        self.registry.enumerate()
    }

    /// Open the controller with `serial_number`, or return its existing handle.
    ///
    /// A timeout of 0 seconds is raised to 1.
    pub async fn open(&self, serial_number: &str, baud_rate: u32, timeout_secs: u32) -> Result<SessionHandle> {
        let _open = self.open_lock.lock().await;

        if let Some(handle) = self.find_open(serial_number).await {
            log::debug!("{} already open as session {}", serial_number, handle);
            return Ok(handle);
        }
        if baud_rate == 0 {
            return Err(DeviceError::OutOfRange("baud rate must be positive".to_string()));
        }
        let timeout_secs = timeout_secs.max(1);

        let port = self.registry.find(serial_number)?;
        log::info!(
            "Opening {} on {} at {} baud, {}s timeout",
            serial_number,
            port.device_name,
            baud_rate,
            timeout_secs
        );
        let transport = self
            .connector
            .connect(&port, baud_rate, Duration::from_secs(timeout_secs as u64))
            .await?;

        let mut sessions = self.sessions.write().await;
        let index = match sessions.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                sessions.push(None);
                sessions.len() - 1
            }
        };
        let handle = SessionHandle(index as u32);
        let session = Session::start(handle, port, transport, baud_rate, timeout_secs, &self.settings);
        sessions[index] = Some(session);

        log::info!("Session {} opened for {}", handle, serial_number);
        Ok(handle)
    }

    /// Open with the configured default baud rate and timeout
    pub async fn open_default(&self, serial_number: &str) -> Result<SessionHandle> {
        self.open(serial_number, self.settings.default_baud_rate, self.settings.default_timeout_secs)
            .await
    }

    pub async fn is_open(&self, serial_number: &str) -> bool {
        self.find_open(serial_number).await.is_some()
    }

    pub async fn get_handle(&self, serial_number: &str) -> Result<SessionHandle> {
        self.find_open(serial_number)
            .await
            .ok_or_else(|| DeviceError::DeviceNotFound(serial_number.to_string()))
    }

    pub async fn session(&self, handle: SessionHandle) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(handle.index())
            .and_then(|slot| slot.clone())
            .ok_or(DeviceError::InvalidHandle(handle))
    }

    /// Close a session and free its handle
    pub async fn close(&self, handle: SessionHandle) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .get_mut(handle.index())
                .and_then(Option::take)
                .ok_or(DeviceError::InvalidHandle(handle))?
        };
        session.shutdown().await;
        Ok(())
    }

    pub async fn close_all(&self) {
        let open: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.iter_mut().filter_map(Option::take).collect()
        };
        for session in open {
            session.shutdown().await;
        }
    }

    /// Link health of a session, read without side effects
    pub async fn get_error_state(&self, handle: SessionHandle) -> Result<ErrorState> {
        Ok(self.session(handle).await?.error_state())
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .iter()
            .flatten()
            .map(|session| session.info().clone())
            .collect()
    }

    async fn find_open(&self, serial_number: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .iter()
            .flatten()
            .find(|session| session.serial_number() == serial_number)
            .map(|session| session.handle())
    }
}
