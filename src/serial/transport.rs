use std::time::Duration;

use crate::device::PortDescriptor;
use super::Result;

/// Byte-stream link to one controller.
///
/// `read` waits at most `timeout` for the first byte and returns
/// `SerialError::Timeout` when nothing arrived.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    async fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize>;

    async fn close(&mut self);
}

/// Lists the raw `device_name,serial_number,descriptor,vendor_name` records
/// of every visible port.
pub trait PortEnumerator: Send + Sync {
    fn list(&self) -> Result<Vec<String>>;
}

/// Opens a transport for an enumerated port.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        port: &PortDescriptor,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>>;
}
