use std::time::Duration;

use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::device::PortDescriptor;
use super::{Connector, PortEnumerator, Result, SerialError, Transport};

// Thorlabs USB identifiers
pub const THORLABS_VID: u16 = 0x1313;
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Serial link to one controller over a virtual COM port.
pub struct SerialInterface {
    port: Option<SerialStream>,
    port_name: String,
}

impl SerialInterface {
    /// Open `port_name` at the given baud rate
    pub fn open(port_name: &str, baud_rate: u32, io_timeout: Duration) -> Result<Self> {
        let port = tokio_serial::new(port_name, baud_rate)
            .timeout(io_timeout)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

        log::info!("Opened serial port {} at {} baud", port_name, baud_rate);
        Ok(Self {
            port: Some(port),
            port_name: port_name.to_string(),
        })
    }

    /// Check if the port is still held
    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn port_mut(&mut self) -> Result<&mut SerialStream> {
        self.port
            .as_mut()
            .ok_or_else(|| SerialError::ConnectionFailed(format!("{} is closed", self.port_name)))
    }
}

#[async_trait::async_trait]
impl Transport for SerialInterface {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(data).await?;
        port.flush().await?;
        Ok(())
    }

    async fn read(&mut self, buffer: &mut [u8], read_timeout: Duration) -> Result<usize> {
        let port = self.port_mut()?;
        match timeout(read_timeout, port.read(buffer)).await {
            Ok(Ok(0)) => Err(SerialError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "serial port returned end of stream",
            ))),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Err(SerialError::Timeout),
            Ok(Err(e)) => Err(SerialError::IoError(e)),
            Err(_) => Err(SerialError::Timeout),
        }
    }

    async fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.shutdown().await {
                log::debug!("Ignoring shutdown error on {}: {}", self.port_name, e);
            }
            log::info!("Closed serial port {}", self.port_name);
        }
    }
}

/// Enumerates the host's serial ports through `serialport`.
#[derive(Debug, Default, Clone)]
pub struct SystemPortEnumerator;

impl PortEnumerator for SystemPortEnumerator {
    fn list(&self) -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        let mut records = Vec::with_capacity(ports.len());

        for port in ports {
            let descriptor = match port.port_type {
                SerialPortType::UsbPort(usb_info) => {
                    if usb_info.vid != THORLABS_VID {
                        log::trace!("Listing non-Thorlabs USB port {}", port.port_name);
                    }
                    PortDescriptor {
                        device_name: port.port_name,
                        serial_number: usb_info.serial_number.unwrap_or_default(),
                        descriptor: usb_info.product.unwrap_or_default(),
                        vendor_name: usb_info.manufacturer.unwrap_or_default(),
                    }
                }
                _ => PortDescriptor {
                    device_name: port.port_name,
                    serial_number: String::new(),
                    descriptor: String::new(),
                    vendor_name: String::new(),
                },
            };
            records.push(descriptor.to_record());
        }

        Ok(records)
    }
}

/// Opens `SerialInterface` transports.
#[derive(Debug, Default, Clone)]
pub struct SerialConnector;

#[async_trait::async_trait]
impl Connector for SerialConnector {
    async fn connect(
        &self,
        port: &PortDescriptor,
        baud_rate: u32,
        io_timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        let interface = SerialInterface::open(&port.device_name, baud_rate, io_timeout)?;
        Ok(Box::new(interface))
    }
}
