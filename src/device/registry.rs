use std::sync::Arc;

use crate::serial::PortEnumerator;
use super::{DeviceError, PortDescriptor, Result};

/// Snapshot view over the host's serial ports
#[derive(Clone)]
pub struct PortRegistry {
    enumerator: Arc<dyn PortEnumerator>,
}

impl PortRegistry {
    pub fn new(enumerator: Arc<dyn PortEnumerator>) -> Self {
        Self { enumerator }
    }

    /// List every port visible right now.
    ///
    /// Nothing is cached, two calls may disagree if a device was plugged in
    /// between them. Unparseable records are skipped.
    pub fn enumerate(&self) -> Result<Vec<PortDescriptor>> {
        let records = self
            .enumerator
            .list()
            .map_err(|e| DeviceError::EnumerationError(e.to_string()))?;

        let ports: Vec<PortDescriptor> = records
            .iter()
            .filter_map(|record| {
                let parsed = PortDescriptor::parse_record(record);
                if parsed.is_none() {
                    log::warn!("Skipping malformed port record {:?}", record);
                }
                parsed
            })
            .collect();

        log::debug!("Enumerated {} serial ports", ports.len());
        Ok(ports)
    }

    /// Find the port whose serial number matches exactly
    pub fn find(&self, serial_number: &str) -> Result<PortDescriptor> {
        self.enumerate()?
            .into_iter()
            .find(|port| !port.serial_number.is_empty() && port.serial_number == serial_number)
            .ok_or_else(|| DeviceError::DeviceNotFound(serial_number.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{Result as SerialResult, SerialError};

    struct FixedPorts(Vec<&'static str>);

    impl PortEnumerator for FixedPorts {
        fn list(&self) -> SerialResult<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    struct BrokenEnumerator;

    impl PortEnumerator for BrokenEnumerator {
        fn list(&self) -> SerialResult<Vec<String>> {
            Err(SerialError::PortNotFound("no driver".to_string()))
        }
    }

    #[test]
    fn test_enumerate_skips_malformed() {
        let registry = PortRegistry::new(Arc::new(FixedPorts(vec![
            "COM1,SN1,MCM301,Thorlabs",
            "",
            "COM2,SN2,MCM301,Thorlabs",
        ])));
        let ports = registry.enumerate().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(registry.find("SN2").unwrap().device_name, "COM2");
        assert!(matches!(registry.find("SN9"), Err(DeviceError::DeviceNotFound(_))));
    }

    #[test]
    fn test_enumeration_failure() {
        let registry = PortRegistry::new(Arc::new(BrokenEnumerator));
        assert!(matches!(registry.enumerate(), Err(DeviceError::EnumerationError(_))));
    }
}
