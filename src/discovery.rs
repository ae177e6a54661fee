use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};
use tracing::debug;

pub const DEFAULT_VENDOR: &str = "Arduino";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevices {
    pub ports: Vec<String>,
    pub serial_numbers: Vec<String>,
}

impl DiscoveredDevices {
    pub fn first(&self) -> Option<(&str, &str)> {
        Some((self.ports.first()?.as_str(), self.serial_numbers.first()?.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Finds attached trigger boards.
pub trait DeviceDiscovery {
    fn discover(&self) -> serialport::Result<DiscoveredDevices>;
}

/// Matches USB serial ports by manufacturer string, or by an exact list of
/// serial numbers when one is given.
#[derive(Debug, Clone)]
pub struct SerialPortDiscovery {
    vendor: String,
    allowed_serials: Vec<String>,
}

impl SerialPortDiscovery {
    pub fn new(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            allowed_serials: Vec::new(),
        }
    }

    pub fn with_allowed_serials(mut self, serials: Vec<String>) -> Self {
        self.allowed_serials = serials;
        self
    }

    pub fn filter(&self, ports: &[SerialPortInfo]) -> DiscoveredDevices {
        let mut found = DiscoveredDevices::default();
        for port in ports {
            let SerialPortType::UsbPort(usb) = &port.port_type else {
                continue;
            };
            let serial = usb.serial_number.clone().unwrap_or_default();
            let matched = if self.allowed_serials.is_empty() {
                usb.manufacturer
                    .as_deref()
                    .is_some_and(|manufacturer| manufacturer.contains(&self.vendor))
            } else {
                self.allowed_serials.contains(&serial)
            };

            if matched {
                debug!("found board on {} (serial {})", port.port_name, serial);
                found.ports.push(port.port_name.clone());
                found.serial_numbers.push(serial);
            }
        }
        found
    }
}

impl Default for SerialPortDiscovery {
    fn default() -> Self {
        Self::new(DEFAULT_VENDOR)
    }
}

impl DeviceDiscovery for SerialPortDiscovery {
    fn discover(&self) -> serialport::Result<DiscoveredDevices> {
        Ok(self.filter(&serialport::available_ports()?))
    }
}
