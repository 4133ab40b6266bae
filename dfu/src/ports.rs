//! Host serial-port registry.

use std::time::Duration;

use log::debug;
#[cfg(test)]
use mockall::automock;
use serialport::{SerialPortType, available_ports};

use crate::error::*;
use crate::identity::matches_fragment;

/// A USB serial port as the OS reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialPortEntry {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl SerialPortEntry {
    pub fn serial_matches(&self, fragment: &str) -> bool {
        self.serial_number
            .as_deref()
            .is_some_and(|sn| matches_fragment(sn, fragment))
    }
}

/// Access to the OS list of serial ports.
#[cfg_attr(test, automock)]
pub trait PortRegistry {
    /// All USB serial ports currently registered.
    fn list(&self) -> DfuResult<Vec<SerialPortEntry>>;

    /// Open and immediately close `path`. Fails with [DfuError::PortBusy]
    /// when another process holds the port.
    fn probe(&self, path: &str, baud_rate: u32, timeout: Duration) -> DfuResult<()>;
}

#[derive(Default)]
pub struct SystemPortRegistry;

impl PortRegistry for SystemPortRegistry {
    fn list(&self) -> DfuResult<Vec<SerialPortEntry>> {
        let ports = available_ports()?
            .into_iter()
            .filter_map(|port| {
                // each device shows up as both cu.* and tty.*
                #[cfg(target_os = "macos")]
                if port.port_name.contains("/dev/tty.") {
                    return None;
                }
                match port.port_type {
                    SerialPortType::UsbPort(usb) => Some(SerialPortEntry {
                        path: port.port_name,
                        vendor_id: usb.vid,
                        product_id: usb.pid,
                        serial_number: usb.serial_number,
                    }),
                    _ => None,
                }
            })
            .collect();
        Ok(ports)
    }

    fn probe(&self, path: &str, baud_rate: u32, timeout: Duration) -> DfuResult<()> {
        serialport::new(path, baud_rate)
            .timeout(timeout)
            .open()
            .map(|_| debug!("Serial port {path} opened successfully"))
            .map_err(|e| DfuError::PortBusy {
                port: path.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Ports whose serial number is exactly `serial_number`, sorted by path.
pub fn ports_with_serial(
    ports: &[SerialPortEntry],
    serial_number: &str,
) -> Vec<String> {
    let mut found: Vec<String> = ports
        .iter()
        .filter(|p| p.serial_number.as_deref() == Some(serial_number))
        .map(|p| p.path.clone())
        .collect();
    found.sort();
    found
}

/// Ports belonging to the unit identified by `fragment`, under any persona.
pub fn ports_for_fragment<'a>(
    ports: &'a [SerialPortEntry],
    fragment: &str,
) -> Vec<&'a SerialPortEntry> {
    ports.iter().filter(|p| p.serial_matches(fragment)).collect()
}

#[cfg(test)]
pub(crate) fn port(path: &str, serial: Option<&str>) -> SerialPortEntry {
    SerialPortEntry {
        path: path.to_string(),
        vendor_id: crate::config::DEFAULT_VENDOR_ID,
        product_id: crate::config::DEFAULT_PRODUCT_ID,
        serial_number: serial.map(String::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_with_serial_sorted() {
        let ports = vec![
            port("/dev/ttyACM3", Some("THINGY91X_AB12")),
            port("/dev/ttyACM0", Some("THINGY91X_CD34")),
            port("/dev/ttyACM2", Some("THINGY91X_AB12")),
            port("/dev/ttyS0", None),
        ];
        assert_eq!(
            ports_with_serial(&ports, "THINGY91X_AB12"),
            vec!["/dev/ttyACM2".to_string(), "/dev/ttyACM3".to_string()]
        );
        assert!(ports_with_serial(&ports, "AB12").is_empty());
    }

    #[test]
    fn test_ports_for_fragment_spans_personas() {
        let ports = vec![
            port("/dev/ttyACM0", Some("THINGY91X_AB12")),
            port("/dev/ttyACM1", Some("AB12")),
            port("/dev/ttyACM2", Some("THINGY91X_CD34")),
        ];
        let found: Vec<&str> = ports_for_fragment(&ports, "AB12")
            .into_iter()
            .map(|p| p.path.as_str())
            .collect();
        assert_eq!(found, vec!["/dev/ttyACM0", "/dev/ttyACM1"]);
    }
}
