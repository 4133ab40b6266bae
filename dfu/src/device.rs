use nusb::{self, MaybeFuture};

use crate::{
    error::*,
    identity::{DeviceIdentity, Persona},
    ports::{PortRegistry, SerialPortEntry, ports_for_fragment},
};

/// A bridge as seen on the bus, without opening it.
pub struct BridgeDevice {
    dev: nusb::DeviceInfo,
    identity: Option<DeviceIdentity>,
    ports: Vec<String>,
}

impl BridgeDevice {
    fn from_device_info(dev: nusb::DeviceInfo) -> Self {
        let identity = dev.serial_number().map(|sn| {
            DeviceIdentity::new(dev.vendor_id(), dev.product_id(), sn)
        });
        BridgeDevice {
            dev,
            identity,
            ports: Vec::new(),
        }
    }

    pub fn bus_id(&self) -> &str {
        self.dev.bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.dev.device_address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.dev.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.dev.product_id()
    }

    /// `None` when the host doesn't report a serial number.
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn persona(&self) -> Option<Persona> {
        self.identity.as_ref().map(DeviceIdentity::persona)
    }

    /// Serial ports registered for this unit, under any persona.
    pub fn ports(&self) -> &[String] {
        &self.ports
    }
}

/// Serial ports of the unit with `serial_number`, sorted by path.
pub fn ports_of_device(
    ports: &[SerialPortEntry],
    serial_number: &str,
) -> Vec<String> {
    let Ok(fragment) = crate::identity::serial_fragment(serial_number) else {
        return Vec::new();
    };
    let mut found: Vec<String> = ports_for_fragment(ports, fragment)
        .into_iter()
        .map(|p| p.path.clone())
        .collect();
    found.sort();
    found
}

/// All bridges with the given ids, with their serial ports.
///
/// Read-only: no device is opened. A failing port listing leaves the
/// port lists empty.
pub fn find_bridge_devices<R: PortRegistry>(
    vid: u16,
    pid: u16,
    registry: &R,
) -> DfuResult<Vec<BridgeDevice>> {
    let ports = registry.list().unwrap_or_default();
    let devices = nusb::list_devices()
        .wait()?
        .filter(|dev| dev.vendor_id() == vid && dev.product_id() == pid)
        .map(|info| {
            let mut device = BridgeDevice::from_device_info(info);
            if let Some(identity) = &device.identity {
                device.ports = ports_of_device(&ports, &identity.serial_number);
            }
            device
        })
        .collect();
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::port;

    #[test]
    fn test_ports_of_device() {
        let ports = vec![
            port("/dev/ttyACM1", Some("THINGY91X_AB12")),
            port("/dev/ttyACM0", Some("THINGY91X_AB12")),
            port("/dev/ttyACM4", Some("AB12")),
            port("/dev/ttyACM2", Some("THINGY91X_CD34")),
        ];
        assert_eq!(
            ports_of_device(&ports, "THINGY91X_AB12"),
            vec!["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyACM4"]
        );
        assert!(ports_of_device(&ports, "thingy").is_empty());
    }
}
