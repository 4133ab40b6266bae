use log::{error, info, warn};
use nonempty::NonEmpty;
use nusb::{self, MaybeFuture};

use crate::{
    error::*,
    identity::DeviceIdentity,
    ports::{PortRegistry, SystemPortRegistry},
};

/// A USB device matching the requested ids, with its serial number.
pub struct LocatedDevice {
    pub identity: DeviceIdentity,
    pub info: nusb::DeviceInfo,
}

/// Finds exactly one bridge among the attached USB devices.
///
/// Implementations differ in where the serial number comes from; pick one
/// with [platform_locator].
pub trait DeviceLocator {
    fn locate(
        &self,
        vendor_id: u16,
        product_id: u16,
        serial_filter: Option<&str>,
    ) -> DfuResult<LocatedDevice>;
}

/// Reads the serial number from the USB device descriptor.
#[derive(Default)]
pub struct UsbLocator;

/// Recovers the serial number from the serial-port registry, for hosts
/// where the USB layer does not report it reliably.
pub struct PortRegistryLocator<R: PortRegistry> {
    registry: R,
}

pub struct Candidate<T> {
    pub serial_number: Option<String>,
    pub handle: T,
}

pub fn platform_locator() -> Box<dyn DeviceLocator> {
    if cfg!(windows) {
        Box::new(PortRegistryLocator::new(SystemPortRegistry))
    } else {
        Box::new(UsbLocator)
    }
}

fn list_usb_devices(
    vendor_id: u16,
    product_id: u16,
) -> DfuResult<Vec<nusb::DeviceInfo>> {
    Ok(nusb::list_devices()
        .wait()?
        .filter(|dev| {
            dev.vendor_id() == vendor_id && dev.product_id() == product_id
        })
        .collect())
}

impl DeviceLocator for UsbLocator {
    fn locate(
        &self,
        vendor_id: u16,
        product_id: u16,
        serial_filter: Option<&str>,
    ) -> DfuResult<LocatedDevice> {
        let candidates = list_usb_devices(vendor_id, product_id)?
            .into_iter()
            .map(|info| Candidate {
                serial_number: info.serial_number().map(String::from),
                handle: info,
            })
            .collect();

        let (serial_number, info) = select_device(candidates, serial_filter)?;
        Ok(LocatedDevice {
            identity: DeviceIdentity::new(vendor_id, product_id, &serial_number),
            info,
        })
    }
}

impl<R: PortRegistry> PortRegistryLocator<R> {
    pub fn new(registry: R) -> Self {
        PortRegistryLocator { registry }
    }

    fn registry_serials(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> DfuResult<Vec<String>> {
        let mut serials: Vec<String> = self
            .registry
            .list()?
            .into_iter()
            .filter(|p| p.vendor_id == vendor_id && p.product_id == product_id)
            .filter_map(|p| p.serial_number)
            .collect();
        serials.sort();
        serials.dedup();
        Ok(serials)
    }
}

impl<R: PortRegistry> DeviceLocator for PortRegistryLocator<R> {
    fn locate(
        &self,
        vendor_id: u16,
        product_id: u16,
        serial_filter: Option<&str>,
    ) -> DfuResult<LocatedDevice> {
        let candidates = self
            .registry_serials(vendor_id, product_id)?
            .into_iter()
            .map(|sn| Candidate {
                serial_number: Some(sn),
                handle: (),
            })
            .collect();
        let (serial_number, ()) = select_device(candidates, serial_filter)?;

        let devices = list_usb_devices(vendor_id, product_id)?;
        let info = pair_usb_device(devices, &serial_number, |d| d.serial_number())
            .ok_or_else(|| {
                DfuError::NotFound(format!("USB device for {serial_number}"))
            })?;

        Ok(LocatedDevice {
            identity: DeviceIdentity::new(vendor_id, product_id, &serial_number),
            info,
        })
    }
}

/// Pick the USB device behind a serial number found in the port registry.
/// A lone device is taken as is, since its own serial may be unreadable.
pub(crate) fn pair_usb_device<T>(
    devices: Vec<T>,
    serial_number: &str,
    serial_of: impl Fn(&T) -> Option<&str>,
) -> Option<T> {
    if devices.len() == 1 {
        devices.into_iter().next()
    } else {
        devices
            .into_iter()
            .find(|d| serial_of(d) == Some(serial_number))
    }
}

/// Resolve the candidates of one enumeration to exactly one device.
///
/// With a filter the serial number must match exactly. Without one, a
/// single candidate wins; several are [DfuError::Ambiguous] and never
/// resolved by picking one.
pub fn select_device<T>(
    candidates: Vec<Candidate<T>>,
    serial_filter: Option<&str>,
) -> DfuResult<(String, T)> {
    let serials: Vec<String> = candidates
        .iter()
        .map(|c| c.serial_number.clone().unwrap_or_else(|| "<none>".into()))
        .collect();

    if let Some(filter) = serial_filter {
        return match candidates
            .into_iter()
            .find(|c| c.serial_number.as_deref() == Some(filter))
        {
            Some(c) => {
                info!("Device with serial number {filter} found");
                Ok((filter.to_string(), c.handle))
            }
            None => {
                error!("Device with serial number {filter} not found");
                error!("{} available devices:", serials.len());
                for sn in &serials {
                    error!("Serial Number: {sn}");
                }
                Err(DfuError::NotFound(format!(
                    "device with serial number {filter}"
                )))
            }
        };
    }

    let Some(candidates) = NonEmpty::from_vec(candidates) else {
        error!("No devices found.");
        return Err(DfuError::NotFound("device".into()));
    };

    if !candidates.tail.is_empty() {
        info!("Multiple devices found.");
        for sn in &serials {
            info!("Serial Number: {sn}");
        }
        warn!("Please specify the serial number with the --serial option.");
        return Err(DfuError::Ambiguous { serials });
    }

    let only = candidates.head;
    match only.serial_number {
        Some(sn) => Ok((sn, only.handle)),
        None => Err(DfuError::NotFound("serial number of the device".into())),
    }
}
