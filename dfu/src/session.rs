use std::time::Duration;

use log::debug;
#[cfg(test)]
use mockall::automock;
use nusb::{self, MaybeFuture};

use crate::{
    ChipTarget,
    config::RetryPolicy,
    endpoint::{BulkEndpointPair, resolve_bulk_endpoints},
    error::*,
    identity::DeviceIdentity,
    locator::DeviceLocator,
};

/// Byte pipe to the bridge's vendor interface.
#[cfg_attr(test, automock)]
pub trait BulkTransport {
    fn write(&mut self, data: &[u8]) -> DfuResult<()>;
    fn read(&mut self) -> DfuResult<Vec<u8>>;
}

/// An open device with claimed bulk endpoints.
///
/// At most one session exists per physical device. The USB resources are
/// released by [DfuSession::release] or, at the latest, on drop.
pub struct DfuSession {
    identity: DeviceIdentity,
    chip: ChipTarget,
    endpoints: Option<BulkEndpointPair>,
    device: Option<nusb::Device>,
}

impl DfuSession {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn chip(&self) -> ChipTarget {
        self.chip
    }

    pub fn is_released(&self) -> bool {
        self.device.is_none()
    }

    /// Give the interface back and close the device. Safe to call again.
    pub fn release(&mut self) {
        if self.endpoints.take().is_some() {
            debug!(
                "Released {} bulk endpoints of {}",
                self.chip, self.identity.serial_number
            );
        }
        self.device.take();
    }

    fn endpoints(&mut self) -> DfuResult<&mut BulkEndpointPair> {
        self.endpoints
            .as_mut()
            .ok_or_else(|| DfuError::Protocol("session already released".into()))
    }
}

impl BulkTransport for DfuSession {
    fn write(&mut self, data: &[u8]) -> DfuResult<()> {
        self.endpoints()?.write(data)
    }

    fn read(&mut self) -> DfuResult<Vec<u8>> {
        self.endpoints()?.read()
    }
}

impl Drop for DfuSession {
    fn drop(&mut self) {
        if !self.is_released() {
            self.release();
        }
    }
}

/// Where sessions come from: locate a device, then open it.
pub trait SessionSource {
    type Device;
    type Transport: BulkTransport;

    fn locate(
        &self,
        serial_filter: Option<&str>,
        retry: RetryPolicy,
    ) -> DfuResult<(DeviceIdentity, Self::Device)>;

    fn open(
        &self,
        identity: &DeviceIdentity,
        chip: ChipTarget,
        device: Self::Device,
    ) -> DfuResult<Self::Transport>;
}

/// Sessions over real USB hardware.
pub struct UsbSessionSource {
    locator: Box<dyn DeviceLocator>,
    vendor_id: u16,
    product_id: u16,
    interface_name: String,
    timeout: Duration,
}

impl UsbSessionSource {
    pub fn new(
        locator: Box<dyn DeviceLocator>,
        vendor_id: u16,
        product_id: u16,
        interface_name: &str,
        timeout: Duration,
    ) -> Self {
        UsbSessionSource {
            locator,
            vendor_id,
            product_id,
            interface_name: interface_name.to_string(),
            timeout,
        }
    }
}

impl SessionSource for UsbSessionSource {
    type Device = nusb::DeviceInfo;
    type Transport = DfuSession;

    fn locate(
        &self,
        serial_filter: Option<&str>,
        retry: RetryPolicy,
    ) -> DfuResult<(DeviceIdentity, nusb::DeviceInfo)> {
        let located = retry.run("locate device", || {
            self.locator
                .locate(self.vendor_id, self.product_id, serial_filter)
        })?;
        Ok((located.identity, located.info))
    }

    fn open(
        &self,
        identity: &DeviceIdentity,
        chip: ChipTarget,
        device: nusb::DeviceInfo,
    ) -> DfuResult<DfuSession> {
        let device = device.open().wait()?;
        let endpoints =
            resolve_bulk_endpoints(&device, &self.interface_name, self.timeout)?;
        debug!(
            "Opened session on {identity} (interface {})",
            endpoints.interface_number()
        );
        Ok(DfuSession {
            identity: identity.clone(),
            chip,
            endpoints: Some(endpoints),
            device: Some(device),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_source_follows_script() {
        let source = fake::FakeSource::new(&["THINGY91X_AB12", "AB12"]);
        let (first, ()) = source.locate(None, RetryPolicy::once()).unwrap();
        let (second, ()) = source.locate(None, RetryPolicy::once()).unwrap();
        let (third, ()) = source.locate(None, RetryPolicy::once()).unwrap();
        assert_eq!(first.serial_number, "THINGY91X_AB12");
        assert_eq!(second.serial_number, "AB12");
        assert_eq!(third.serial_number, "AB12");
    }

    #[test]
    fn test_release_twice() {
        let mut session = DfuSession {
            identity: DeviceIdentity::new(0x1915, 0x910a, "THINGY91X_AB12"),
            chip: ChipTarget::Secondary,
            endpoints: None,
            device: None,
        };
        session.release();
        session.release();
        assert!(session.is_released());
        assert_eq!(session.chip(), ChipTarget::Secondary);
        assert!(matches!(
            session.write(&[0x8e]),
            Err(DfuError::Protocol(_))
        ));
        drop(session);
    }
}
