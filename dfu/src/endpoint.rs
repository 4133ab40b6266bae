use std::{num::NonZeroU8, time::Duration};

use log::debug;
use nusb::{
    self, MaybeFuture,
    descriptors::TransferType,
    transfer::{Buffer, Bulk, In, Out},
};

use crate::error::*;

const ENDPOINT_DIR_IN: u8 = 0x80;

/// Bulk OUT/IN endpoints of the bridge's vendor interface.
///
/// Owns the claimed interface; dropping the pair releases the claim and
/// hands the interface back to the kernel driver.
pub struct BulkEndpointPair {
    out_ep: nusb::Endpoint<Bulk, Out>,
    in_ep: nusb::Endpoint<Bulk, In>,
    interface: nusb::Interface,
    timeout: Duration,
}

/// Interface number and endpoint addresses of a matching interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BulkLayout {
    pub interface: u8,
    pub out_addr: u8,
    pub in_addr: u8,
}

impl BulkEndpointPair {
    pub fn interface_number(&self) -> u8 {
        self.interface.interface_number()
    }

    pub fn write(&mut self, data: &[u8]) -> DfuResult<()> {
        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);
        debug!("bulk OUT: {data:02x?}");
        let completion = self.out_ep.transfer_blocking(buf, self.timeout);
        completion.status?;
        Ok(())
    }

    /// Read one packet (up to the endpoint's max packet size).
    pub fn read(&mut self) -> DfuResult<Vec<u8>> {
        let buf = Buffer::new(self.in_ep.max_packet_size());
        let completion = self.in_ep.transfer_blocking(buf, self.timeout);
        completion.status?;
        let mut data = completion.buffer.into_vec();
        data.truncate(completion.actual_len);
        debug!("bulk IN: {data:02x?}");
        Ok(data)
    }
}

/// Find the interface named `interface_name`, detach any kernel driver
/// bound to it and open its bulk endpoints.
pub fn resolve_bulk_endpoints(
    device: &nusb::Device,
    interface_name: &str,
    timeout: Duration,
) -> DfuResult<BulkEndpointPair> {
    let layout = find_bulk_layout(device, interface_name, timeout)?;
    debug!(
        "bulk interface {} (OUT 0x{:02x}, IN 0x{:02x})",
        layout.interface, layout.out_addr, layout.in_addr
    );

    // a driver that isn't attached is fine
    let interface = device.detach_and_claim_interface(layout.interface).wait()?;
    let out_ep = interface.endpoint::<Bulk, Out>(layout.out_addr)?;
    let in_ep = interface.endpoint::<Bulk, In>(layout.in_addr)?;

    Ok(BulkEndpointPair {
        out_ep,
        in_ep,
        interface,
        timeout,
    })
}

fn find_bulk_layout(
    device: &nusb::Device,
    interface_name: &str,
    timeout: Duration,
) -> DfuResult<BulkLayout> {
    let mut named = false;
    for configuration in device.configurations() {
        for alt_setting in configuration.interface_alt_settings() {
            let Some(index) = alt_setting.string_index() else {
                continue;
            };
            if get_string_descriptor(device, index, timeout).as_deref()
                != Some(interface_name)
            {
                continue;
            }
            named = true;
            let endpoints: Vec<(u8, bool)> = alt_setting
                .endpoints()
                .map(|ep| (ep.address(), ep.transfer_type() == TransferType::Bulk))
                .collect();
            if let Some((out_addr, in_addr)) = select_bulk_endpoints(&endpoints) {
                return Ok(BulkLayout {
                    interface: alt_setting.interface_number(),
                    out_addr,
                    in_addr,
                });
            }
        }
    }

    Err(DfuError::NotFound(if named {
        "bulk endpoints".to_string()
    } else {
        format!("bulk interface '{interface_name}'")
    }))
}

/// Pick the first bulk OUT and the first bulk IN endpoint address.
pub(crate) fn select_bulk_endpoints(endpoints: &[(u8, bool)]) -> Option<(u8, u8)> {
    let bulk = || endpoints.iter().filter(|(_, is_bulk)| *is_bulk);
    let out_addr = bulk().find(|(addr, _)| addr & ENDPOINT_DIR_IN == 0)?.0;
    let in_addr = bulk().find(|(addr, _)| addr & ENDPOINT_DIR_IN != 0)?.0;
    Some((out_addr, in_addr))
}

fn get_string_descriptor(
    device: &nusb::Device,
    desc_index: NonZeroU8,
    timeout: Duration,
) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .wait()
        .ok()
}
