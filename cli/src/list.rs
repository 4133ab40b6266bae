use t91x_dfu::{
    BridgeDevice, DfuConfig, SystemPortRegistry, find_bridge_devices,
};

use crate::CliError;

pub(crate) fn list_bridges(config: &DfuConfig) -> Result<(), CliError> {
    let devices = find_bridge_devices(
        config.vendor_id,
        config.product_id,
        &SystemPortRegistry,
    )?;
    if devices.is_empty() {
        println!("No Thingy:91 X found");
    } else {
        print_devices(&devices);
    }
    Ok(())
}

fn print_devices(devices: &[BridgeDevice]) {
    for device in devices {
        let serial = device
            .identity()
            .map_or("<unknown>", |id| id.serial_number.as_str());
        let persona = device
            .persona()
            .map_or("unknown".to_string(), |p| p.to_string());
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x} {} ({})",
            device.bus_id(),
            device.device_address(),
            device.vendor_id(),
            device.product_id(),
            serial,
            persona,
        );
        for port in device.ports() {
            println!("  {port}");
        }
    }
}
