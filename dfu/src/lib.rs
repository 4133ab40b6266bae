//! Firmware update for the Thingy:91 X, based on [`nusb`]
//!
//! The Thingy:91 X carries two chips behind one USB connection: an nRF53
//! connectivity bridge and an nRF91 cellular modem. Neither exposes a
//! standard DFU class interface. Instead the bridge firmware accepts
//! single-byte vendor commands on its CMSIS-DAP v2 bulk interface that put
//! either chip into its bootloader, reset it, or report the bridge version.
//! The image itself is then handed over by external tools: `nrfutil` for
//! whole-image archives and `mcumgr` for MCUboot slot updates.
//!
//! The nRF53 re-enumerates with a different serial number when it enters or
//! leaves its bootloader (see [identity]), so updates on it wait for the new
//! serial port to show up before continuing.
//!
//! # Example
//!
//! Reading the bridge version of the only attached unit:
//! ```no_run
//! use t91x_dfu::{ChipTarget, DfuConfig, SystemDfu};
//!
//! let dfu = SystemDfu::system(DfuConfig::default());
//! match dfu.read_version(ChipTarget::Secondary) {
//!     Ok(version) => println!("nRF53 version: {version}"),
//!     Err(e) => println!("Error: {e}"),
//! }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

mod archive;
mod command;
mod config;
mod controller;
mod device;
mod endpoint;
mod error;
pub mod identity;
mod locator;
mod ports;
mod session;
mod tools;
mod transfer;
mod updater;
mod watcher;

// Re-exports
pub use archive::{
    ManifestEntry, UpdateArchive, UpdateKind, check_chip, classify,
    classify_manifest,
};
pub use command::{BootloaderCommand, ChipTarget, VendorCommand};
pub use config::{DfuConfig, RetryPolicy};
pub use controller::{
    BootloaderController, ModeSwitch, parse_version_reply, send_command,
};
pub use device::{BridgeDevice, find_bridge_devices, ports_of_device};
pub use endpoint::{BulkEndpointPair, resolve_bulk_endpoints};
pub use error::{DfuError, DfuResult};
pub use identity::{DeviceIdentity, Persona};
pub use locator::{
    Candidate, DeviceLocator, LocatedDevice, PortRegistryLocator, UsbLocator,
    platform_locator, select_device,
};
pub use ports::{
    PortRegistry, SerialPortEntry, SystemPortRegistry, ports_for_fragment,
    ports_with_serial,
};
pub use session::{BulkTransport, DfuSession, SessionSource, UsbSessionSource};
pub use tools::{
    CommandExecutor, Mcumgr, Nrfutil, RealCommandExecutor, ToolCommand,
    ToolOutput,
};
pub use transfer::{ImageTransferEngine, verify_image};
pub use updater::{SystemDfu, Thingy91xDfu, UpdateReport};
pub use watcher::{PersonaChange, ReenumerationWatcher};

pub use config::{
    BULK_INTERFACE_NAME, DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID,
    SERIAL_BAUD_RATE, UPLOAD_IMAGE_NUMBER,
};
