//! Device identification shared with the serial log reader.
//!
//! The bridge reports a serial number of the form `THINGY91X_<hex>` while it
//! runs its application firmware. Once the nRF53 sits in its bootloader the
//! same unit enumerates with the bare `<hex>` part only. The hex fragment is
//! therefore the stable part of the identity and the prefix tells the
//! persona.

use std::{fmt, sync::LazyLock};

use regex::Regex;

use crate::error::*;

/// Present in the serial number only while the application runs.
pub const APPLICATION_MARKER: &str = "THINGY91X";

static SERIAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(THINGY91X_)?([A-F0-9]+)").unwrap());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Persona {
    Application,
    Bootloader,
}

impl Persona {
    pub fn of(serial_number: &str) -> Persona {
        if serial_number.contains(APPLICATION_MARKER) {
            Persona::Application
        } else {
            Persona::Bootloader
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Persona::Application => f.write_str("application"),
            Persona::Bootloader => f.write_str("bootloader"),
        }
    }
}

/// Identity of one physical unit under one persona.
///
/// A persona change yields a new identity; this one is never updated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: String,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, serial_number: &str) -> Self {
        DeviceIdentity {
            vendor_id,
            product_id,
            serial_number: serial_number.to_string(),
        }
    }

    pub fn persona(&self) -> Persona {
        Persona::of(&self.serial_number)
    }

    pub fn fragment(&self) -> DfuResult<&str> {
        serial_fragment(&self.serial_number)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} {} ({})",
            self.vendor_id,
            self.product_id,
            self.serial_number,
            self.persona()
        )
    }
}

/// Extract the persona-independent part of a serial number.
pub fn serial_fragment(serial_number: &str) -> DfuResult<&str> {
    SERIAL_RE
        .captures(serial_number)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            DfuError::Configuration(format!(
                "serial number '{serial_number}' doesn't match expected format"
            ))
        })
}

/// Whether `serial_number` belongs to the unit identified by `fragment`.
pub fn matches_fragment(serial_number: &str, fragment: &str) -> bool {
    !fragment.is_empty() && serial_number.contains(fragment)
}

/// Whether both serial numbers name the same unit, under any persona.
pub fn same_physical_device(a: &str, b: &str) -> bool {
    match (serial_fragment(a), serial_fragment(b)) {
        (Ok(fa), Ok(fb)) => fa == fb,
        _ => false,
    }
}
