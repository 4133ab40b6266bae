use std::{fmt, str::FromStr};

use crate::error::*;

/// One of the two microcontrollers behind the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChipTarget {
    /// nRF53 connectivity bridge. Re-enumerates under a new USB identity
    /// when it enters or leaves its bootloader.
    Secondary,
    /// nRF91 cellular modem. Reached through the bridge, keeps the
    /// bridge's USB identity.
    Primary,
}

impl ChipTarget {
    pub fn name(&self) -> &'static str {
        match self {
            ChipTarget::Secondary => "nrf53",
            ChipTarget::Primary => "nrf91",
        }
    }

    /// Whether the USB identity changes when this chip switches mode.
    pub fn reenumerates(&self) -> bool {
        matches!(self, ChipTarget::Secondary)
    }

    /// Commands for this chip are answered with one packet on bulk IN.
    pub fn acknowledges(&self) -> bool {
        matches!(self, ChipTarget::Primary)
    }
}

impl fmt::Display for ChipTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name().to_uppercase())
    }
}

impl FromStr for ChipTarget {
    type Err = DfuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nrf53" => Ok(ChipTarget::Secondary),
            "nrf91" => Ok(ChipTarget::Primary),
            other => Err(DfuError::Configuration(format!(
                "invalid chip '{other}', expected nrf53 or nrf91"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootloaderCommand {
    EnterBootloader,
    Reset,
    ReadVersion,
}

impl BootloaderCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BootloaderCommand::EnterBootloader => "EnterBootloader",
            BootloaderCommand::Reset => "Reset",
            BootloaderCommand::ReadVersion => "ReadVersion",
        }
    }
}

/// Single-byte vendor opcodes understood by the bridge firmware.
///
/// Only valid (chip, command) pairs exist as variants; [VendorCommand::new]
/// rejects the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VendorCommand {
    RecoverSecondary = 0x8e,
    RecoverPrimary = 0x8f,
    ResetSecondary = 0x90,
    ResetPrimary = 0x91,
    ReadSecondaryVersion = 0x92,
}

impl VendorCommand {
    pub fn new(command: BootloaderCommand, chip: ChipTarget) -> DfuResult<Self> {
        use BootloaderCommand::*;
        use ChipTarget::*;

        match (command, chip) {
            (EnterBootloader, Secondary) => Ok(VendorCommand::RecoverSecondary),
            (EnterBootloader, Primary) => Ok(VendorCommand::RecoverPrimary),
            (Reset, Secondary) => Ok(VendorCommand::ResetSecondary),
            (Reset, Primary) => Ok(VendorCommand::ResetPrimary),
            (ReadVersion, Secondary) => Ok(VendorCommand::ReadSecondaryVersion),
            (ReadVersion, Primary) => Err(DfuError::UnsupportedCommand {
                command: command.name(),
                chip,
            }),
        }
    }

    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn chip(self) -> ChipTarget {
        match self {
            VendorCommand::RecoverSecondary
            | VendorCommand::ResetSecondary
            | VendorCommand::ReadSecondaryVersion => ChipTarget::Secondary,
            VendorCommand::RecoverPrimary | VendorCommand::ResetPrimary => {
                ChipTarget::Primary
            }
        }
    }

    /// Whether the device answers with a reply packet.
    pub fn expects_reply(self) -> bool {
        match self {
            VendorCommand::ReadSecondaryVersion => true,
            other => other.chip().acknowledges(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_from_str() {
        assert_eq!("nrf53".parse::<ChipTarget>().unwrap(), ChipTarget::Secondary);
        assert_eq!("NRF91".parse::<ChipTarget>().unwrap(), ChipTarget::Primary);
        assert!(matches!(
            "nrf52".parse::<ChipTarget>(),
            Err(DfuError::Configuration(_))
        ));
    }

    #[test]
    fn test_opcode_table() {
        let table = [
            (BootloaderCommand::EnterBootloader, ChipTarget::Secondary, 0x8e),
            (BootloaderCommand::EnterBootloader, ChipTarget::Primary, 0x8f),
            (BootloaderCommand::Reset, ChipTarget::Secondary, 0x90),
            (BootloaderCommand::Reset, ChipTarget::Primary, 0x91),
            (BootloaderCommand::ReadVersion, ChipTarget::Secondary, 0x92),
        ];
        for (cmd, chip, opcode) in table {
            let vc = VendorCommand::new(cmd, chip).unwrap();
            assert_eq!(vc.opcode(), opcode);
            assert_eq!(vc.chip(), chip);
        }
    }

    #[test]
    fn test_read_version_on_primary_is_rejected() {
        assert!(matches!(
            VendorCommand::new(BootloaderCommand::ReadVersion, ChipTarget::Primary),
            Err(DfuError::UnsupportedCommand { .. })
        ));
    }

    #[test]
    fn test_reply_expectations() {
        assert!(!VendorCommand::RecoverSecondary.expects_reply());
        assert!(!VendorCommand::ResetSecondary.expects_reply());
        assert!(VendorCommand::RecoverPrimary.expects_reply());
        assert!(VendorCommand::ResetPrimary.expects_reply());
        assert!(VendorCommand::ReadSecondaryVersion.expects_reply());
    }
}
