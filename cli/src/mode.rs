use t91x_dfu::{ChipTarget, ModeSwitch, SystemDfu};

use crate::CliError;

pub(crate) fn reset_chip(
    dfu: &SystemDfu,
    chip: ChipTarget,
) -> Result<(), CliError> {
    println!("Resetting {chip}...");
    match dfu.reset_device(chip)? {
        ModeSwitch::AlreadyInBootloader(identity) => println!(
            "{} is in bootloader mode, nothing to reset",
            identity.serial_number
        ),
        mode => {
            println!("{chip} on {} has been reset", mode.identity().serial_number)
        }
    }
    Ok(())
}

pub(crate) fn enter_bootloader(
    dfu: &SystemDfu,
    chip: ChipTarget,
) -> Result<(), CliError> {
    println!("Entering bootloader mode on {chip}...");
    let mode = dfu.enter_bootloader_mode(chip)?;
    println!(
        "{chip} on {} is in bootloader mode",
        mode.identity().serial_number
    );
    Ok(())
}

pub(crate) fn check_version(
    dfu: &SystemDfu,
    chip: ChipTarget,
) -> Result<(), CliError> {
    let version = dfu.read_version(chip)?;
    println!("{chip} version: {version}");
    Ok(())
}
