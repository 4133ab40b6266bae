//! Handing the image to the chip's bootloader.

use std::path::Path;

use log::{error, info};
use mcuboot_image::{Verification, verify_file};

use crate::{
    ChipTarget,
    archive::UpdateArchive,
    config::DfuConfig,
    error::*,
    tools::{CommandExecutor, Mcumgr, Nrfutil},
};

/// Drives the external tools that move an image onto the device.
///
/// Neither path retries a step. A failing step ends the update.
pub struct ImageTransferEngine<'a, E: CommandExecutor + ?Sized> {
    executor: &'a E,
    config: &'a DfuConfig,
}

impl<'a, E: CommandExecutor + ?Sized> ImageTransferEngine<'a, E> {
    pub fn new(executor: &'a E, config: &'a DfuConfig) -> Self {
        ImageTransferEngine { executor, config }
    }

    /// Program a whole archive through the vendor tool. The tool checks
    /// the image itself.
    pub fn program_legacy(&self, serial_number: &str, firmware: &Path) -> DfuResult<()> {
        Nrfutil::new(&self.config.nrfutil)
            .program(serial_number, firmware)
            .run(self.executor)?;
        Ok(())
    }

    /// Verify the slot's image, then list, upload, confirm and reset over
    /// the SMP port.
    ///
    /// Nothing is sent when verification fails.
    pub fn upload_staged(
        &self,
        archive: &UpdateArchive,
        slot: usize,
        port: &str,
        chip: ChipTarget,
    ) -> DfuResult<Verification> {
        let image = archive.image_for_slot(slot)?;
        let verification = verify_image(&image)?;
        let digest = verification
            .digest_hex()
            .ok_or_else(|| DfuError::VerificationFailed("no digest".into()))?;
        info!(
            "Image {} verified (version {})",
            image.display(),
            verification
                .version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default()
        );

        let mcumgr = Mcumgr::new(&self.config.mcumgr, port, self.config.baud_rate);
        if chip == ChipTarget::Primary {
            mcumgr.warm_up().run_tolerant(self.executor);
        }

        for command in [
            mcumgr.image_list(),
            mcumgr.image_upload(&image, self.config.upload_image_number),
            mcumgr.image_confirm(&digest),
            mcumgr.reset(),
        ] {
            command.run(self.executor)?;
        }
        Ok(verification)
    }
}

/// Local hash check of an MCUboot image. Only a clean result passes.
pub fn verify_image(image: &Path) -> DfuResult<Verification> {
    let verification = verify_file(image).map_err(|e| {
        error!("Image verification failed: {e}");
        DfuError::VerificationFailed(e.to_string())
    })?;
    if !verification.is_ok() {
        error!("Image verification failed: {}", verification.result);
        return Err(DfuError::VerificationFailed(verification.result.to_string()));
    }
    Ok(verification)
}
