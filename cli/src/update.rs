use std::{path::Path, time::Instant};

use t91x_dfu::{ChipTarget, SystemDfu};

use crate::CliError;

pub(crate) fn update_chip(
    dfu: &SystemDfu,
    image: &Path,
    chip: Option<ChipTarget>,
    slot: usize,
) -> Result<(), CliError> {
    println!("Updating with {}...", image.display());
    let start = Instant::now();
    let report = dfu.perform_update(image, chip, slot)?;

    println!(
        "Updated {} on {} ({}) in {:.1}s",
        report.chip,
        report.serial_number,
        report.kind,
        start.elapsed().as_secs_f32()
    );
    if let Some(version) = report.image_version {
        println!("Image version: {version}");
    }
    Ok(())
}
