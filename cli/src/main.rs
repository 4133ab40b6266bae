use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use clap_num::maybe_hex;
use env_logger::Env;
use log::{debug, error};

use error::CliError;
use list::*;
use mode::*;
use t91x_dfu::{
    ChipTarget, DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID, DfuConfig, RetryPolicy,
    SERIAL_BAUD_RATE, SystemDfu, UPLOAD_IMAGE_NUMBER, check_chip, classify,
};
use update::*;

mod error;
mod list;
mod mode;
mod update;

/// Thingy:91 X DFU
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// update archive (.zip with manifest.json)
    #[clap(long)]
    image: Option<PathBuf>,
    /// chip to act on: nrf53 or nrf91 (detected from --image if omitted)
    #[clap(long, value_parser = parse_chip)]
    chip: Option<ChipTarget>,
    /// vendor ID (ex: 0x1915)
    #[clap(
        long,
        value_parser = maybe_hex::<u16>,
        default_value_t = DEFAULT_VENDOR_ID
    )]
    vid: u16,
    /// product ID (ex: 0x910a)
    #[clap(
        long,
        value_parser = maybe_hex::<u16>,
        default_value_t = DEFAULT_PRODUCT_ID
    )]
    pid: u16,
    /// serial number of the unit (ex: THINGY91X_1A2B3C4D)
    #[clap(long)]
    serial: Option<String>,
    /// only reset the chip, no update
    #[clap(long)]
    reset_only: bool,
    /// print the nRF53 firmware version
    #[clap(long, alias = "check-nrf53-version")]
    check_version: bool,
    /// manifest file index of the MCUboot image
    #[clap(long, default_value_t = 1)]
    bootloader_slot: usize,
    /// list attached units and their serial ports
    #[clap(long)]
    list: bool,
    /// device lookups after a mode switch
    #[clap(long, default_value_t = 5)]
    locate_attempts: u32,
    /// seconds between device lookups
    #[clap(long, default_value_t = 10)]
    locate_interval: u64,
    /// serial port scans while waiting for re-enumeration
    #[clap(long, default_value_t = 30)]
    watch_attempts: u32,
    /// seconds between serial port scans
    #[clap(long, default_value_t = 5)]
    watch_interval: u64,
    /// seconds to wait after a reset
    #[clap(long, default_value_t = 2)]
    reset_settle: u64,
    /// seconds to wait between an nRF91 upload and its reset
    #[clap(long, default_value_t = 5)]
    staged_settle: u64,
    /// serial port probe timeout in milliseconds
    #[clap(long, default_value_t = 1000)]
    probe_timeout: u64,
    /// USB control and bulk transfer timeout in milliseconds
    #[clap(long, default_value_t = 5000)]
    usb_timeout: u64,
    /// baud rate of the SMP serial link
    #[clap(long, default_value_t = SERIAL_BAUD_RATE)]
    baud_rate: u32,
    /// image number given to mcumgr image upload
    #[clap(long, default_value_t = UPLOAD_IMAGE_NUMBER)]
    upload_image_number: u32,
    /// nrfutil executable
    #[clap(long, default_value = "nrfutil")]
    nrfutil: String,
    /// mcumgr executable
    #[clap(long, default_value = "mcumgr")]
    mcumgr: String,
    /// debug output
    #[clap(short, long)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> DfuConfig {
        DfuConfig {
            vendor_id: self.vid,
            product_id: self.pid,
            serial_number: self.serial.clone(),
            locate_retry: RetryPolicy::new(
                self.locate_attempts,
                Duration::from_secs(self.locate_interval),
            ),
            watch_retry: RetryPolicy::new(
                self.watch_attempts,
                Duration::from_secs(self.watch_interval),
            ),
            reset_settle: Duration::from_secs(self.reset_settle),
            staged_settle: Duration::from_secs(self.staged_settle),
            probe_timeout: Duration::from_millis(self.probe_timeout),
            usb_timeout: Duration::from_millis(self.usb_timeout),
            baud_rate: self.baud_rate,
            upload_image_number: self.upload_image_number,
            nrfutil: self.nrfutil.clone(),
            mcumgr: self.mcumgr.clone(),
            ..Default::default()
        }
    }

    /// Archive to update with, when no other action was asked for.
    fn update_image(&self) -> Option<&PathBuf> {
        if self.check_version || self.reset_only {
            return None;
        }
        self.image.as_ref()
    }

    /// The chip named on the command line, checked against the image.
    fn resolve_chip(&self) -> Result<ChipTarget, CliError> {
        if let Some(image) = &self.image {
            let (detected, _) = classify(image)?;
            return Ok(check_chip(self.chip, detected)?);
        }
        match self.chip {
            Some(chip) => Ok(chip),
            None if self.check_version => Ok(ChipTarget::Secondary),
            None => Err(CliError::NoChip),
        }
    }
}

fn parse_chip(s: &str) -> Result<ChipTarget, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .init();

    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        if err.is_fatal() {
            error!("Update aborted, check the device before trying again");
        }
        ExitCode::from(err.exit_code())
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let config = cli.config();
    debug!("{config:?}");
    if cli.list {
        return list_bridges(&config);
    }

    // the update classifies the archive itself
    if let Some(image) = cli.update_image() {
        let dfu = SystemDfu::system(config);
        return update_chip(&dfu, image, cli.chip, cli.bootloader_slot);
    }

    let chip = cli.resolve_chip()?;
    let dfu = SystemDfu::system(config);
    if cli.check_version {
        check_version(&dfu, chip)
    } else if cli.reset_only {
        reset_chip(&dfu, chip)
    } else {
        enter_bootloader(&dfu, chip)
    }
}
