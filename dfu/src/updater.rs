use std::{path::Path, thread};

use log::{debug, info, warn};

use crate::{
    ChipTarget,
    archive::{UpdateArchive, UpdateKind, check_chip},
    config::{DfuConfig, RetryPolicy},
    controller::{BootloaderController, ModeSwitch},
    error::*,
    identity::Persona,
    locator::platform_locator,
    ports::{PortRegistry, SystemPortRegistry, ports_with_serial},
    session::{SessionSource, UsbSessionSource},
    tools::{CommandExecutor, RealCommandExecutor},
    transfer::{ImageTransferEngine, verify_image},
    watcher::ReenumerationWatcher,
};

/// What a finished update did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateReport {
    pub chip: ChipTarget,
    pub kind: UpdateKind,
    /// Serial number of the unit after the update.
    pub serial_number: String,
    /// Version from the image header, for staged updates.
    pub image_version: Option<String>,
}

/// DFU for a Thingy:91 X: mode switches, waiting for re-enumeration and
/// handing images to the external tools.
///
/// Operations are strictly sequential and hold at most one USB session at
/// a time.
pub struct Thingy91xDfu<S, R, E> {
    config: DfuConfig,
    source: S,
    registry: R,
    executor: E,
}

pub type SystemDfu = Thingy91xDfu<UsbSessionSource, SystemPortRegistry, RealCommandExecutor>;

impl SystemDfu {
    /// Real USB, the OS serial-port list and the installed tools.
    pub fn system(config: DfuConfig) -> Self {
        let source = UsbSessionSource::new(
            platform_locator(),
            config.vendor_id,
            config.product_id,
            &config.bulk_interface,
            config.usb_timeout,
        );
        Thingy91xDfu::new(config, source, SystemPortRegistry, RealCommandExecutor)
    }
}

impl<S, R, E> Thingy91xDfu<S, R, E>
where
    S: SessionSource,
    R: PortRegistry,
    E: CommandExecutor,
{
    pub fn new(config: DfuConfig, source: S, registry: R, executor: E) -> Self {
        Thingy91xDfu {
            config,
            source,
            registry,
            executor,
        }
    }

    pub fn config(&self) -> &DfuConfig {
        &self.config
    }

    fn controller(&self, chip: ChipTarget) -> BootloaderController<'_, S, R> {
        BootloaderController::new(&self.source, &self.registry, &self.config, chip)
    }

    fn watcher(&self) -> ReenumerationWatcher<'_, R> {
        ReenumerationWatcher::new(&self.registry, self.config.watch_retry)
    }

    fn engine(&self) -> ImageTransferEngine<'_, E> {
        ImageTransferEngine::new(&self.executor, &self.config)
    }

    fn serial_filter(&self) -> Option<&str> {
        self.config.serial_number.as_deref()
    }

    pub fn enter_bootloader_mode(&self, chip: ChipTarget) -> DfuResult<ModeSwitch> {
        self.controller(chip)
            .enter_bootloader(self.serial_filter(), RetryPolicy::once())
    }

    pub fn reset_device(&self, chip: ChipTarget) -> DfuResult<ModeSwitch> {
        self.controller(chip)
            .reset(self.serial_filter(), RetryPolicy::once())
    }

    pub fn read_version(&self, chip: ChipTarget) -> DfuResult<String> {
        self.controller(chip)
            .read_version(self.serial_filter(), RetryPolicy::once())
    }

    /// Update the chip targeted by the archive at `image`.
    ///
    /// The archive is classified and, for staged updates, the image for
    /// `slot` verified before the device is touched.
    pub fn perform_update(
        &self,
        image: &Path,
        requested: Option<ChipTarget>,
        slot: usize,
    ) -> DfuResult<UpdateReport> {
        let archive = UpdateArchive::open(image)?;
        let chip = check_chip(requested, archive.chip())?;
        let kind = archive.kind();
        debug!("Manifest files: {:?}", archive.entries());
        if kind == UpdateKind::StagedBootloaderImage {
            verify_image(&archive.image_for_slot(slot)?)?;
        }
        info!(
            "Performing {kind} DFU on {chip} with firmware: {}",
            image.display()
        );

        let mode = self.enter_bootloader_mode(chip)?;
        let identity = mode.identity().clone();
        info!("{chip} on {} is in bootloader mode", identity.serial_number);

        let mut report = UpdateReport {
            chip,
            kind,
            serial_number: identity.serial_number.clone(),
            image_version: None,
        };

        match (chip, kind) {
            (ChipTarget::Secondary, _) => {
                let fragment = identity.fragment()?;
                let bootloader = self
                    .watcher()
                    .await_persona_change(fragment, Persona::Bootloader)?;

                if kind == UpdateKind::LegacyImageReplace {
                    self.engine()
                        .program_legacy(&bootloader.serial_number, image)?;
                } else {
                    let verification = self.engine().upload_staged(
                        &archive,
                        slot,
                        &bootloader.port,
                        chip,
                    )?;
                    report.image_version =
                        verification.version.map(|v| v.to_string());
                }

                let application = self
                    .watcher()
                    .await_persona_change(fragment, Persona::Application)?;
                if kind == UpdateKind::StagedBootloaderImage {
                    self.controller(chip).reset(
                        Some(&application.serial_number),
                        self.config.locate_retry,
                    )?;
                }
                report.serial_number = application.serial_number;
            }
            (ChipTarget::Primary, UpdateKind::LegacyImageReplace) => {
                self.engine()
                    .program_legacy(&identity.serial_number, image)?;
                self.controller(chip)
                    .reset(Some(&identity.serial_number), self.config.locate_retry)?;
            }
            (ChipTarget::Primary, UpdateKind::StagedBootloaderImage) => {
                let port = self.modem_port(&identity.serial_number)?;
                let verification =
                    self.engine().upload_staged(&archive, slot, &port, chip)?;
                report.image_version = verification.version.map(|v| v.to_string());

                thread::sleep(self.config.staged_settle);
                self.controller(chip)
                    .reset(Some(&identity.serial_number), self.config.locate_retry)?;
            }
        }

        Ok(report)
    }

    /// First serial port of the bridge, which carries the modem's SMP link.
    fn modem_port(&self, serial_number: &str) -> DfuResult<String> {
        let ports = ports_with_serial(&self.registry.list()?, serial_number);
        ports.into_iter().next().ok_or_else(|| {
            warn!("No serial port registered for {serial_number}");
            DfuError::NotFound(format!("serial port of {serial_number}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use tempfile::TempDir;

    use super::*;
    use crate::{
        archive::testing::*,
        ports::{MockPortRegistry, port},
        session::fake::FakeSource,
        tools::{MockCommandExecutor, exited},
    };

    const NRF53_MCUBOOT_MANIFEST: &str = r#"{
        "files": [
            {"type": "mcuboot", "board": "thingy91x/nrf5340/cpuapp", "file": "app.signed.bin"},
            {"type": "mcuboot", "board": "thingy91x/nrf5340/cpuapp", "file": "app.update.bin"}
        ]
    }"#;

    const NRF91_LEGACY_MANIFEST: &str = r#"{
        "files": [{"board": "thingy91x/nrf9151/ns", "file": "modem.hex"}]
    }"#;

    fn recording_executor() -> (MockCommandExecutor, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        let mut executor = MockCommandExecutor::new();
        executor.expect_execute().returning(move |program, args| {
            seen.lock()
                .unwrap()
                .push(format!("{program} {}", args.join(" ")));
            Ok(exited(0))
        });
        (executor, log)
    }

    /// Bootloader persona on the first scan, application persona after.
    fn reenumerating_registry() -> MockPortRegistry {
        let scans = AtomicUsize::new(0);
        let mut registry = MockPortRegistry::new();
        registry.expect_list().returning(move || {
            Ok(if scans.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![port("/dev/ttyACM2", Some("AB12"))]
            } else {
                vec![
                    port("/dev/ttyACM0", Some("THINGY91X_AB12")),
                    port("/dev/ttyACM1", Some("THINGY91X_AB12")),
                ]
            })
        });
        registry
    }

    #[test]
    fn test_staged_secondary_update() {
        let dir = TempDir::new().unwrap();
        let zip = write_archive(
            &dir,
            Some(NRF53_MCUBOOT_MANIFEST),
            &[
                ("app.signed.bin", &b"unused"[..]),
                ("app.update.bin", &mcuboot_image(b"bridge firmware")[..]),
            ],
        );
        let source = FakeSource::new(&["THINGY91X_AB12"]);
        let (executor, log) = recording_executor();
        let dfu = Thingy91xDfu::new(
            DfuConfig::instant(),
            source,
            reenumerating_registry(),
            executor,
        );

        let report = dfu.perform_update(&zip, None, 1).unwrap();
        assert_eq!(report.chip, ChipTarget::Secondary);
        assert_eq!(report.kind, UpdateKind::StagedBootloaderImage);
        assert_eq!(report.serial_number, "THINGY91X_AB12");
        assert_eq!(report.image_version.as_deref(), Some("2.0.1+0"));

        // recover, then the final reset after the swap
        assert_eq!(dfu.source.activity().written, vec![0x8e, 0x90]);
        assert_eq!(dfu.source.activity().released, 2);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert!(log[0].contains("dev=/dev/ttyACM2,baud=1000000 image list"));
        assert!(log[3].ends_with("reset"));
    }

    #[test]
    fn test_legacy_primary_update() {
        let dir = TempDir::new().unwrap();
        let zip = write_archive(
            &dir,
            Some(NRF91_LEGACY_MANIFEST),
            &[("modem.hex", &b":00"[..])],
        );
        let source = FakeSource::new(&["THINGY91X_AB12"]).with_reply(&[0x00]);
        let mut registry = MockPortRegistry::new();
        registry.expect_list().returning(|| {
            Ok(vec![
                port("/dev/ttyACM0", Some("THINGY91X_AB12")),
                port("/dev/ttyACM1", Some("THINGY91X_AB12")),
            ])
        });
        registry.expect_probe().times(1).returning(|_, _, _| Ok(()));
        let (executor, log) = recording_executor();
        let dfu = Thingy91xDfu::new(DfuConfig::instant(), source, registry, executor);

        let report = dfu
            .perform_update(&zip, Some(ChipTarget::Primary), 1)
            .unwrap();
        assert_eq!(report.kind, UpdateKind::LegacyImageReplace);
        assert_eq!(dfu.source.activity().written, vec![0x8f, 0x91]);

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![format!(
                "nrfutil device program --serial-number THINGY91X_AB12 --firmware {}",
                zip.display()
            )]
        );
    }

    #[test]
    fn test_chip_mismatch_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let zip = write_archive(&dir, Some(NRF91_LEGACY_MANIFEST), &[]);
        let mut executor = MockCommandExecutor::new();
        executor.expect_execute().never();
        let dfu = Thingy91xDfu::new(
            DfuConfig::instant(),
            FakeSource::new(&["THINGY91X_AB12"]),
            MockPortRegistry::new(),
            executor,
        );

        let err = dfu
            .perform_update(&zip, Some(ChipTarget::Secondary), 1)
            .unwrap_err();
        assert!(matches!(err, DfuError::Configuration(_)));
        assert_eq!(dfu.source.activity().locates, 0);
    }

    #[test]
    fn test_bad_image_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let mut image = mcuboot_image(b"bridge firmware");
        let last = image.len() - 1;
        image[last] ^= 0x01;
        let zip = write_archive(
            &dir,
            Some(NRF53_MCUBOOT_MANIFEST),
            &[("app.signed.bin", &b"unused"[..]), ("app.update.bin", &image[..])],
        );
        let mut executor = MockCommandExecutor::new();
        executor.expect_execute().never();
        let dfu = Thingy91xDfu::new(
            DfuConfig::instant(),
            FakeSource::new(&["THINGY91X_AB12"]),
            MockPortRegistry::new(),
            executor,
        );

        let err = dfu.perform_update(&zip, None, 1).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert_eq!(dfu.source.activity().locates, 0);
    }

    #[test]
    fn test_reenumeration_timeout_stops_update() {
        let dir = TempDir::new().unwrap();
        let zip = write_archive(
            &dir,
            Some(NRF53_MCUBOOT_MANIFEST),
            &[
                ("app.signed.bin", &b"unused"[..]),
                ("app.update.bin", &mcuboot_image(b"bridge firmware")[..]),
            ],
        );
        let mut registry = MockPortRegistry::new();
        registry
            .expect_list()
            .returning(|| Ok(vec![port("/dev/ttyACM0", Some("THINGY91X_AB12"))]));
        let mut executor = MockCommandExecutor::new();
        executor.expect_execute().never();
        let dfu = Thingy91xDfu::new(
            DfuConfig::instant(),
            FakeSource::new(&["THINGY91X_AB12"]),
            registry,
            executor,
        );

        let err = dfu.perform_update(&zip, None, 1).unwrap_err();
        assert!(matches!(err, DfuError::Timeout { attempts: 3 }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(dfu.source.activity().written, vec![0x8e]);
    }

    #[test]
    fn test_unknown_serial_sends_nothing() {
        let dfu = Thingy91xDfu::new(
            DfuConfig {
                serial_number: Some("THINGY91X_FFFF".into()),
                ..DfuConfig::instant()
            },
            FakeSource::new(&["THINGY91X_AB12"]),
            MockPortRegistry::new(),
            MockCommandExecutor::new(),
        );

        assert!(matches!(
            dfu.reset_device(ChipTarget::Secondary),
            Err(DfuError::NotFound(_))
        ));
        assert_eq!(dfu.source.activity().locates, 1);
        assert!(dfu.source.activity().written.is_empty());
    }
}
