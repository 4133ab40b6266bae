//! Vendor commands over the bridge's bulk interface.

use std::thread;

use log::{debug, error, info, warn};

use crate::{
    ChipTarget,
    command::{BootloaderCommand, VendorCommand},
    config::{DfuConfig, RetryPolicy},
    error::*,
    identity::{DeviceIdentity, Persona},
    ports::{PortRegistry, ports_with_serial},
    session::{BulkTransport, SessionSource},
};

/// Serial ports the bridge exposes while its application runs.
const APPLICATION_PORT_COUNT: usize = 2;

/// Length byte the bridge sends when it cannot report a version.
const VERSION_UNSUPPORTED: u8 = 0xff;

/// Outcome of a mode-switching command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModeSwitch {
    /// Command written; the chip re-enumerates under a new identity.
    AwaitingReenumeration(DeviceIdentity),
    /// Command written and confirmed by a reply packet.
    Acknowledged(DeviceIdentity),
    /// The unit already runs its bootloader, nothing was sent.
    AlreadyInBootloader(DeviceIdentity),
}

impl ModeSwitch {
    pub fn identity(&self) -> &DeviceIdentity {
        match self {
            ModeSwitch::AwaitingReenumeration(id)
            | ModeSwitch::Acknowledged(id)
            | ModeSwitch::AlreadyInBootloader(id) => id,
        }
    }
}

enum Acquired<D> {
    Ready(DeviceIdentity, D),
    AlreadyInBootloader(DeviceIdentity),
}

/// Issues bootloader commands to one chip.
///
/// Every command opens its own session and releases it before returning,
/// whatever the outcome.
pub struct BootloaderController<'a, S: SessionSource, R: PortRegistry> {
    source: &'a S,
    registry: &'a R,
    config: &'a DfuConfig,
    chip: ChipTarget,
}

impl<'a, S: SessionSource, R: PortRegistry> BootloaderController<'a, S, R> {
    pub fn new(
        source: &'a S,
        registry: &'a R,
        config: &'a DfuConfig,
        chip: ChipTarget,
    ) -> Self {
        BootloaderController {
            source,
            registry,
            config,
            chip,
        }
    }

    pub fn chip(&self) -> ChipTarget {
        self.chip
    }

    /// Locate the device and check its persona against the requested chip.
    fn acquire(
        &self,
        serial_filter: Option<&str>,
        retry: RetryPolicy,
    ) -> DfuResult<Acquired<S::Device>> {
        let (identity, device) = self.source.locate(serial_filter, retry)?;
        if identity.persona() == Persona::Application {
            return Ok(Acquired::Ready(identity, device));
        }

        warn!("Device is already in bootloader mode");
        if self.chip != ChipTarget::Secondary {
            error!(
                "The device is in {} bootloader mode, but {} was requested. \
                 Program the connectivity bridge firmware first.",
                ChipTarget::Secondary,
                self.chip
            );
            return Err(DfuError::WrongPersona {
                persona_chip: ChipTarget::Secondary,
                requested: self.chip,
            });
        }
        Ok(Acquired::AlreadyInBootloader(identity))
    }

    /// Open a session, send `command`, release the session.
    fn transact(
        &self,
        identity: &DeviceIdentity,
        device: S::Device,
        command: VendorCommand,
    ) -> DfuResult<Option<Vec<u8>>> {
        let mut session = self.source.open(identity, self.chip, device)?;
        let reply = send_command(&mut session, command);
        drop(session);
        reply
    }

    pub fn enter_bootloader(
        &self,
        serial_filter: Option<&str>,
        retry: RetryPolicy,
    ) -> DfuResult<ModeSwitch> {
        info!("Entering bootloader mode on {}", self.chip);
        let command = VendorCommand::new(BootloaderCommand::EnterBootloader, self.chip)?;
        let (identity, device) = match self.acquire(serial_filter, retry)? {
            Acquired::Ready(identity, device) => (identity, device),
            Acquired::AlreadyInBootloader(identity) => {
                return Ok(ModeSwitch::AlreadyInBootloader(identity));
            }
        };

        if !self.chip.reenumerates() {
            self.check_primary_ports(&identity)?;
        }

        let reply = self.transact(&identity, device, command).inspect_err(|e| {
            error!("Failed to enter bootloader mode: {e}");
        })?;
        debug!("Bootloader command sent successfully.");
        Ok(match reply {
            Some(data) => {
                debug!("Response: {data:02x?}");
                ModeSwitch::Acknowledged(identity)
            }
            None => ModeSwitch::AwaitingReenumeration(identity),
        })
    }

    /// Reset the chip and give it `reset_settle` to come back up.
    pub fn reset(
        &self,
        serial_filter: Option<&str>,
        retry: RetryPolicy,
    ) -> DfuResult<ModeSwitch> {
        info!("Resetting {}...", self.chip);
        let command = VendorCommand::new(BootloaderCommand::Reset, self.chip)?;
        let (identity, device) = match self.acquire(serial_filter, retry)? {
            Acquired::Ready(identity, device) => (identity, device),
            Acquired::AlreadyInBootloader(identity) => {
                return Ok(ModeSwitch::AlreadyInBootloader(identity));
            }
        };

        let reply = self.transact(&identity, device, command).inspect_err(|e| {
            error!("Failed to reset device: {e}");
        })?;
        debug!("Reset command sent successfully.");
        if let Some(data) = &reply {
            debug!("Response: {data:02x?}");
        }

        thread::sleep(self.config.reset_settle);
        Ok(match reply {
            Some(_) => ModeSwitch::Acknowledged(identity),
            None => ModeSwitch::AwaitingReenumeration(identity),
        })
    }

    pub fn read_version(
        &self,
        serial_filter: Option<&str>,
        retry: RetryPolicy,
    ) -> DfuResult<String> {
        info!("Reading {} version...", self.chip);
        let command = VendorCommand::new(BootloaderCommand::ReadVersion, self.chip)?;
        let (identity, device) = match self.acquire(serial_filter, retry)? {
            Acquired::Ready(identity, device) => (identity, device),
            Acquired::AlreadyInBootloader(_) => {
                return Err(version_error("device is in bootloader mode"));
            }
        };

        let version = self
            .transact(&identity, device, command)
            .and_then(|reply| match reply {
                Some(data) => parse_version_reply(&data),
                None => Err(version_error("no reply")),
            })
            .inspect_err(|e| error!("Failed to read {} version: {e}", self.chip))?;
        info!("{} version: {version}", self.chip);
        Ok(version)
    }

    /// The modem is reached over the bridge's second serial port. Both
    /// ports must be present and the first must not be held open.
    fn check_primary_ports(&self, identity: &DeviceIdentity) -> DfuResult<()> {
        let ports = ports_with_serial(&self.registry.list()?, &identity.serial_number);
        if ports.len() != APPLICATION_PORT_COUNT {
            error!(
                "Expected {APPLICATION_PORT_COUNT} serial ports, but found {}",
                ports.len()
            );
            return Err(DfuError::PortCount {
                serial: identity.serial_number.clone(),
                expected: APPLICATION_PORT_COUNT,
                found: ports.len(),
            });
        }
        self.registry
            .probe(&ports[0], self.config.baud_rate, self.config.probe_timeout)
            .inspect_err(|e| error!("{e}"))
    }
}

/// Write the opcode, then collect the reply packet if one is due.
pub fn send_command<T: BulkTransport>(
    transport: &mut T,
    command: VendorCommand,
) -> DfuResult<Option<Vec<u8>>> {
    transport.write(&[command.opcode()])?;
    if !command.expects_reply() {
        return Ok(None);
    }
    let data = transport.read()?;
    if data.is_empty() {
        return Err(DfuError::Protocol(format!(
            "empty reply to opcode 0x{:02x}",
            command.opcode()
        )));
    }
    Ok(Some(data))
}

/// Decode `[opcode, len, version...]`.
pub fn parse_version_reply(data: &[u8]) -> DfuResult<String> {
    let opcode = VendorCommand::ReadSecondaryVersion.opcode();
    let (&echo, &len) = match data {
        [echo, len, ..] => (echo, len),
        _ => return Err(version_error("short reply")),
    };
    if echo != opcode {
        return Err(version_error(&format!(
            "reply echoes 0x{echo:02x} instead of 0x{opcode:02x}"
        )));
    }
    if len == VERSION_UNSUPPORTED {
        return Err(version_error("not supported by the firmware"));
    }
    let payload = data
        .get(2..2 + len as usize)
        .ok_or_else(|| version_error("length exceeds reply"))?;
    if !payload.is_ascii() {
        return Err(version_error("version is not ASCII"));
    }
    Ok(String::from_utf8_lossy(payload).into_owned())
}

fn version_error(reason: &str) -> DfuError {
    DfuError::Protocol(format!("failed to read version: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ports::{MockPortRegistry, port},
        session::{MockBulkTransport, fake::FakeSource},
    };

    const APP_SERIAL: &str = "THINGY91X_AB12CD34";

    fn registry_with(serials: Vec<(&'static str, &'static str)>) -> MockPortRegistry {
        let mut registry = MockPortRegistry::new();
        registry.expect_list().returning(move || {
            Ok(serials
                .iter()
                .map(|(path, sn)| port(path, Some(sn)))
                .collect())
        });
        registry
    }

    #[test]
    fn test_parse_version_reply() {
        assert_eq!(
            parse_version_reply(&[0x92, 0x05, b'2', b'.', b'1', b'.', b'0', 0, 0])
                .unwrap(),
            "2.1.0"
        );
    }

    #[test]
    fn test_parse_version_rejects_unsupported() {
        // payload content is irrelevant once the length says unsupported
        for payload in [&b""[..], &b"2.1.0"[..], &[0xffu8; 60][..]] {
            let mut data = vec![0x92, 0xff];
            data.extend_from_slice(payload);
            let err = parse_version_reply(&data).unwrap_err();
            assert!(err.to_string().contains("failed to read version"));
        }
    }

    #[test]
    fn test_parse_version_rejects_malformed() {
        assert!(parse_version_reply(&[]).is_err());
        assert!(parse_version_reply(&[0x92]).is_err());
        assert!(parse_version_reply(&[0x91, 0x01, b'1']).is_err());
        assert!(parse_version_reply(&[0x92, 0x08, b'1']).is_err());
        assert!(parse_version_reply(&[0x92, 0x01, 0xc3]).is_err());
    }

    #[test]
    fn test_send_command_without_reply() {
        let mut transport = MockBulkTransport::new();
        transport
            .expect_write()
            .withf(|data| data.to_vec() == vec![0x8e])
            .times(1)
            .returning(|_| Ok(()));
        transport.expect_read().never();

        assert_eq!(
            send_command(&mut transport, VendorCommand::RecoverSecondary).unwrap(),
            None
        );
    }

    #[test]
    fn test_send_command_empty_reply() {
        let mut transport = MockBulkTransport::new();
        transport.expect_write().returning(|_| Ok(()));
        transport.expect_read().times(1).returning(|| Ok(vec![]));

        assert!(matches!(
            send_command(&mut transport, VendorCommand::ResetPrimary),
            Err(DfuError::Protocol(_))
        ));
    }

    #[test]
    fn test_enter_bootloader_secondary() {
        let config = DfuConfig::instant();
        let source = FakeSource::new(&[APP_SERIAL]);
        let registry = MockPortRegistry::new();
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Secondary);

        let res = controller.enter_bootloader(None, RetryPolicy::once()).unwrap();
        assert!(matches!(res, ModeSwitch::AwaitingReenumeration(_)));
        assert_eq!(res.identity().serial_number, APP_SERIAL);
        let activity = source.activity();
        assert_eq!(activity.written, vec![0x8e]);
        assert_eq!(activity.released, 1);
    }

    #[test]
    fn test_enter_bootloader_ambiguous_sends_nothing() {
        let config = DfuConfig::instant();
        let source =
            FakeSource::ambiguous(&[APP_SERIAL, "THINGY91X_99887766"]);
        let registry = MockPortRegistry::new();
        let controller = BootloaderController::new(
            &source,
            &registry,
            &config,
            ChipTarget::Secondary,
        );

        let err = controller
            .enter_bootloader(None, RetryPolicy::once())
            .unwrap_err();
        match err {
            DfuError::Ambiguous { serials } => {
                assert_eq!(serials, vec![APP_SERIAL, "THINGY91X_99887766"])
            }
            other => panic!("unexpected error: {other}"),
        }
        let activity = source.activity();
        assert_eq!(activity.opened, 0);
        assert!(activity.written.is_empty());
    }

    #[test]
    fn test_enter_bootloader_ambiguous_with_serial() {
        let config = DfuConfig::instant();
        let source =
            FakeSource::ambiguous(&[APP_SERIAL, "THINGY91X_99887766"]);
        let registry = MockPortRegistry::new();
        let controller = BootloaderController::new(
            &source,
            &registry,
            &config,
            ChipTarget::Secondary,
        );

        let res = controller
            .enter_bootloader(Some("THINGY91X_99887766"), RetryPolicy::once())
            .unwrap();
        assert_eq!(res.identity().serial_number, "THINGY91X_99887766");
        assert_eq!(source.activity().written, vec![0x8e]);
    }

    #[test]
    fn test_enter_bootloader_primary_checks_ports() {
        let config = DfuConfig::instant();
        let source = FakeSource::new(&[APP_SERIAL]).with_reply(&[0x8f]);
        let mut registry = registry_with(vec![
            ("/dev/ttyACM1", APP_SERIAL),
            ("/dev/ttyACM0", APP_SERIAL),
        ]);
        registry
            .expect_probe()
            .withf(|path, baud, _| {
                path.to_string() == "/dev/ttyACM0" && *baud == 1_000_000
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Primary);

        let res = controller.enter_bootloader(None, RetryPolicy::once()).unwrap();
        assert!(matches!(res, ModeSwitch::Acknowledged(_)));
        assert_eq!(source.activity().written, vec![0x8f]);
    }

    #[test]
    fn test_enter_bootloader_primary_wrong_port_count() {
        let config = DfuConfig::instant();
        let source = FakeSource::new(&[APP_SERIAL]).with_reply(&[0x8f]);
        let mut registry = registry_with(vec![("/dev/ttyACM0", APP_SERIAL)]);
        registry.expect_probe().never();
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Primary);

        let res = controller.enter_bootloader(None, RetryPolicy::once());
        assert!(matches!(
            res,
            Err(DfuError::PortCount {
                expected: 2,
                found: 1,
                ..
            })
        ));
        let activity = source.activity();
        assert!(activity.written.is_empty());
        assert_eq!(activity.opened, 0);
    }

    #[test]
    fn test_enter_bootloader_primary_port_busy() {
        let config = DfuConfig::instant();
        let source = FakeSource::new(&[APP_SERIAL]).with_reply(&[0x8f]);
        let mut registry = registry_with(vec![
            ("/dev/ttyACM0", APP_SERIAL),
            ("/dev/ttyACM1", APP_SERIAL),
        ]);
        registry.expect_probe().returning(|path, _, _| {
            Err(DfuError::PortBusy {
                port: path.to_string(),
                reason: "Device or resource busy".into(),
            })
        });
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Primary);

        assert!(matches!(
            controller.enter_bootloader(None, RetryPolicy::once()),
            Err(DfuError::PortBusy { .. })
        ));
        assert!(source.activity().written.is_empty());
    }

    #[test]
    fn test_primary_without_ack_fails_and_releases() {
        let config = DfuConfig::instant();
        let source = FakeSource::new(&[APP_SERIAL]);
        let registry = MockPortRegistry::new();
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Primary);

        assert!(controller.reset(None, RetryPolicy::once()).is_err());
        let activity = source.activity();
        assert_eq!(activity.written, vec![0x91]);
        assert_eq!(activity.released, 1);
    }

    #[test]
    fn test_write_failure_releases_session() {
        let config = DfuConfig::instant();
        let source = FakeSource::new(&[APP_SERIAL]).failing_writes();
        let registry = MockPortRegistry::new();
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Secondary);

        assert!(controller.reset(None, RetryPolicy::once()).is_err());
        assert_eq!(source.activity().opened, 1);
        assert_eq!(source.activity().released, 1);
    }

    #[test]
    fn test_bootloader_persona_skips_secondary() {
        let config = DfuConfig::instant();
        let source = FakeSource::new(&["AB12CD34"]);
        let registry = MockPortRegistry::new();
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Secondary);

        let res = controller.enter_bootloader(None, RetryPolicy::once()).unwrap();
        assert!(matches!(res, ModeSwitch::AlreadyInBootloader(_)));
        assert_eq!(source.activity().opened, 0);
    }

    #[test]
    fn test_bootloader_persona_rejects_primary() {
        let config = DfuConfig::instant();
        let source = FakeSource::new(&["AB12CD34"]);
        let registry = MockPortRegistry::new();
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Primary);

        let err = controller.enter_bootloader(None, RetryPolicy::once()).unwrap_err();
        assert!(matches!(
            err,
            DfuError::WrongPersona {
                persona_chip: ChipTarget::Secondary,
                requested: ChipTarget::Primary,
            }
        ));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(source.activity().opened, 0);
    }

    #[test]
    fn test_read_version() {
        let config = DfuConfig::instant();
        let source =
            FakeSource::new(&[APP_SERIAL]).with_reply(&[0x92, 0x03, b'1', b'.', b'2']);
        let registry = MockPortRegistry::new();
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Secondary);

        assert_eq!(controller.read_version(None, RetryPolicy::once()).unwrap(), "1.2");
        assert_eq!(source.activity().written, vec![0x92]);
        assert_eq!(source.activity().released, 1);
    }

    #[test]
    fn test_read_version_on_primary_is_unsupported() {
        let config = DfuConfig::instant();
        let source = FakeSource::new(&[APP_SERIAL]);
        let registry = MockPortRegistry::new();
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Primary);

        assert!(matches!(
            controller.read_version(None, RetryPolicy::once()),
            Err(DfuError::UnsupportedCommand { .. })
        ));
        assert_eq!(source.activity().locates, 0);
    }

    #[test]
    fn test_initial_lookup_not_retried() {
        let config = DfuConfig::instant();
        let source = FakeSource::new(&[]);
        let registry = MockPortRegistry::new();
        let controller =
            BootloaderController::new(&source, &registry, &config, ChipTarget::Secondary);

        assert!(matches!(
            controller.reset(None, RetryPolicy::once()),
            Err(DfuError::NotFound(_))
        ));
        assert_eq!(source.activity().locates, 1);

        assert!(controller.reset(None, config.locate_retry).is_err());
        assert_eq!(source.activity().locates, 4);
    }
}
