//! Polling for the bridge to re-enumerate under another persona.

use std::thread;

use log::{debug, error, info};

use crate::{
    config::RetryPolicy,
    error::*,
    identity::Persona,
    ports::{PortRegistry, ports_for_fragment},
};

/// Where the unit showed up after switching persona.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersonaChange {
    pub serial_number: String,
    pub port: String,
}

pub struct ReenumerationWatcher<'a, R: PortRegistry> {
    registry: &'a R,
    policy: RetryPolicy,
}

impl<'a, R: PortRegistry> ReenumerationWatcher<'a, R> {
    pub fn new(registry: &'a R, policy: RetryPolicy) -> Self {
        ReenumerationWatcher { registry, policy }
    }

    /// Poll the serial-port registry until a port of the unit identified by
    /// `fragment` carries the `target` persona.
    ///
    /// Sleeps one interval before every scan, since the old identity is
    /// still registered right after the command. A failed scan counts as
    /// an attempt. Running out of attempts is [DfuError::Timeout].
    pub fn await_persona_change(
        &self,
        fragment: &str,
        target: Persona,
    ) -> DfuResult<PersonaChange> {
        info!("Waiting for the {target} persona of {fragment}...");
        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            thread::sleep(self.policy.interval);
            debug!("Scanning serial ports (attempt {attempt}/{attempts})");
            let ports = match self.registry.list() {
                Ok(ports) => ports,
                Err(e) => {
                    debug!("Listing serial ports failed: {e}");
                    continue;
                }
            };

            let mut matching = ports_for_fragment(&ports, fragment);
            matching.sort_by(|a, b| a.path.cmp(&b.path));
            for port in &matching {
                debug!(
                    "Serial port: {} has serial number: {}",
                    port.path,
                    port.serial_number.as_deref().unwrap_or_default()
                );
            }
            let found = matching.into_iter().find_map(|port| {
                let serial_number = port.serial_number.as_deref()?;
                (Persona::of(serial_number) == target).then(|| PersonaChange {
                    serial_number: serial_number.to_string(),
                    port: port.path.clone(),
                })
            });
            if let Some(change) = found {
                info!(
                    "Device entered {target} mode as {} on {}",
                    change.serial_number, change.port
                );
                return Ok(change);
            }
        }

        error!("Serial port not found, unable to determine {target} mode of {fragment}");
        Err(DfuError::Timeout { attempts })
    }
}
