use std::{thread, time::Duration};

use log::debug;

use crate::error::*;

pub const DEFAULT_VENDOR_ID: u16 = 0x1915;
pub const DEFAULT_PRODUCT_ID: u16 = 0x910a;

/// Interface string of the bridge's vendor bulk transport.
pub const BULK_INTERFACE_NAME: &str = "CMSIS-DAP v2";

/// Baud rate used for the modem's SMP serial link and the port probe.
pub const SERIAL_BAUD_RATE: u32 = 1_000_000;

/// Image number given to `mcumgr image upload -n`.
pub const UPLOAD_IMAGE_NUMBER: u32 = 2;

/// Bounded, fixed-interval retry loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        RetryPolicy { attempts, interval }
    }

    /// Single attempt, no sleeping.
    pub const fn once() -> Self {
        RetryPolicy::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a non-retriable error, or
    /// the attempts are used up. Sleeps `interval` between attempts.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> DfuResult<T>,
    ) -> DfuResult<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_retriable() && attempt < attempts => {
                    debug!(
                        "{what}: {err}, retrying (attempt {attempt}/{attempts})..."
                    );
                    thread::sleep(self.interval);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct DfuConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub bulk_interface: String,
    /// Device lookups right after a mode switch.
    pub locate_retry: RetryPolicy,
    /// Serial-port polling while waiting for re-enumeration.
    pub watch_retry: RetryPolicy,
    pub reset_settle: Duration,
    pub staged_settle: Duration,
    pub baud_rate: u32,
    pub probe_timeout: Duration,
    pub usb_timeout: Duration,
    pub nrfutil: String,
    pub mcumgr: String,
    pub upload_image_number: u32,
}

impl Default for DfuConfig {
    fn default() -> Self {
        DfuConfig {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            serial_number: None,
            bulk_interface: BULK_INTERFACE_NAME.to_string(),
            locate_retry: RetryPolicy::new(5, Duration::from_secs(10)),
            watch_retry: RetryPolicy::new(30, Duration::from_secs(5)),
            reset_settle: Duration::from_secs(2),
            staged_settle: Duration::from_secs(5),
            baud_rate: SERIAL_BAUD_RATE,
            probe_timeout: Duration::from_secs(1),
            usb_timeout: Duration::from_millis(5000),
            nrfutil: "nrfutil".to_string(),
            mcumgr: "mcumgr".to_string(),
            upload_image_number: UPLOAD_IMAGE_NUMBER,
        }
    }
}

impl DfuConfig {
    /// Same settings without any waiting, for tests.
    #[cfg(test)]
    pub(crate) fn instant() -> Self {
        DfuConfig {
            locate_retry: RetryPolicy::new(3, Duration::ZERO),
            watch_retry: RetryPolicy::new(3, Duration::ZERO),
            reset_settle: Duration::ZERO,
            staged_settle: Duration::ZERO,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_until_found() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;
        let res = policy.run("lookup", || {
            calls += 1;
            if calls < 3 {
                Err(DfuError::NotFound("device".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(res.unwrap(), 3);
    }

    #[test]
    fn test_retry_exhausted() {
        let policy = RetryPolicy::new(4, Duration::ZERO);
        let mut calls = 0;
        let res: DfuResult<()> = policy.run("lookup", || {
            calls += 1;
            Err(DfuError::NotFound("device".into()))
        });
        assert!(matches!(res, Err(DfuError::NotFound(_))));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_ambiguous_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;
        let res: DfuResult<()> = policy.run("lookup", || {
            calls += 1;
            Err(DfuError::Ambiguous {
                serials: vec!["A".into(), "B".into()],
            })
        });
        assert!(matches!(res, Err(DfuError::Ambiguous { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_once() {
        let mut calls = 0;
        let _: DfuResult<()> = RetryPolicy::once().run("lookup", || {
            calls += 1;
            Err(DfuError::NotFound("device".into()))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_defaults() {
        let config = DfuConfig::default();
        assert_eq!(config.vendor_id, 0x1915);
        assert_eq!(config.product_id, 0x910a);
        assert_eq!(config.locate_retry.attempts, 5);
        assert_eq!(config.locate_retry.interval, Duration::from_secs(10));
        assert_eq!(config.watch_retry.attempts, 30);
        assert_eq!(config.watch_retry.interval, Duration::from_secs(5));
    }
}
