use thiserror::Error;

use crate::ChipTarget;

pub type DfuResult<T> = Result<T, DfuError>;

#[derive(Debug, Error)]
pub enum DfuError {
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("Transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Invalid manifest: {0}")]
    Json(#[from] serde_json::Error),

    /// No device or port matched.
    #[error("{0} not found")]
    NotFound(String),

    /// Several devices matched and no serial number was given.
    #[error(
        "Multiple devices found ({}), please specify the serial number",
        .serials.join(", ")
    )]
    Ambiguous { serials: Vec<String> },

    /// Malformed or missing reply on the bulk endpoint.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Image verification failed: {0}")]
    VerificationFailed(String),

    /// An external tool exited with a non-zero status.
    #[error("Command failed ({status}): {command}")]
    ToolFailed { command: String, status: String },

    #[error("Re-enumeration not observed after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Expected {expected} serial ports for {serial}, found {found}")]
    PortCount {
        serial: String,
        expected: usize,
        found: usize,
    },

    #[error("Failed to open serial port {port}, is a terminal open? ({reason})")]
    PortBusy { port: String, reason: String },

    #[error(
        "The device is in {persona_chip} bootloader mode, but {requested} was requested"
    )]
    WrongPersona {
        persona_chip: ChipTarget,
        requested: ChipTarget,
    },

    #[error("{command} is not supported on {chip}")]
    UnsupportedCommand {
        command: &'static str,
        chip: ChipTarget,
    },

    #[error("Unrecognized update archive: {0}")]
    UnrecognizedArchive(String),
}

impl DfuError {
    /// Only a missing device is worth looking for again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DfuError::NotFound(_))
    }

    /// Errors after which the device state is unknown or the image is bad;
    /// nothing should be attempted afterwards.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DfuError::Timeout { .. } | DfuError::VerificationFailed(_)
        )
    }

    /// Raised before anything was sent to the device.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DfuError::Ambiguous { .. }
                | DfuError::Configuration(_)
                | DfuError::UnrecognizedArchive(_)
                | DfuError::WrongPersona { .. }
                | DfuError::UnsupportedCommand { .. }
        )
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            DfuError::Timeout { .. } => 3,
            DfuError::VerificationFailed(_) => 4,
            e if e.is_configuration() => 2,
            _ => 1,
        }
    }
}
