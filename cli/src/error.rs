use t91x_dfu::DfuError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("DFU error: {0}")]
    Dfu(#[from] DfuError),
    #[error("Invalid chip, use --chip nrf53|nrf91 or pass an --image")]
    NoChip,
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Dfu(err) => err.exit_code(),
            CliError::NoChip => 2,
        }
    }

    /// The run stopped part way through an update.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CliError::Dfu(err) if err.is_fatal())
    }
}
