use thiserror::Error;

use crate::time::HardwareError;

/// Errors surfaced to the embedding application
///
/// Protocol data errors never show up here: they are rejected inside the
/// state machine that received them and only show up in statistics.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timestamp error: {0}")]
    Timestamp(String),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("BMCA conflict: {0}")]
    BmcaConflict(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new timestamp error
    pub fn timestamp(msg: impl Into<String>) -> Self {
        Error::Timestamp(msg.into())
    }

    /// Creates a new BMCA conflict error
    pub fn bmca_conflict(msg: impl Into<String>) -> Self {
        Error::BmcaConflict(msg.into())
    }
}
