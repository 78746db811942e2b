//! Error types for gsm-modem

use crate::at::ErrorCause;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out waiting for response to {command}")]
    Timeout { command: String },

    #[error("Modem rejected {command}: {cause}")]
    Modem { command: String, cause: ErrorCause },

    #[error("SIM requires a PIN but none is configured")]
    PinRequired,

    #[error("Modem session is not connected")]
    NotConnected,

    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Error cause reported by the modem, if this error carries one
    pub fn cause(&self) -> Option<&ErrorCause> {
        match self {
            Error::Modem { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
