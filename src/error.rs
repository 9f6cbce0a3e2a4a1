//! Error types shared across the driver, devices and channels.

use thiserror::Error;

/// Errors surfaced by driver, device and channel operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No matching radio callback arrived within the bounded wait.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Unexpected callback type, mismatched characteristic or a
    /// non-success native status code.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A required characteristic, descriptor or device is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation was aborted by the caller before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The channel or bridge is bound to a connection that no longer
    /// exists. Stale channels must fail rather than target a new
    /// connection.
    #[error("channel closed")]
    Closed,

    /// Failure reported by the radio collaborator itself.
    #[error("radio error: {0}")]
    Radio(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Protocol error from a non-success native status code.
    pub fn gatt_status(context: &str, status: u8) -> Self {
        Error::Protocol(format!("{context}: gatt status {status}"))
    }
}
