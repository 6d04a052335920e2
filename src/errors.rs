use std::io;
use thiserror::Error;

/// Everything that can go wrong between the motor panel and the peripheral.
///
/// An acknowledgement timeout is not an error: a frame that was fully
/// written but never confirmed is reported as [`crate::Delivery::Unconfirmed`].
#[derive(Debug, Error)]
pub enum RigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("link lost before the frame was delivered")]
    LinkLost,
    #[error("motor {motor}: {reason}")]
    Validation { motor: usize, reason: String },
    #[error("not connected")]
    NotConnected,
    #[error("busy: {0}")]
    Busy(String),
}

impl RigError {
    /// Discovery that ended without a device (cancelled or nothing in range)
    /// is reported to the user as information, not as a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RigError::Discovery(_))
    }
}

/// Failures of the underlying transport (GATT, serial port).
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("adapter unavailable: {0}")]
    Adapter(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("service {0} not found on device")]
    ServiceNotFound(String),
    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("link is not connected")]
    NotConnected,
    #[error("link closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RigError>;
