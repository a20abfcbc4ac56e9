use thiserror::Error;

/// Errors raised while validating inputs or running the CPU bake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IblError {
    #[error("Invalid bake request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Environment source {id} has no backing pixel data")]
    MissingSourceData { id: u64 },

    #[error("Environment source {id} is malformed: {reason}")]
    InvalidSource { id: u64, reason: String },
}

impl IblError {
    pub(crate) fn invalid_request(reason: impl Into<String>) -> Self {
        IblError::InvalidRequest {
            reason: reason.into(),
        }
    }
}

/// Errors reported by the graphics device while creating or uploading resources.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device or its context was lost. Resources can be rebuilt once a
    /// new device is available.
    #[error("Graphics device lost")]
    Lost,

    #[error("Out of device memory: {0}")]
    OutOfMemory(String),

    #[error("Device validation error: {0}")]
    Validation(String),
}

impl DeviceError {
    /// Whether retrying after the next device-ready signal can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeviceError::Lost)
    }
}
