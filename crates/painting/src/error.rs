//! Engine error taxonomy

use thiserror::Error;

use crate::device::DeviceError;
use crate::types::{LayerId, Region};

/// Result alias used throughout the engine
pub type PaintResult<T> = Result<T, PaintError>;

#[derive(Debug, Error)]
pub enum PaintError {
    /// A layer or memory budget is exhausted. Recoverable: free a layer and retry.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid layer handle {0}")]
    InvalidHandle(LayerId),

    #[error("Invalid undo entry handle {0}")]
    InvalidEntry(u64),

    #[error("Region {region:?} exceeds {width}x{height} texture")]
    RegionOutOfBounds {
        region: Region,
        width: u32,
        height: u32,
    },

    /// Fatal: the device stopped making progress or reported loss
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Fatal: the device rejected or failed to execute a submission
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Failed to load plugin '{module}': {reason}")]
    PluginLoadFailure { module: String, reason: String },

    /// Fatal: an undo entry no longer matches the layer it was taken from
    #[error("Undo ledger corrupted: {0}")]
    LedgerCorrupted(String),

    #[error("Invalid mesh: {0}")]
    InvalidMesh(String),

    #[error(transparent)]
    Config(#[from] painter_config::ConfigError),

    #[error(transparent)]
    Ipc(#[from] painter_ipc::IpcError),
}

impl PaintError {
    /// Errors after which the engine must shut down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost(_)
                | Self::SubmissionFailed(_)
                | Self::PluginLoadFailure { .. }
                | Self::LedgerCorrupted(_)
        )
    }
}

impl From<DeviceError> for PaintError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory { .. } => Self::ResourceExhausted(err.to_string()),
            DeviceError::OutOfBounds {
                region,
                width,
                height,
            } => Self::RegionOutOfBounds {
                region,
                width,
                height,
            },
            DeviceError::Timeout(_) | DeviceError::Lost(_) => Self::DeviceLost(err.to_string()),
            _ => Self::SubmissionFailed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryKind;
    use std::time::Duration;

    #[test]
    fn test_device_error_mapping() {
        let err: PaintError = DeviceError::Timeout(Duration::from_millis(5)).into();
        assert!(matches!(err, PaintError::DeviceLost(_)));
        assert!(err.is_fatal());

        let err: PaintError = DeviceError::OutOfMemory {
            kind: MemoryKind::DeviceImage,
            requested: 10,
            available: 5,
        }
        .into();
        assert!(matches!(err, PaintError::ResourceExhausted(_)));
        assert!(!err.is_fatal());
    }
}
