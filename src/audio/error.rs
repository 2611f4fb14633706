//! Audio backend error types

use thiserror::Error;

/// Errors that can occur while opening or driving a hardware stream
#[derive(Error, Debug, Clone)]
pub enum AudioError {
    /// No device available for the requested direction
    #[error("No audio device available: {0}")]
    NoDevice(String),

    /// Permission to use the device was refused
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The device is held by someone else
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Failed to build the stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start/stop the stream
    #[error("Failed to control audio stream: {0}")]
    StreamControlError(String),

    /// Stream error while running
    #[error("Audio stream error: {0}")]
    StreamError(String),

    /// The backend cannot deliver the requested format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The backend was not compiled into this build
    #[error("Backend not available in this build: {0}")]
    BackendUnavailable(String),
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
