//! Engine error types

use std::path::PathBuf;
use thiserror::Error;

use crate::audio::AudioError;

/// Errors surfaced by the recording and playback engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// The hardware stream could not be opened or started
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The hardware stream failed while a session was active
    #[error("Audio stream interrupted: {reason}")]
    StreamInterrupted {
        reason: String,
        /// Partial capture that was finalized, if anything had been written
        salvaged: Option<PathBuf>,
    },

    /// A recording session is already open somewhere in this process
    #[error("A recording session is already active")]
    SessionActive,

    /// The requested command does not apply in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// A container file that does not follow the 44-byte PCM layout
    #[error("Invalid container file: {0}")]
    InvalidContainer(String),

    /// Tracks played together must share one sample rate and channel count
    #[error("Format mismatch: expected {expected_rate}Hz/{expected_channels}ch, got {rate}Hz/{channels}ch")]
    FormatMismatch {
        expected_rate: u32,
        expected_channels: u16,
        rate: u32,
        channels: u16,
    },

    #[error("Invalid track: {0}")]
    InvalidTrack(String),

    #[error("Track not found: {0}")]
    TrackNotFound(String),

    #[error("Invalid split: {0}")]
    InvalidSplit(String),

    #[error("Preferences error: {0}")]
    Preferences(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AudioError> for EngineError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::StreamError(reason) => EngineError::StreamInterrupted {
                reason,
                salvaged: None,
            },
            other => EngineError::DeviceUnavailable(other.to_string()),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
