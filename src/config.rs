//! Engine configuration
//!
//! Loaded from an optional JSON file; every field has a default so a missing
//! file or a partial file both work.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Default capture sample rate
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Bits per sample of every container file the engine writes
pub const BITS_PER_SAMPLE: u16 = 16;

/// Bytes per sample on disk
pub const BYTES_PER_SAMPLE: u16 = BITS_PER_SAMPLE / 8;

/// Most channels a capture or output stream may have
pub const MAX_CHANNELS: u16 = 32;

/// Fixed sample rate and channel count shared by a session and every track
/// played alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes of one interleaved frame on disk
    pub fn block_align(&self) -> u16 {
        self.channels.saturating_mul(BYTES_PER_SAMPLE)
    }

    /// Bytes per second on disk
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate.saturating_mul(self.block_align() as u32)
    }

    pub fn ms_to_frames(&self, ms: i64) -> i64 {
        ms * self.sample_rate as i64 / 1000
    }

    pub fn frames_to_ms(&self, frames: i64) -> i64 {
        frames * 1000 / self.sample_rate as i64
    }

    /// Duration of `bytes` of PCM data in milliseconds
    pub fn bytes_to_ms(&self, bytes: u64) -> i64 {
        match self.byte_rate() {
            0 => 0,
            rate => (bytes.saturating_mul(1000) / rate as u64) as i64,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, 1)
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capture format (also required of every track played back)
    pub format: AudioFormat,
    /// Channel count of the playback output stream
    pub output_channels: u16,
    /// Ring buffer capacity between the capture callback and the writer, in samples
    pub ring_capacity_samples: usize,
    /// Bound on waiting for the input pipeline to go hot
    pub first_buffer_timeout_ms: u64,
    /// Bound on waiting for playback to become audible
    pub audible_timeout_ms: u64,
    /// Period of the playback position tick (~30 Hz)
    pub tick_interval_ms: u64,
    /// Fixed lead-in added to the measured playback start-up delay
    pub pre_roll_ms: i64,
    /// Where takes are written
    pub recordings_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            output_channels: 2,
            ring_capacity_samples: 131_072,
            first_buffer_timeout_ms: 2000,
            audible_timeout_ms: 1000,
            tick_interval_ms: 33,
            pre_roll_ms: 0,
            recordings_dir: default_recordings_dir(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        if self.format.sample_rate == 0 {
            return Err(EngineError::Config("sample_rate must be positive".into()));
        }
        if self.format.channels == 0 || self.output_channels == 0 {
            return Err(EngineError::Config("channel counts must be positive".into()));
        }
        if self.format.channels > MAX_CHANNELS || self.output_channels > MAX_CHANNELS {
            return Err(EngineError::Config(format!(
                "at most {} channels are supported",
                MAX_CHANNELS
            )));
        }
        if self.ring_capacity_samples < self.format.channels as usize {
            return Err(EngineError::Config(
                "ring buffer must hold at least one frame".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(EngineError::Config("tick_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Default recordings directory under the user's local data dir
pub fn default_recordings_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("layerdeck")
        .join("recordings")
}
