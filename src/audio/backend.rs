//! Audio backend trait for platform-specific implementations
//!
//! A backend opens low-latency input and output streams with a fixed format
//! and drives a callback from its own audio thread. One backend is selected
//! when the engine is initialised and every stream of that engine comes from
//! it; backends are never mixed mid-session.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::AudioFormat;

use super::error::AudioResult;
use super::simulated::{SimulatedBackend, SimulatedConfig};

/// What a real-time callback asks of its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Capture callback: receives one interleaved f32 buffer per hardware period.
///
/// Runs on the backend's real-time thread: must not allocate, lock or do I/O.
pub type InputCallback = Box<dyn FnMut(&[f32]) -> CallbackAction + Send + 'static>;

/// Render callback: fills one interleaved f32 buffer per hardware period.
pub type OutputCallback = Box<dyn FnMut(&mut [f32]) -> CallbackAction + Send + 'static>;

/// Out-of-band error channel for failures after a stream was opened
pub type FaultCallback = Arc<dyn Fn(StreamFault) + Send + Sync + 'static>;

/// Asynchronous stream failure (device disconnect and similar)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFault {
    pub reason: String,
}

impl StreamFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Kind of an enumerated output device, used for route classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputDeviceKind {
    Bluetooth,
    Usb,
    Wired,
    BuiltInSpeaker,
    Other,
}

/// What the platform reports about its audio devices
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceReport {
    /// Currently enumerated output devices
    pub outputs: Vec<OutputDeviceKind>,
    /// Native hardware buffer size in frames, if reported
    pub native_buffer_frames: Option<u32>,
    /// Native output sample rate, if reported
    pub native_sample_rate: Option<u32>,
    /// Smallest input buffer the platform will hand out, in bytes
    pub min_input_buffer_bytes: Option<u32>,
}

/// A single open hardware stream
pub trait AudioStream: Send {
    /// Request the stream to start delivering callbacks
    fn start(&mut self) -> AudioResult<()>;

    /// Stop callbacks and release the device. Safe to call twice.
    fn stop(&mut self) -> AudioResult<()>;

    /// Latency measured from the stream's own timestamps, when the platform
    /// supports it and the stream is running
    fn latency_ms(&self) -> Option<f64>;

    /// Frames delivered per callback
    fn buffer_frames(&self) -> u32;
}

/// A platform audio backend
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open (but do not start) a capture stream
    fn open_input(
        &self,
        format: AudioFormat,
        on_data: InputCallback,
        on_fault: FaultCallback,
    ) -> AudioResult<Box<dyn AudioStream>>;

    /// Open (but do not start) a render stream
    fn open_output(
        &self,
        format: AudioFormat,
        on_data: OutputCallback,
        on_fault: FaultCallback,
    ) -> AudioResult<Box<dyn AudioStream>>;

    /// Describe the current device situation for the latency heuristics
    fn probe(&self) -> DeviceReport;
}

/// Backend selection, made once at engine initialisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// Thread-driven streams with a generated signal, no hardware
    #[default]
    Simulated,
    /// PipeWire capture and playback
    PipeWire,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simulated" | "sim" => Ok(BackendKind::Simulated),
            "pipewire" | "pw" => Ok(BackendKind::PipeWire),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Build the backend for `kind`
pub fn select_backend(kind: BackendKind) -> AudioResult<Arc<dyn AudioBackend>> {
    match kind {
        BackendKind::Simulated => Ok(Arc::new(SimulatedBackend::new(SimulatedConfig::default()))),
        #[cfg(feature = "pipewire")]
        BackendKind::PipeWire => Ok(Arc::new(super::pipewire::PipeWireBackend::new())),
        #[cfg(not(feature = "pipewire"))]
        BackendKind::PipeWire => Err(super::error::AudioError::BackendUnavailable(
            "built without the `pipewire` feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("simulated".parse::<BackendKind>(), Ok(BackendKind::Simulated));
        assert_eq!("PW".parse::<BackendKind>(), Ok(BackendKind::PipeWire));
        assert!("coreaudio".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_select_simulated() {
        let backend = select_backend(BackendKind::Simulated).unwrap();
        assert_eq!(backend.name(), "simulated");
    }
}
