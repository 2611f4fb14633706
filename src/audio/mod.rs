//! Audio capture, file writing and playback rendering
//!
//! This module provides:
//! - A lock-free frame ring buffer between the capture callback and the writer thread
//! - Capability-polymorphic hardware backends (simulated, PipeWire)
//! - The recording session state machine with its pipeline-hot / write-gate handshake
//! - The container file writer and splitter
//! - The track mixer that renders every player into the output stream

mod backend;
mod clip;
mod error;
mod mixer;
#[cfg(feature = "pipewire")]
mod pipewire;
mod ring;
mod session;
mod signal;
mod simulated;
mod split;
mod wav;

pub use backend::{
    select_backend, AudioBackend, AudioStream, BackendKind, CallbackAction, DeviceReport,
    FaultCallback, InputCallback, OutputCallback, OutputDeviceKind, StreamFault,
};
pub use clip::ClipSource;
pub use error::{AudioError, AudioResult};
pub use mixer::{Mixer, MixerRenderer, TrackPlayer, Voice};
#[cfg(feature = "pipewire")]
pub use pipewire::PipeWireBackend;
pub use ring::{frame_ring, FrameConsumer, FrameProducer};
pub use session::{
    CapturedTake, RecordingSession, SessionMeter, SessionState, StopOutcome, StreamInterruption,
};
pub use signal::FirstBufferSignal;
pub use simulated::{SignalShape, SimulatedBackend, SimulatedConfig};
pub use split::split_file;
pub use wav::{FileWriter, WavHeader, HEADER_LEN};
