//! The engine handle
//!
//! [`Engine`] owns one output stream (rendering the track mixer), the
//! recording session, the playback engine and the latency compensator. It is
//! created explicitly with [`Engine::initialize`] and torn down with
//! [`Engine::shutdown`]; collaborators receive it by reference.

mod clock;
mod overdub;
mod playback;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tokio::runtime::Handle;
use uuid::Uuid;

use crate::audio::{
    AudioBackend, AudioStream, ClipSource, FaultCallback, Mixer, RecordingSession, SessionMeter,
    SessionState, StopOutcome, StreamFault, TrackPlayer, Voice,
};
use crate::config::{AudioFormat, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::latency::{LatencyCompensator, LatencyDiagnostics, LatencyProbe};
use crate::models::{LocalPosition, Track};
use crate::settings::Preferences;
use crate::state::{AudioStorage, TrackStore};
use crate::waveform;

pub use clock::MasterClock;
pub use playback::{PlaybackEngine, TransportStatus};

use overdub::ActiveOverdub;

/// Everything a UI polls at refresh rate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub is_playing: bool,
    pub position_ms: i64,
    pub total_ms: i64,
    pub is_recording: bool,
    pub recorded_ms: i64,
    pub peak: f32,
    pub session_state: SessionState,
    /// Diagnostics of the most recent take
    pub latency: Option<LatencyDiagnostics>,
}

pub struct Engine {
    config: EngineConfig,
    backend: Arc<dyn AudioBackend>,
    mixer: Mixer,
    output: Option<Box<dyn AudioStream>>,
    output_faults: mpsc::Receiver<StreamFault>,
    session: RecordingSession,
    playback: PlaybackEngine,
    compensator: LatencyCompensator,
    overdub: Option<ActiveOverdub>,
    last_latency: Option<LatencyDiagnostics>,
}

impl Engine {
    /// Build every component and start the output stream
    pub fn initialize(
        config: EngineConfig,
        backend: Arc<dyn AudioBackend>,
        preferences: Box<dyn Preferences>,
        runtime: Handle,
    ) -> EngineResult<Self> {
        config.validate()?;

        let (mixer, renderer) = Mixer::new(config.output_channels);
        let (fault_tx, output_faults) = mpsc::channel();
        let on_fault: FaultCallback = Arc::new(move |fault: StreamFault| {
            let _ = fault_tx.send(fault);
        });

        let output_format = AudioFormat::new(config.format.sample_rate, config.output_channels);
        let mut output = backend
            .open_output(output_format, renderer.into_callback(), on_fault)
            .map_err(|e| {
                log::error!("Failed to open output stream: {}", e);
                EngineError::DeviceUnavailable(e.to_string())
            })?;
        output.start().map_err(|e| {
            log::error!("Failed to start output stream: {}", e);
            EngineError::DeviceUnavailable(e.to_string())
        })?;

        let session =
            RecordingSession::new(backend.clone(), config.format, config.ring_capacity_samples);
        let playback =
            PlaybackEngine::new(runtime, Duration::from_millis(config.tick_interval_ms));
        let compensator = LatencyCompensator::new(preferences);

        log::info!(
            "Engine initialized on {} backend ({}Hz, {}ch capture, {}ch output)",
            backend.name(),
            config.format.sample_rate,
            config.format.channels,
            config.output_channels
        );

        Ok(Self {
            config,
            backend,
            mixer,
            output: Some(output),
            output_faults,
            session,
            playback,
            compensator,
            overdub: None,
            last_latency: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    pub fn meter(&self) -> SessionMeter {
        self.session.meter()
    }

    /// Load every track's clip and hand the list to the mixer and the
    /// playback engine
    pub fn prepare(&mut self, tracks: &[Track], storage: &dyn AudioStorage) -> EngineResult<()> {
        if self.overdub.is_some() {
            return Err(EngineError::InvalidState(
                "cannot change tracks while overdubbing".into(),
            ));
        }

        let mut voices = Vec::with_capacity(tracks.len());
        let mut players: Vec<(Track, Arc<dyn TrackPlayer>)> = Vec::with_capacity(tracks.len());
        for track in tracks {
            let path = storage.resolve(&track.audio_ref)?;
            let clip = ClipSource::load(&path, track, self.config.format)?;
            let voice = Voice::new(&clip);
            voices.push(voice.clone());
            let player: Arc<dyn TrackPlayer> = voice;
            players.push((track.clone(), player));
        }

        self.mixer.set_voices(voices)?;
        self.playback.prepare(players);
        Ok(())
    }

    /// Waveform overview of a track's audible window
    pub fn track_waveform(
        &self,
        track: &Track,
        storage: &dyn AudioStorage,
        bars: usize,
    ) -> EngineResult<Vec<f32>> {
        let clip = ClipSource::load(storage.resolve(&track.audio_ref)?, track, self.config.format)?;
        Ok(waveform::peaks(&clip, bars))
    }

    pub fn play(&self) {
        self.playback.play();
    }

    pub fn pause(&self) {
        self.playback.pause();
    }

    pub fn seek_to(&self, position_ms: i64) {
        self.playback.seek_to(position_ms);
    }

    pub fn set_track_muted(&self, id: Uuid, muted: bool) -> EngineResult<()> {
        self.playback.set_track_muted(id, muted)
    }

    pub fn set_track_volume(&self, id: Uuid, volume: f32) -> EngineResult<()> {
        self.playback.set_track_volume(id, volume)
    }

    pub fn track_positions(&self) -> Vec<(Uuid, LocalPosition)> {
        self.playback.track_positions()
    }

    /// Start a plain take: no playback, no compensation. Returns the path
    /// being written.
    pub async fn start_recording(&mut self, storage: &dyn AudioStorage) -> EngineResult<PathBuf> {
        storage.ensure_dir()?;
        let path = storage.allocate_take_path()?;
        self.session.start(&path)?;

        let timeout = Duration::from_millis(self.config.first_buffer_timeout_ms);
        if !self.session.meter().await_first_buffer(timeout).await {
            log::warn!("Input pipeline not hot after {:?}, recording anyway", timeout);
        }
        if let Err(e) = self.session.open_write_gate() {
            let _ = self.session.stop();
            return Err(e);
        }
        Ok(path)
    }

    /// Stop a plain take
    pub fn stop_recording(&mut self) -> EngineResult<StopOutcome> {
        if self.overdub.is_some() {
            return Err(EngineError::InvalidState(
                "an overdub is in progress; stop it instead".into(),
            ));
        }
        self.session.stop()
    }

    /// Gather what the latency estimate needs from the running streams
    fn latency_probe(&self) -> LatencyProbe {
        LatencyProbe {
            backend: self.backend.name().to_string(),
            report: self.backend.probe(),
            format: self.config.format,
            hardware_output_ms: self.output.as_ref().and_then(|stream| stream.latency_ms()),
            hardware_input_ms: self.session.input_latency_ms(),
        }
    }

    /// Current latency estimate, as a take started now would see it
    pub fn latency_diagnostics(&self) -> LatencyDiagnostics {
        let audible = self.playback.has_material_from(self.playback.position_ms());
        self.compensator
            .diagnose(&self.latency_probe(), self.config.pre_roll_ms, audible)
    }

    pub fn manual_offset_ms(&self) -> i64 {
        self.compensator.manual_offset_ms()
    }

    /// Persist the manual offset; returns the clamped value stored
    pub fn set_manual_offset_ms(&mut self, offset_ms: i64) -> EngineResult<i64> {
        self.compensator.set_manual_offset_ms(offset_ms)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let meter = self.session.meter();
        EngineSnapshot {
            is_playing: self.playback.is_playing(),
            position_ms: self.playback.position_ms(),
            total_ms: self.playback.total_ms(),
            is_recording: self.session.is_active(),
            recorded_ms: meter.recorded_ms(),
            peak: meter.peak(),
            session_state: self.session.state(),
            latency: self.last_latency.clone(),
        }
    }

    /// Housekeeping for the controlling context: reclaims retired mixer
    /// state and surfaces asynchronous stream faults.
    ///
    /// An output fault halts the transport. An input fault force-stops the
    /// session. Either way a running overdub's partial capture is saved as a
    /// track before the error is returned.
    pub fn poll(
        &mut self,
        store: &mut dyn TrackStore,
        storage: &dyn AudioStorage,
    ) -> EngineResult<()> {
        self.mixer.collect_garbage();

        let mut output_fault = None;
        while let Ok(fault) = self.output_faults.try_recv() {
            log::error!("Output stream fault: {}", fault.reason);
            output_fault.get_or_insert(fault);
        }
        if let Some(fault) = output_fault {
            return Err(self.output_interrupted(fault, store, storage)?);
        }

        let Some(interruption) = self.session.poll_fault()? else {
            return Ok(());
        };

        let salvaged = match (interruption.salvaged, self.overdub.take()) {
            (Some(take), Some(active)) => {
                self.playback.set_recording(false);
                self.playback.pause();
                let path = take.path.clone();
                self.promote_take(take, &active, store, storage)?
                    .map(|track| {
                        log::info!("Salvaged take saved as track {}", track.id);
                        path
                    })
            }
            (Some(take), None) => Some(take.path),
            (None, active) => {
                if active.is_some() {
                    self.playback.set_recording(false);
                    self.playback.pause();
                }
                None
            }
        };

        Err(EngineError::StreamInterrupted {
            reason: interruption.reason,
            salvaged,
        })
    }

    /// Halt the transport after the output device went away. A running
    /// overdub is stopped and its take kept as a track.
    fn output_interrupted(
        &mut self,
        fault: StreamFault,
        store: &mut dyn TrackStore,
        storage: &dyn AudioStorage,
    ) -> EngineResult<EngineError> {
        let salvaged = if self.overdub.is_some() {
            match self.stop_overdub(store, storage)? {
                Some(track) => Some(storage.resolve(&track.audio_ref)?),
                None => None,
            }
        } else {
            None
        };
        self.playback.pause();

        Ok(EngineError::StreamInterrupted {
            reason: fault.reason,
            salvaged,
        })
    }

    /// Stop everything. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.overdub = None;
        self.playback.set_recording(false);
        self.playback.shutdown();
        if let Err(e) = self.session.stop() {
            log::warn!("Error stopping recording session: {}", e);
        }
        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.stop() {
                log::warn!("Error stopping output stream: {}", e);
            }
            log::info!("Engine shut down");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
