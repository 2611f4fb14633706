//! Recording session state machine
//!
//! A session owns one hardware input stream, one frame ring and one file
//! writer. The capture callback only ever touches atomics and the ring
//! producer; everything else runs on the controlling context.
//!
//! ```text
//! Idle --start--> Opening --first buffer--> Hot --open_write_gate--> Gated
//!                                            |                         |
//!                                            +---------stop------------+--> Stopped
//! ```
//!
//! A stream fault after start force-stops the session (see
//! [`RecordingSession::poll_fault`]). Only one session may hold the capture
//! device in the whole process.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AudioFormat;
use crate::error::{EngineError, EngineResult};

use super::backend::{AudioBackend, AudioStream, CallbackAction, FaultCallback, StreamFault};
use super::ring::{frame_ring, FrameProducer};
use super::signal::FirstBufferSignal;
use super::wav::FileWriter;

/// Process-wide capture claim
static CAPTURE_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Held for as long as a session has the capture device open
struct CaptureClaim;

impl CaptureClaim {
    fn acquire() -> EngineResult<Self> {
        CAPTURE_CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| CaptureClaim)
            .map_err(|_| EngineError::SessionActive)
    }
}

impl Drop for CaptureClaim {
    fn drop(&mut self) {
        CAPTURE_CLAIMED.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    /// Stream requested, no buffer delivered yet
    Opening,
    /// Input pipeline delivered its first buffer
    Hot,
    /// Frames are being persisted
    Gated,
    Stopped,
}

/// A finalized, non-empty capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedTake {
    pub path: PathBuf,
    pub duration_ms: i64,
    /// PCM bytes after the header
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Captured(CapturedTake),
    /// Zero bytes were written; the file has been deleted
    NothingCaptured,
    /// No session was open
    NotRecording,
}

/// A session that was force-stopped by a stream fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInterruption {
    pub reason: String,
    /// The partial capture, finalized, when anything had been written
    pub salvaged: Option<CapturedTake>,
}

impl StreamInterruption {
    pub fn into_error(self) -> EngineError {
        EngineError::StreamInterrupted {
            reason: self.reason,
            salvaged: self.salvaged.map(|take| take.path),
        }
    }
}

/// State shared with the capture callback
#[derive(Debug, Default)]
struct CallbackFlags {
    hot: FirstBufferSignal,
    gate_open: AtomicBool,
    peak_bits: AtomicU32,
}

/// Cheap, cloneable read side of a session for metering and waits
#[derive(Debug, Clone)]
pub struct SessionMeter {
    flags: Arc<CallbackFlags>,
    bytes_written: Arc<AtomicU64>,
    format: AudioFormat,
}

impl SessionMeter {
    /// Peak absolute amplitude of the most recent input buffer
    pub fn peak(&self) -> f32 {
        f32::from_bits(self.flags.peak_bits.load(Ordering::Relaxed))
    }

    pub fn is_hot(&self) -> bool {
        self.flags.hot.is_fired()
    }

    pub fn is_gated(&self) -> bool {
        self.flags.gate_open.load(Ordering::Acquire)
    }

    /// Elapsed recording time derived from bytes persisted
    pub fn recorded_ms(&self) -> i64 {
        self.format
            .bytes_to_ms(self.bytes_written.load(Ordering::Relaxed))
    }

    /// Wait for the first buffer of the current session, bounded by `timeout`
    pub async fn await_first_buffer(&self, timeout: Duration) -> bool {
        self.flags.hot.wait(timeout).await
    }
}

struct ActiveCapture {
    _claim: CaptureClaim,
    stream: Box<dyn AudioStream>,
    writer: FileWriter,
    faults: mpsc::Receiver<StreamFault>,
}

pub struct RecordingSession {
    backend: Arc<dyn AudioBackend>,
    format: AudioFormat,
    ring_capacity_samples: usize,
    meter: SessionMeter,
    active: Option<ActiveCapture>,
    stopped: bool,
}

impl RecordingSession {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        format: AudioFormat,
        ring_capacity_samples: usize,
    ) -> Self {
        Self {
            backend,
            format,
            ring_capacity_samples,
            meter: SessionMeter {
                flags: Arc::new(CallbackFlags::default()),
                bytes_written: Arc::new(AtomicU64::new(0)),
                format,
            },
            active: None,
            stopped: false,
        }
    }

    pub fn state(&self) -> SessionState {
        match &self.active {
            Some(_) if self.meter.is_gated() => SessionState::Gated,
            Some(_) if self.meter.is_hot() => SessionState::Hot,
            Some(_) => SessionState::Opening,
            None if self.stopped => SessionState::Stopped,
            None => SessionState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn meter(&self) -> SessionMeter {
        self.meter.clone()
    }

    /// Path of the file being written, while a session is open
    pub fn path(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.writer.path())
    }

    /// Latency reported by the running input stream, if the backend measures it
    pub fn input_latency_ms(&self) -> Option<f64> {
        self.active
            .as_ref()
            .and_then(|active| active.stream.latency_ms())
    }

    /// Open `path`, open and start the input stream and spawn the writer.
    ///
    /// On failure nothing is left behind: the file is deleted and the session
    /// stays idle.
    pub fn start(&mut self, path: impl AsRef<Path>) -> EngineResult<()> {
        if self.active.is_some() {
            return Err(EngineError::SessionActive);
        }
        let claim = CaptureClaim::acquire()?;
        let path = path.as_ref();

        let flags = &self.meter.flags;
        flags.hot.reset();
        flags.gate_open.store(false, Ordering::Release);
        flags.peak_bits.store(0, Ordering::Relaxed);
        self.stopped = false;

        let mut writer =
            FileWriter::with_counter(path, self.format, self.meter.bytes_written.clone())?;
        let (producer, consumer) = frame_ring(self.ring_capacity_samples, self.format.channels);

        let (fault_tx, faults) = mpsc::channel();
        let on_fault: FaultCallback = Arc::new(move |fault: StreamFault| {
            let _ = fault_tx.send(fault);
        });

        let mut stream = match self.backend.open_input(
            self.format,
            capture_callback(flags.clone(), producer),
            on_fault,
        ) {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to open input stream: {}", e);
                discard(writer);
                return Err(EngineError::DeviceUnavailable(e.to_string()));
            }
        };

        if let Err(e) = writer.start(consumer) {
            drop(stream);
            discard(writer);
            return Err(e);
        }

        if let Err(e) = stream.start() {
            log::error!("Failed to start input stream: {}", e);
            let _ = stream.stop();
            drop(stream);
            discard(writer);
            return Err(EngineError::DeviceUnavailable(e.to_string()));
        }

        log::info!(
            "Recording session opened on {} backend: {} ({}Hz, {}ch)",
            self.backend.name(),
            path.display(),
            self.format.sample_rate,
            self.format.channels
        );
        self.active = Some(ActiveCapture {
            _claim: claim,
            stream,
            writer,
            faults,
        });
        Ok(())
    }

    /// Wait until the input pipeline is hot. Returns false on timeout or when
    /// no session is open.
    pub async fn await_first_buffer(&self, timeout: Duration) -> bool {
        if self.active.is_none() {
            return false;
        }
        self.meter.await_first_buffer(timeout).await
    }

    /// Start persisting frames from the next callback on
    pub fn open_write_gate(&mut self) -> EngineResult<()> {
        if self.active.is_none() {
            return Err(EngineError::InvalidState(
                "no recording session to gate".into(),
            ));
        }
        if !self.meter.is_hot() {
            log::warn!("Opening write gate before the first input buffer arrived");
        }
        if !self.meter.flags.gate_open.swap(true, Ordering::AcqRel) {
            log::debug!("Write gate open");
        }
        Ok(())
    }

    /// Stop the stream, drain and finalize the file.
    ///
    /// A second call is a no-op reporting [`StopOutcome::NotRecording`].
    pub fn stop(&mut self) -> EngineResult<StopOutcome> {
        match self.active.take() {
            Some(active) => self.finish(active),
            None => Ok(StopOutcome::NotRecording),
        }
    }

    /// Check the out-of-band fault channel. A reported fault force-stops the
    /// session and finalizes whatever was captured.
    pub fn poll_fault(&mut self) -> EngineResult<Option<StreamInterruption>> {
        let fault = match &self.active {
            Some(active) => match active.faults.try_recv() {
                Ok(fault) => fault,
                Err(_) => return Ok(None),
            },
            None => return Ok(None),
        };

        log::error!("Input stream interrupted: {}", fault.reason);
        let salvaged = match self.stop()? {
            StopOutcome::Captured(take) => {
                log::warn!(
                    "Salvaged {}ms of partial capture in {}",
                    take.duration_ms,
                    take.path.display()
                );
                Some(take)
            }
            _ => None,
        };

        Ok(Some(StreamInterruption {
            reason: fault.reason,
            salvaged,
        }))
    }

    fn finish(&mut self, active: ActiveCapture) -> EngineResult<StopOutcome> {
        let ActiveCapture {
            _claim,
            mut stream,
            mut writer,
            faults: _,
        } = active;

        self.meter.flags.gate_open.store(false, Ordering::Release);
        if let Err(e) = stream.stop() {
            log::warn!("Error stopping input stream: {}", e);
        }
        drop(stream);
        self.stopped = true;

        let path = writer.path().to_path_buf();
        let bytes = match writer.finish() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to finalize {}: {}", path.display(), e);
                drop(writer);
                remove_quietly(&path);
                return Err(e);
            }
        };
        drop(writer);

        if bytes == 0 {
            log::info!("Nothing captured, removing {}", path.display());
            remove_quietly(&path);
            return Ok(StopOutcome::NothingCaptured);
        }

        let duration_ms = self.format.bytes_to_ms(bytes);
        log::info!(
            "Recording session stopped: {} ({}ms, {} bytes)",
            path.display(),
            duration_ms,
            bytes
        );
        Ok(StopOutcome::Captured(CapturedTake {
            path,
            duration_ms,
            bytes,
        }))
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.active.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("Error stopping recording session on drop: {}", e);
            }
        }
    }
}

/// Build the real-time capture callback
fn capture_callback(
    flags: Arc<CallbackFlags>,
    mut producer: FrameProducer,
) -> super::backend::InputCallback {
    Box::new(move |buffer: &[f32]| {
        let peak = buffer.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
        flags.peak_bits.store(peak.to_bits(), Ordering::Relaxed);

        // Buffers up to and including the one that makes the pipeline hot are
        // never persisted unless the gate was already forced open
        flags.hot.fire();
        if flags.gate_open.load(Ordering::Acquire) {
            producer.write(buffer);
        }
        CallbackAction::Continue
    })
}

fn discard(mut writer: FileWriter) {
    let path = writer.path().to_path_buf();
    let _ = writer.finish();
    drop(writer);
    remove_quietly(&path);
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{SignalShape, SimulatedBackend, SimulatedConfig};
    use crate::audio::wav::WavHeader;
    use crate::test_support::serial;
    use std::time::Instant;

    fn session_with(config: SimulatedConfig) -> RecordingSession {
        RecordingSession::new(
            Arc::new(SimulatedBackend::new(config)),
            AudioFormat::new(44100, 1),
            44100,
        )
    }

    #[tokio::test]
    async fn test_gated_session_captures_and_stop_is_idempotent() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let mut session = session_with(SimulatedConfig::default());
        assert_eq!(session.state(), SessionState::Idle);

        session.start(&path).unwrap();
        assert!(session.await_first_buffer(Duration::from_secs(2)).await);
        assert_eq!(session.state(), SessionState::Hot);

        session.open_write_gate().unwrap();
        assert_eq!(session.state(), SessionState::Gated);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(session.meter().peak() > 0.0);

        let take = match session.stop().unwrap() {
            StopOutcome::Captured(take) => take,
            other => panic!("expected a capture, got {:?}", other),
        };
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(take.duration_ms > 0);
        assert_eq!(take.bytes % 2, 0);

        let header = WavHeader::read_from(&path).unwrap();
        assert_eq!(header.data_len as u64, take.bytes);
        assert_eq!(header.sample_rate, 44100);

        assert_eq!(session.stop().unwrap(), StopOutcome::NotRecording);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let mut first = session_with(SimulatedConfig::default());
        let mut second = session_with(SimulatedConfig::default());

        first.start(dir.path().join("a.wav")).unwrap();
        assert!(matches!(
            first.start(dir.path().join("b.wav")),
            Err(EngineError::SessionActive)
        ));
        assert!(matches!(
            second.start(dir.path().join("c.wav")),
            Err(EngineError::SessionActive)
        ));
        assert!(!dir.path().join("c.wav").exists());

        first.stop().unwrap();
        second.start(dir.path().join("c.wav")).unwrap();
        second.stop().unwrap();
    }

    #[test]
    fn test_open_failure_leaves_nothing_behind() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let mut session = session_with(SimulatedConfig {
            fail_open: true,
            ..Default::default()
        });

        assert!(matches!(
            session.start(&path),
            Err(EngineError::DeviceUnavailable(_))
        ));
        assert!(!path.exists());
        assert_eq!(session.state(), SessionState::Idle);

        // The claim was released
        let mut healthy = session_with(SimulatedConfig::default());
        healthy.start(&path).unwrap();
        healthy.stop().unwrap();
    }

    #[tokio::test]
    async fn test_ungated_buffers_are_discarded() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let mut session = session_with(SimulatedConfig::default());

        session.start(&path).unwrap();
        assert!(session.await_first_buffer(Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(session.stop().unwrap(), StopOutcome::NothingCaptured);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_first_buffer_waits_for_slow_device() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_with(SimulatedConfig {
            startup_delay: Duration::from_millis(200),
            signal: SignalShape::Silence,
            ..Default::default()
        });

        let started = Instant::now();
        session.start(dir.path().join("take.wav")).unwrap();
        assert_eq!(session.state(), SessionState::Opening);
        assert!(session.await_first_buffer(Duration::from_secs(2)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "resolved early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(400), "resolved late: {:?}", elapsed);
        session.stop().unwrap();
    }

    #[tokio::test]
    async fn test_fault_finalizes_partial_capture() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let mut session = session_with(SimulatedConfig {
            fault_after: Some(Duration::from_millis(80)),
            ..Default::default()
        });

        session.start(&path).unwrap();
        assert!(session.await_first_buffer(Duration::from_secs(2)).await);
        session.open_write_gate().unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let interruption = session.poll_fault().unwrap().expect("fault reported");
        let take = interruption.salvaged.expect("partial capture kept");
        assert_eq!(take.path, path);
        assert!(take.duration_ms > 0);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(WavHeader::read_from(&path).unwrap().data_len as u64, take.bytes);

        // No automatic reopen
        assert!(!session.is_active());
        assert_eq!(session.poll_fault().unwrap(), None);
    }

    #[tokio::test]
    async fn test_fault_before_gate_discards_capture() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let mut session = session_with(SimulatedConfig {
            fault_after: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        session.start(&path).unwrap();
        assert!(path.exists());
        assert!(session.await_first_buffer(Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The gate never opened, so nothing reached the file
        let interruption = session.poll_fault().unwrap().expect("fault reported");
        assert_eq!(interruption.salvaged, None);
        assert!(!path.exists());
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.poll_fault().unwrap(), None);
    }

    #[test]
    fn test_gate_requires_session() {
        let _guard = serial();
        let mut session = session_with(SimulatedConfig::default());
        assert!(matches!(
            session.open_write_gate(),
            Err(EngineError::InvalidState(_))
        ));
    }
}
