//! Overdub coordination
//!
//! Recording a new take while the existing tracks play. The sequence is:
//! allocate the take file, open the session, wait for the input pipeline to
//! go hot, start playback and open the write gate at the same instant, then
//! measure how long playback took to become audible and compute the
//! compensation. On stop the take becomes a new track whose head is trimmed
//! by the compensation and whose offset is where the clock was when
//! recording began.

use std::time::Duration;

use tokio::time::Instant;

use crate::audio::{CapturedTake, StopOutcome};
use crate::error::{EngineError, EngineResult};
use crate::latency::LatencyDiagnostics;
use crate::models::Track;
use crate::state::{AudioStorage, TrackStore};

use super::Engine;

/// What an overdub in progress remembers until it is stopped
#[derive(Debug, Clone)]
pub(super) struct ActiveOverdub {
    /// Global position when the gate opened
    start_ms: i64,
    compensation_ms: i64,
}

impl Engine {
    pub fn is_overdubbing(&self) -> bool {
        self.overdub.is_some()
    }

    /// Start recording a take against the current timeline.
    ///
    /// Bounded waits that time out are logged and the overdub continues with
    /// what it has. Returns the latency decision for this take.
    pub async fn start_overdub(
        &mut self,
        storage: &dyn AudioStorage,
    ) -> EngineResult<LatencyDiagnostics> {
        if self.overdub.is_some() || self.session.is_active() {
            return Err(EngineError::SessionActive);
        }

        storage.ensure_dir()?;
        let path = storage.allocate_take_path()?;
        self.session.start(&path)?;

        let first_buffer_timeout = Duration::from_millis(self.config.first_buffer_timeout_ms);
        if !self
            .session
            .meter()
            .await_first_buffer(first_buffer_timeout)
            .await
        {
            log::warn!(
                "Input pipeline not hot after {:?}, overdubbing anyway",
                first_buffer_timeout
            );
        }

        let mut start_ms = self.playback.position_ms();
        if start_ms >= self.playback.total_ms() {
            start_ms = 0;
        }
        let audible = self.playback.has_material_from(start_ms);
        let probe = self.latency_probe();

        self.playback.set_recording(true);
        if audible {
            self.playback.play();
            start_ms = self.playback.position_ms();
        } else {
            self.playback.seek_to(start_ms);
        }
        let gate_opened = Instant::now();
        if let Err(e) = self.session.open_write_gate() {
            self.abort_overdub();
            return Err(e);
        }

        let mut startup_ms = 0;
        if audible {
            let audible_timeout = Duration::from_millis(self.config.audible_timeout_ms);
            if self.playback.await_audible(audible_timeout).await {
                startup_ms = gate_opened.elapsed().as_millis() as i64;
            } else {
                log::warn!("Playback not audible after {:?}", audible_timeout);
            }
        }

        let diagnostics =
            self.compensator
                .diagnose(&probe, self.config.pre_roll_ms + startup_ms, audible);
        log::info!(
            "Overdub started at {}ms, compensation {}ms (playback start-up {}ms)",
            start_ms,
            diagnostics.compensation_ms,
            startup_ms
        );

        self.overdub = Some(ActiveOverdub {
            start_ms,
            compensation_ms: diagnostics.compensation_ms,
        });
        self.last_latency = Some(diagnostics.clone());
        Ok(diagnostics)
    }

    /// Stop the overdub and save the take as a new track.
    ///
    /// Returns `None` when nothing usable was captured; the attempt leaves no
    /// file and no track behind.
    pub fn stop_overdub(
        &mut self,
        store: &mut dyn TrackStore,
        storage: &dyn AudioStorage,
    ) -> EngineResult<Option<Track>> {
        let active = self
            .overdub
            .take()
            .ok_or_else(|| EngineError::InvalidState("no overdub in progress".into()))?;

        self.playback.set_recording(false);
        self.playback.pause();

        match self.session.stop()? {
            StopOutcome::Captured(take) => self.promote_take(take, &active, store, storage),
            StopOutcome::NothingCaptured | StopOutcome::NotRecording => {
                log::info!("Overdub captured nothing");
                Ok(None)
            }
        }
    }

    fn abort_overdub(&mut self) {
        self.overdub = None;
        self.playback.set_recording(false);
        self.playback.pause();
        if let Err(e) = self.session.stop() {
            log::warn!("Error stopping aborted overdub: {}", e);
        }
    }

    /// Turn a finalized capture into a track, or delete it when the
    /// compensation leaves nothing audible
    pub(super) fn promote_take(
        &self,
        take: CapturedTake,
        active: &ActiveOverdub,
        store: &mut dyn TrackStore,
        storage: &dyn AudioStorage,
    ) -> EngineResult<Option<Track>> {
        let audio_ref = storage.audio_ref_for(&take.path)?;

        if active.compensation_ms >= take.duration_ms {
            log::info!(
                "Take of {}ms is shorter than its {}ms compensation, discarding",
                take.duration_ms,
                active.compensation_ms
            );
            storage.delete(&audio_ref)?;
            return Ok(None);
        }

        let track = Track::new(
            audio_ref,
            store.next_display_order(),
            active.start_ms,
            active.compensation_ms,
            0,
            take.duration_ms,
        )?;
        store.insert(track.clone())?;

        log::info!(
            "Saved take as track {} at {}ms ({}ms, {}ms trimmed)",
            track.id,
            track.offset_ms,
            track.duration_ms,
            track.trim_start_ms
        );
        Ok(Some(track))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{engine_with, write_take};
    use crate::audio::{SessionState, SimulatedConfig};
    use crate::config::EngineConfig;
    use crate::error::EngineError;
    use crate::models::Track;
    use crate::state::{AudioStorage, JsonTrackStore, RecordingsDir, TrackStore};
    use crate::test_support::serial;
    use std::time::Duration;

    fn project(dir: &std::path::Path) -> (RecordingsDir, JsonTrackStore) {
        let storage = RecordingsDir::new(dir.join("recordings"));
        let mut store = JsonTrackStore::open(dir.join("tracks.json")).unwrap();
        write_take(storage.root(), "base.wav", 1000);
        store
            .insert(Track::new("base.wav", 0, 0, 0, 0, 1000).unwrap())
            .unwrap();
        (storage, store)
    }

    #[tokio::test]
    async fn test_overdub_creates_compensated_track() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let (storage, mut store) = project(dir.path());
        let mut engine =
            engine_with(dir.path(), EngineConfig::default(), SimulatedConfig::default()).unwrap();
        engine.prepare(&store.list(), &storage).unwrap();

        let diagnostics = engine.start_overdub(&storage).await.unwrap();
        assert!(diagnostics.audible);
        // Speaker heuristics: ~10.7ms output, 40ms input, plus measured start-up
        assert!(diagnostics.compensation_ms >= 50, "{:?}", diagnostics);
        assert!(engine.is_overdubbing());

        let snapshot = engine.snapshot();
        assert!(snapshot.is_playing);
        assert!(snapshot.is_recording);
        assert_eq!(snapshot.session_state, SessionState::Gated);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let track = engine
            .stop_overdub(&mut store, &storage)
            .unwrap()
            .expect("take saved");

        assert_eq!(track.offset_ms, 0);
        assert_eq!(track.trim_start_ms, diagnostics.compensation_ms);
        assert_eq!(track.display_order, 1);
        assert!(track.duration_ms >= 300);
        assert!(storage.resolve(&track.audio_ref).unwrap().exists());
        assert_eq!(store.list().len(), 2);
        assert!(!engine.snapshot().is_playing);
    }

    #[tokio::test]
    async fn test_overdub_past_end_starts_from_zero_and_keeps_running() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let (storage, mut store) = project(dir.path());
        let mut engine =
            engine_with(dir.path(), EngineConfig::default(), SimulatedConfig::default()).unwrap();
        engine.prepare(&store.list(), &storage).unwrap();
        engine.seek_to(1000);

        engine.start_overdub(&storage).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;
        // The clock runs past the 1000ms timeline while recording
        assert!(engine.snapshot().is_playing);
        assert!(engine.playback().position_ms() > 1000);

        let track = engine.stop_overdub(&mut store, &storage).unwrap().unwrap();
        assert_eq!(track.offset_ms, 0);
    }

    #[tokio::test]
    async fn test_take_shorter_than_compensation_is_discarded() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let (storage, mut store) = project(dir.path());
        let config = EngineConfig {
            pre_roll_ms: 5000,
            ..Default::default()
        };
        let mut engine = engine_with(dir.path(), config, SimulatedConfig::default()).unwrap();
        engine.prepare(&store.list(), &storage).unwrap();

        engine.start_overdub(&storage).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.stop_overdub(&mut store, &storage).unwrap(), None);

        assert_eq!(store.list().len(), 1);
        assert_eq!(storage.list_recordings().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_overdub_is_rejected() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let (storage, mut store) = project(dir.path());
        let mut engine =
            engine_with(dir.path(), EngineConfig::default(), SimulatedConfig::default()).unwrap();

        engine.start_overdub(&storage).await.unwrap();
        assert!(matches!(
            engine.start_overdub(&storage).await,
            Err(EngineError::SessionActive)
        ));
        assert!(matches!(
            engine.stop_recording(),
            Err(EngineError::InvalidState(_))
        ));

        // Nothing to play: the take lands at 0 with only input compensation
        tokio::time::sleep(Duration::from_millis(200)).await;
        let track = engine.stop_overdub(&mut store, &storage).unwrap().unwrap();
        assert_eq!(track.offset_ms, 0);
        assert_eq!(track.trim_start_ms, 40);
        assert!(matches!(
            engine.stop_overdub(&mut store, &storage),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_fault_salvages_overdub() {
        let _guard = serial();
        let dir = tempfile::tempdir().unwrap();
        let (storage, mut store) = project(dir.path());
        let simulated = SimulatedConfig {
            fault_after: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let mut engine = engine_with(dir.path(), EngineConfig::default(), simulated).unwrap();
        engine.prepare(&store.list(), &storage).unwrap();

        engine.start_overdub(&storage).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        match engine.poll(&mut store, &storage) {
            Err(EngineError::StreamInterrupted { salvaged, .. }) => {
                assert!(salvaged.expect("partial take kept").exists());
            }
            other => panic!("expected an interruption, got {:?}", other),
        }
        assert!(!engine.is_overdubbing());
        assert!(!engine.snapshot().is_playing);
        assert_eq!(store.list().len(), 2);

        // No automatic reopen; the next poll is quiet
        assert!(engine.poll(&mut store, &storage).is_ok());
    }
}
