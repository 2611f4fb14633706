//! Multi-track playback scheduling
//!
//! One player per track, all coordinated against the [`MasterClock`]. On
//! `play()` every unmuted track is either started at its local position,
//! left stopped (already finished), or given a delayed-start timer that
//! fires when the timeline reaches its offset. Timers are tokio tasks; every
//! `play`/`pause`/`seek_to` aborts them and bumps a generation counter so a
//! timer that already woke up can tell it is stale.
//!
//! A periodic tick republishes the global position, handles the loop region
//! and stops the transport at the timeline end, unless a recording is in
//! progress.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::audio::TrackPlayer;
use crate::error::{EngineError, EngineResult};
use crate::models::{total_duration_ms, LocalPosition, Track};

use super::clock::MasterClock;

/// Poll period of [`PlaybackEngine::await_audible`]
const AUDIBLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Transport state published for lock-free readers
#[derive(Debug, Default)]
pub struct TransportStatus {
    playing: AtomicBool,
    recording: AtomicBool,
    position_ms: AtomicI64,
    total_ms: AtomicI64,
}

impl TransportStatus {
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Global position as of the last tick or transport command
    pub fn position_ms(&self) -> i64 {
        self.position_ms.load(Ordering::Acquire)
    }

    pub fn total_ms(&self) -> i64 {
        self.total_ms.load(Ordering::Acquire)
    }
}

struct Slot {
    track: Track,
    player: Arc<dyn TrackPlayer>,
}

struct PlaybackInner {
    slots: Vec<Slot>,
    clock: MasterClock,
    total_ms: i64,
    pending: Vec<AbortHandle>,
    tick: Option<AbortHandle>,
    generation: u64,
    loop_region: Option<(i64, i64)>,
    tick_interval: Duration,
}

impl PlaybackInner {
    /// Abort every delayed start and invalidate any that already woke up
    fn cancel_pending(&mut self) {
        for handle in self.pending.drain(..) {
            handle.abort();
        }
        self.generation += 1;
    }

    fn cancel_tick(&mut self) {
        if let Some(tick) = self.tick.take() {
            tick.abort();
        }
    }

    fn recompute_total(&mut self) {
        self.total_ms = total_duration_ms(self.slots.iter().map(|slot| &slot.track));
    }

    fn slot_index(&self, id: Uuid) -> EngineResult<usize> {
        self.slots
            .iter()
            .position(|slot| slot.track.id == id)
            .ok_or_else(|| EngineError::TrackNotFound(id.to_string()))
    }
}

/// Cloneable handle on the playback engine
#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Arc<Mutex<PlaybackInner>>,
    status: Arc<TransportStatus>,
    runtime: Handle,
}

/// What timer and tick tasks hold, so they never keep the engine alive
#[derive(Clone)]
struct WeakPlayback {
    inner: Weak<Mutex<PlaybackInner>>,
    status: Arc<TransportStatus>,
    runtime: Handle,
}

impl WeakPlayback {
    fn upgrade(&self) -> Option<PlaybackEngine> {
        Some(PlaybackEngine {
            inner: self.inner.upgrade()?,
            status: self.status.clone(),
            runtime: self.runtime.clone(),
        })
    }
}

impl PlaybackEngine {
    pub fn new(runtime: Handle, tick_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PlaybackInner {
                slots: Vec::new(),
                clock: MasterClock::new(),
                total_ms: 0,
                pending: Vec::new(),
                tick: None,
                generation: 0,
                loop_region: None,
                tick_interval,
            })),
            status: Arc::new(TransportStatus::default()),
            runtime,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downgrade(&self) -> WeakPlayback {
        WeakPlayback {
            inner: Arc::downgrade(&self.inner),
            status: self.status.clone(),
            runtime: self.runtime.clone(),
        }
    }

    pub fn status(&self) -> Arc<TransportStatus> {
        self.status.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.status.is_playing()
    }

    /// Live global position from the clock
    pub fn position_ms(&self) -> i64 {
        self.lock().clock.position_ms()
    }

    pub fn total_ms(&self) -> i64 {
        self.lock().total_ms
    }

    /// Replace the track list. Stops the transport; the position is kept
    /// when it still falls inside the new timeline.
    pub fn prepare(&self, tracks: Vec<(Track, Arc<dyn TrackPlayer>)>) {
        let mut inner = self.lock();
        self.halt_locked(&mut inner);
        for slot in &inner.slots {
            slot.player.pause();
        }

        inner.slots = tracks
            .into_iter()
            .map(|(track, player)| {
                player.set_volume(track.volume);
                player.set_muted(track.muted);
                Slot { track, player }
            })
            .collect();
        inner.recompute_total();

        let position = inner.clock.position_ms().clamp(0, inner.total_ms);
        self.hold_locked(&mut inner, position);
        log::info!(
            "Prepared {} tracks, timeline {}ms",
            inner.slots.len(),
            inner.total_ms
        );
    }

    /// Start (or restart) playback from the current position, or from 0 when
    /// the position is at or past the end of the timeline
    pub fn play(&self) {
        let mut inner = self.lock();
        let mut position = inner.clock.position_ms();
        if position >= inner.total_ms {
            position = 0;
        }
        self.run_from_locked(&mut inner, position);
        log::debug!("Playback started at {}ms", position);
    }

    /// Stop timers and the tick, freeze the clock and pause every player
    pub fn pause(&self) {
        let mut inner = self.lock();
        let position = self.halt_locked(&mut inner);
        log::debug!("Playback paused at {}ms", position);
    }

    /// Move to `position_ms`, clamped into the timeline
    pub fn seek_to(&self, position_ms: i64) {
        let mut inner = self.lock();
        let position = position_ms.clamp(0, inner.total_ms);
        if inner.clock.is_running() {
            self.run_from_locked(&mut inner, position);
        } else {
            self.hold_locked(&mut inner, position);
        }
    }

    /// While set, the transport keeps running past the timeline end
    pub fn set_recording(&self, recording: bool) {
        self.status.recording.store(recording, Ordering::Release);
    }

    /// Loop playback between `start_ms` and `end_ms`
    pub fn set_loop_region(&self, start_ms: i64, end_ms: i64) -> EngineResult<()> {
        if start_ms < 0 || end_ms <= start_ms {
            return Err(EngineError::InvalidState(format!(
                "invalid loop region {}..{}ms",
                start_ms, end_ms
            )));
        }
        self.lock().loop_region = Some((start_ms, end_ms));
        Ok(())
    }

    pub fn clear_loop_region(&self) {
        self.lock().loop_region = None;
    }

    pub fn set_track_muted(&self, id: Uuid, muted: bool) -> EngineResult<()> {
        let mut inner = self.lock();
        let index = inner.slot_index(id)?;
        inner.slots[index].track.muted = muted;
        inner.slots[index].player.set_muted(muted);
        inner.recompute_total();
        self.status.total_ms.store(inner.total_ms, Ordering::Release);

        if inner.clock.is_running() {
            if muted {
                inner.slots[index].player.pause();
            } else {
                let position = inner.clock.position_ms();
                if let Some(timer) = self.schedule_slot(&inner, index, position, Instant::now()) {
                    inner.pending.push(timer);
                }
            }
        }
        Ok(())
    }

    pub fn set_track_volume(&self, id: Uuid, volume: f32) -> EngineResult<()> {
        let mut inner = self.lock();
        let index = inner.slot_index(id)?;
        let slot = &mut inner.slots[index];
        slot.track.set_volume(volume);
        slot.player.set_volume(slot.track.volume);
        Ok(())
    }

    /// Each track's state relative to the clock's current position
    pub fn track_positions(&self) -> Vec<(Uuid, LocalPosition)> {
        let inner = self.lock();
        let position = inner.clock.position_ms();
        inner
            .slots
            .iter()
            .map(|slot| (slot.track.id, slot.track.local_position(position)))
            .collect()
    }

    /// Whether any unmuted track is audible at or after `position_ms`
    pub fn has_material_from(&self, position_ms: i64) -> bool {
        self.lock().slots.iter().any(|slot| {
            !slot.track.muted
                && slot.track.effective_duration_ms() > 0
                && slot.track.end_ms() > position_ms
        })
    }

    /// Wait until some player reports it is actually rendering, bounded by
    /// `timeout`. Returns false on timeout.
    pub async fn await_audible(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let rendering = self
                .lock()
                .slots
                .iter()
                .any(|slot| !slot.track.muted && slot.player.is_rendering());
            if rendering {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(AUDIBLE_POLL_INTERVAL).await;
        }
    }

    /// Stop everything and drop the track list
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        self.halt_locked(&mut inner);
        inner.slots.clear();
        inner.recompute_total();
        self.status.total_ms.store(0, Ordering::Release);
    }

    /// Anchor the clock at `position` and schedule every track from there
    fn run_from_locked(&self, inner: &mut PlaybackInner, position: i64) {
        inner.cancel_pending();
        let anchor = inner.clock.start_at(position);

        let timers: Vec<AbortHandle> = (0..inner.slots.len())
            .filter_map(|index| self.schedule_slot(inner, index, position, anchor))
            .collect();
        inner.pending.extend(timers);

        self.start_tick(inner);
        self.status.playing.store(true, Ordering::Release);
        self.publish(inner, position);
    }

    /// Start, hold or arm the delayed start of one track for a clock running
    /// from `position` as of `now`
    fn schedule_slot(
        &self,
        inner: &PlaybackInner,
        index: usize,
        position: i64,
        now: Instant,
    ) -> Option<AbortHandle> {
        let slot = &inner.slots[index];
        match slot.track.local_position(position) {
            LocalPosition::Muted | LocalPosition::Finished => {
                slot.player.pause();
                None
            }
            LocalPosition::Active { local_ms } => {
                slot.player.seek_to(local_ms);
                slot.player.play();
                None
            }
            LocalPosition::Pending { starts_in_ms } => {
                slot.player.pause();
                slot.player.seek_to(0);

                let weak = self.downgrade();
                let generation = inner.generation;
                let deadline = now + Duration::from_millis(starts_in_ms as u64);
                let task = self.runtime.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(engine) = weak.upgrade() {
                        engine.fire_delayed_start(generation, index);
                    }
                });
                Some(task.abort_handle())
            }
        }
    }

    fn fire_delayed_start(&self, generation: u64, index: usize) {
        let inner = self.lock();
        if inner.generation != generation || !inner.clock.is_running() {
            return;
        }
        if let Some(slot) = inner.slots.get(index) {
            if !slot.track.muted {
                slot.player.seek_to(0);
                slot.player.play();
                log::trace!("Delayed start of track {}", slot.track.id);
            }
        }
    }

    fn start_tick(&self, inner: &mut PlaybackInner) {
        inner.cancel_tick();
        let weak = self.downgrade();
        let generation = inner.generation;
        let period = inner.tick_interval;

        let task = self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(engine) = weak.upgrade() else { break };
                if !engine.on_tick(generation) {
                    break;
                }
            }
        });
        inner.tick = Some(task.abort_handle());
    }

    /// Returns whether this tick task should keep running
    fn on_tick(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || !inner.clock.is_running() {
            return false;
        }
        let position = inner.clock.position_ms();

        if let Some((start, end)) = inner.loop_region {
            if position >= end {
                log::trace!("Loop back to {}ms", start);
                self.run_from_locked(&mut inner, start);
                return false;
            }
        }

        if position >= inner.total_ms && !self.status.is_recording() {
            let end = inner.total_ms;
            self.halt_locked(&mut inner);
            self.hold_locked(&mut inner, end);
            log::debug!("Reached end of timeline at {}ms", end);
            return false;
        }

        self.publish(&inner, position);
        true
    }

    /// Cancel timers and tick, freeze the clock, pause players
    fn halt_locked(&self, inner: &mut PlaybackInner) -> i64 {
        inner.cancel_pending();
        inner.cancel_tick();
        let position = inner.clock.stop();
        for slot in &inner.slots {
            slot.player.pause();
        }
        self.status.playing.store(false, Ordering::Release);
        self.publish(inner, position);
        position
    }

    /// Seek every player to its local position for a stopped clock
    fn hold_locked(&self, inner: &mut PlaybackInner, position: i64) {
        inner.clock.set_position(position);
        for slot in &inner.slots {
            let local = (position - slot.track.offset_ms).clamp(0, slot.track.effective_duration_ms());
            slot.player.seek_to(local);
        }
        self.publish(inner, position);
    }

    fn publish(&self, inner: &PlaybackInner, position: i64) {
        self.status.position_ms.store(position, Ordering::Release);
        self.status.total_ms.store(inner.total_ms, Ordering::Release);
    }
}
