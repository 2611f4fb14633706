//! Track/take data model and the derived timeline
//!
//! All times are milliseconds. A track is audible on the global timeline
//! exactly during `[offset_ms, offset_ms + effective_duration_ms)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// A take placed on the timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: Uuid,
    /// Opaque reference to the stored audio file (a file name in the storage dir)
    pub audio_ref: String,
    pub display_order: u32,
    /// Timeline start
    pub offset_ms: i64,
    /// Non-destructive trim from the head of the underlying file
    pub trim_start_ms: i64,
    /// Non-destructive trim from the tail of the underlying file
    pub trim_end_ms: i64,
    /// Full length of the underlying file
    pub duration_ms: i64,
    pub muted: bool,
    /// Gain in [0.0, 1.0]
    pub volume: f32,
    pub created: DateTime<Utc>,
}

/// Where a track is relative to a global timeline position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LocalPosition {
    /// The track has not started yet; it becomes audible after this many ms
    Pending { starts_in_ms: i64 },
    /// The track is audible at this local position (0-based within its trimmed window)
    Active { local_ms: i64 },
    /// The track's window has already ended
    Finished,
    /// Muted tracks are never scheduled
    Muted,
}

impl Track {
    /// Create a new track, validating the trim and offset invariants
    pub fn new(
        audio_ref: impl Into<String>,
        display_order: u32,
        offset_ms: i64,
        trim_start_ms: i64,
        trim_end_ms: i64,
        duration_ms: i64,
    ) -> EngineResult<Self> {
        let track = Self {
            id: Uuid::new_v4(),
            audio_ref: audio_ref.into(),
            display_order,
            offset_ms,
            trim_start_ms,
            trim_end_ms,
            duration_ms,
            muted: false,
            volume: 1.0,
            created: Utc::now(),
        };
        track.validate()?;
        Ok(track)
    }

    /// Check `offset ≥ 0`, `trims ≥ 0`, `trim_start + trim_end ≤ duration`
    pub fn validate(&self) -> EngineResult<()> {
        if self.offset_ms < 0 {
            return Err(EngineError::InvalidTrack(format!(
                "negative offset {}ms",
                self.offset_ms
            )));
        }
        if self.duration_ms < 0 || self.trim_start_ms < 0 || self.trim_end_ms < 0 {
            return Err(EngineError::InvalidTrack(
                "duration and trims must be non-negative".into(),
            ));
        }
        if self.trim_start_ms + self.trim_end_ms > self.duration_ms {
            return Err(EngineError::InvalidTrack(format!(
                "trim {}+{}ms exceeds duration {}ms",
                self.trim_start_ms, self.trim_end_ms, self.duration_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(EngineError::InvalidTrack(format!(
                "volume {} outside [0, 1]",
                self.volume
            )));
        }
        Ok(())
    }

    /// Underlying duration minus both trims
    pub fn effective_duration_ms(&self) -> i64 {
        self.duration_ms - self.trim_start_ms - self.trim_end_ms
    }

    /// Exclusive end of the audible window on the global timeline
    pub fn end_ms(&self) -> i64 {
        self.offset_ms + self.effective_duration_ms()
    }

    pub fn is_audible_at(&self, global_ms: i64) -> bool {
        !self.muted && global_ms >= self.offset_ms && global_ms < self.end_ms()
    }

    /// Map a global position into this track's local position space
    pub fn local_position(&self, global_ms: i64) -> LocalPosition {
        if self.muted {
            return LocalPosition::Muted;
        }
        let local = global_ms - self.offset_ms;
        if local < 0 {
            LocalPosition::Pending {
                starts_in_ms: -local,
            }
        } else if local >= self.effective_duration_ms() {
            LocalPosition::Finished
        } else {
            LocalPosition::Active { local_ms: local }
        }
    }

    pub fn set_trim(&mut self, trim_start_ms: i64, trim_end_ms: i64) -> EngineResult<()> {
        let mut updated = self.clone();
        updated.trim_start_ms = trim_start_ms;
        updated.trim_end_ms = trim_end_ms;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn set_offset(&mut self, offset_ms: i64) -> EngineResult<()> {
        if offset_ms < 0 {
            return Err(EngineError::InvalidTrack(format!(
                "negative offset {}ms",
                offset_ms
            )));
        }
        self.offset_ms = offset_ms;
        Ok(())
    }

    /// Set gain, clamped into [0, 1]
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }
}

/// Total timeline length: the latest end over unmuted tracks, or 0
pub fn total_duration_ms<'a>(tracks: impl IntoIterator<Item = &'a Track>) -> i64 {
    tracks
        .into_iter()
        .filter(|t| !t.muted)
        .map(Track::end_ms)
        .max()
        .unwrap_or(0)
        .max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(offset: i64, duration: i64) -> Track {
        Track::new("a.wav", 0, offset, 0, 0, duration).unwrap()
    }

    #[test]
    fn test_audible_window_matches_effective_duration() {
        for offset in [0, 1, 250, 5000] {
            for duration in [0, 1, 999, 4000] {
                for trim_start in [0, 1, duration / 3, duration] {
                    for trim_end in [0, 1, duration / 2] {
                        if trim_start + trim_end > duration {
                            assert!(Track::new("a.wav", 0, offset, trim_start, trim_end, duration)
                                .is_err());
                            continue;
                        }
                        let t = Track::new("a.wav", 0, offset, trim_start, trim_end, duration)
                            .unwrap();
                        let effective = duration - trim_start - trim_end;
                        assert_eq!(t.effective_duration_ms(), effective);

                        assert!(!t.is_audible_at(offset - 1));
                        assert_eq!(t.is_audible_at(offset), effective > 0);
                        if effective > 0 {
                            assert!(t.is_audible_at(offset + effective - 1));
                        }
                        assert!(!t.is_audible_at(offset + effective));
                    }
                }
            }
        }
    }

    #[test]
    fn test_invalid_tracks_rejected() {
        assert!(Track::new("a.wav", 0, -1, 0, 0, 100).is_err());
        assert!(Track::new("a.wav", 0, 0, -5, 0, 100).is_err());
        assert!(Track::new("a.wav", 0, 0, 60, 50, 100).is_err());
        assert!(Track::new("a.wav", 0, 0, 50, 50, 100).is_ok());
    }

    #[test]
    fn test_set_trim_keeps_old_value_on_error() {
        let mut t = track(0, 1000);
        t.set_trim(100, 200).unwrap();
        assert!(t.set_trim(900, 200).is_err());
        assert_eq!((t.trim_start_ms, t.trim_end_ms), (100, 200));
        assert_eq!(t.effective_duration_ms(), 700);
    }

    #[test]
    fn test_total_duration_ignores_muted_tracks() {
        let a = track(0, 4000);
        let b = track(2000, 4000);
        let mut c = track(5000, 4000);
        assert_eq!(total_duration_ms([&a, &b, &c]), 9000);

        c.muted = true;
        assert_eq!(total_duration_ms([&a, &b, &c]), 6000);
        assert_eq!(total_duration_ms(std::iter::empty::<&Track>()), 0);
    }

    #[test]
    fn test_local_positions() {
        let tracks = [track(0, 4000), track(2000, 4000), track(5000, 4000)];
        let locals: Vec<_> = tracks.iter().map(|t| t.local_position(6000)).collect();
        assert_eq!(
            locals,
            vec![
                LocalPosition::Finished,
                LocalPosition::Finished,
                LocalPosition::Active { local_ms: 1000 }
            ]
        );
        assert_eq!(
            tracks[2].local_position(1500),
            LocalPosition::Pending { starts_in_ms: 3500 }
        );
    }

    #[test]
    fn test_volume_clamped() {
        let mut t = track(0, 10);
        t.set_volume(1.7);
        assert_eq!(t.volume, 1.0);
        t.set_volume(-0.2);
        assert_eq!(t.volume, 0.0);
    }
}
