//! Trim-clipped track audio
//!
//! A clip holds only the audible window `[trim_start, duration - trim_end]`
//! of a track's file, so position 0 of the clip is the first audible sample.

use std::path::Path;
use std::sync::Arc;

use crate::config::AudioFormat;
use crate::error::{EngineError, EngineResult};
use crate::models::Track;

#[derive(Debug, Clone)]
pub struct ClipSource {
    samples: Arc<[f32]>,
    format: AudioFormat,
}

impl ClipSource {
    pub fn from_samples(samples: Vec<f32>, format: AudioFormat) -> Self {
        Self {
            samples: samples.into(),
            format,
        }
    }

    /// Load the audible window of `track` from `path`.
    ///
    /// The file must use the engine's sample rate; clips are never resampled.
    pub fn load(path: impl AsRef<Path>, track: &Track, expected: AudioFormat) -> EngineResult<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        if spec.sample_rate != expected.sample_rate {
            return Err(EngineError::FormatMismatch {
                expected_rate: expected.sample_rate,
                expected_channels: expected.channels,
                rate: spec.sample_rate,
                channels: spec.channels,
            });
        }
        let format = AudioFormat::new(spec.sample_rate, spec.channels);

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max_val))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        let channels = format.channels.max(1) as usize;
        let total_frames = samples.len() / channels;
        let start = (format.ms_to_frames(track.trim_start_ms) as usize).min(total_frames);
        let window_end = format
            .ms_to_frames(track.duration_ms - track.trim_end_ms)
            .max(0) as usize;
        let end = window_end.min(total_frames).max(start);

        log::debug!(
            "Loaded clip {} frames {}..{} of {}",
            path.display(),
            start,
            end,
            total_frames
        );
        Ok(Self {
            samples: samples[start * channels..end * channels].into(),
            format,
        })
    }

    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }

    pub fn duration_ms(&self) -> i64 {
        self.format.frames_to_ms(self.frames() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_ramp(path: &Path, sample_rate: u32, frames: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample((i % 1000) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_clip_is_trimmed_at_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_ramp(&path, 1000, 4000);

        let track = Track::new("a.wav", 0, 0, 500, 1000, 4000).unwrap();
        let clip = ClipSource::load(&path, &track, AudioFormat::new(1000, 1)).unwrap();

        assert_eq!(clip.duration_ms(), track.effective_duration_ms());
        assert_eq!(clip.frames(), 2500);
        // First sample is the one at trim_start
        assert_eq!(clip.samples()[0], 500.0 / 32768.0);
    }

    #[test]
    fn test_clip_ends_at_track_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.wav");
        write_ramp(&path, 1000, 1500);

        // The row claims 1000ms of a 1500ms file
        let track = Track::new("long.wav", 0, 0, 0, 0, 1000).unwrap();
        let clip = ClipSource::load(&path, &track, AudioFormat::new(1000, 1)).unwrap();
        assert_eq!(clip.duration_ms(), 1000);

        let track = Track::new("long.wav", 0, 0, 100, 200, 1000).unwrap();
        let clip = ClipSource::load(&path, &track, AudioFormat::new(1000, 1)).unwrap();
        assert_eq!(clip.duration_ms(), track.effective_duration_ms());
        assert_eq!(clip.frames(), 700);
    }

    #[test]
    fn test_short_file_ends_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_ramp(&path, 1000, 800);

        let track = Track::new("short.wav", 0, 0, 0, 0, 1000).unwrap();
        let clip = ClipSource::load(&path, &track, AudioFormat::new(1000, 1)).unwrap();
        assert_eq!(clip.frames(), 800);
    }

    #[test]
    fn test_rejects_other_sample_rates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.wav");
        write_ramp(&path, 48000, 480);

        let track = Track::new("b.wav", 0, 0, 0, 0, 10).unwrap();
        let result = ClipSource::load(&path, &track, AudioFormat::new(44100, 1));
        assert!(matches!(
            result,
            Err(EngineError::FormatMismatch { rate: 48000, .. })
        ));
    }
}
