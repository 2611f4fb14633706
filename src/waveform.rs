//! Waveform overview for track display
//!
//! Bars are computed over the clip, i.e. over the track's audible window,
//! so trimming a track changes its overview.

use crate::audio::ClipSource;

/// Bars used when the caller has no preference
pub const DEFAULT_BARS: usize = 96;

/// Per-bar RMS of `clip`, `bars` values long. Channels are averaged.
pub fn peaks(clip: &ClipSource, bars: usize) -> Vec<f32> {
    let channels = clip.format().channels.max(1) as usize;
    let samples = clip.samples();
    let frames = clip.frames();

    let mut waveform = Vec::with_capacity(bars);
    if bars == 0 {
        return waveform;
    }

    for i in 0..bars {
        let start = i * frames / bars;
        let end = ((i + 1) * frames / bars).min(frames);
        if start < end {
            // Calculate RMS for this segment
            let sum_squares: f32 = samples[start * channels..end * channels]
                .chunks_exact(channels)
                .map(|frame| {
                    let s = frame.iter().sum::<f32>() / channels as f32;
                    s * s
                })
                .sum();
            waveform.push((sum_squares / (end - start) as f32).sqrt());
        } else {
            waveform.push(0.0);
        }
    }

    waveform
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioFormat;

    #[test]
    fn test_bars_follow_loudness() {
        let mut samples = vec![0.0f32; 100];
        samples.extend(std::iter::repeat(0.5).take(100));
        let clip = ClipSource::from_samples(samples, AudioFormat::new(1000, 1));

        let bars = peaks(&clip, 4);
        assert_eq!(bars.len(), 4);
        assert_eq!(&bars[..2], &[0.0, 0.0]);
        assert!((bars[2] - 0.5).abs() < 1e-6);
        assert!((bars[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_short_clip_pads_with_silence() {
        let clip = ClipSource::from_samples(vec![1.0; 3], AudioFormat::new(1000, 1));
        let bars = peaks(&clip, DEFAULT_BARS);
        assert_eq!(bars.len(), DEFAULT_BARS);
        assert_eq!(bars.iter().filter(|b| **b > 0.0).count(), 3);
    }
}
