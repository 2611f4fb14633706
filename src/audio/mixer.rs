//! Track players and the output mixer
//!
//! Every track is played by a [`Voice`]: its trim-clipped samples plus a set
//! of atomics the control side writes (play, seek, volume, mute) and the
//! render callback reads. The playback engine only commands and polls voices
//! through the [`TrackPlayer`] trait; it never reads their positions to keep
//! time.
//!
//! The voice list itself is swapped into the render callback through an
//! `rtrb` queue. Replaced lists travel back on a second queue and are dropped
//! on the control side, so the audio thread never frees memory.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};

use super::backend::{CallbackAction, OutputCallback};
use super::clip::ClipSource;

/// Pending voice-list swaps the render callback can fall behind by
const COMMAND_QUEUE_CAPACITY: usize = 8;

/// Playback handle for one track, commanded by the playback engine.
///
/// Commands take effect on the render thread's next buffer; none of them
/// complete synchronously.
pub trait TrackPlayer: Send + Sync {
    /// Move to `local_ms` within the track's audible window
    fn seek_to(&self, local_ms: i64);
    fn play(&self);
    fn pause(&self);
    /// True once the player has produced audio since the last `play()`
    fn is_rendering(&self) -> bool;
    /// Self-reported local position
    fn position_ms(&self) -> i64;
    fn set_volume(&self, volume: f32);
    fn set_muted(&self, muted: bool);
}

/// A trim-clipped clip with lock-free transport state
pub struct Voice {
    samples: Arc<[f32]>,
    channels: usize,
    sample_rate: u32,
    playing: AtomicBool,
    /// Next frame to render
    cursor: AtomicU64,
    volume_bits: AtomicU32,
    muted: AtomicBool,
    rendered: AtomicBool,
}

impl Voice {
    pub fn new(clip: &ClipSource) -> Arc<Self> {
        let format = clip.format();
        Arc::new(Self {
            samples: clip.samples().clone(),
            channels: format.channels.max(1) as usize,
            sample_rate: format.sample_rate,
            playing: AtomicBool::new(false),
            cursor: AtomicU64::new(0),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
            rendered: AtomicBool::new(false),
        })
    }

    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.channels) as u64
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    /// Add this voice's next `out.len() / out_channels` frames into `out`
    fn render_into(&self, out: &mut [f32], out_channels: usize) {
        if !self.playing.load(Ordering::Acquire) {
            return;
        }

        let start = self.cursor.load(Ordering::Acquire);
        let total = self.frames();
        if start >= total {
            self.playing.store(false, Ordering::Release);
            return;
        }

        let count = ((out.len() / out_channels) as u64).min(total - start) as usize;
        let gain = if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            self.volume()
        };

        let first = start as usize * self.channels;
        let source = &self.samples[first..first + count * self.channels];
        for (frame, dst) in source
            .chunks_exact(self.channels)
            .zip(out.chunks_exact_mut(out_channels))
        {
            if self.channels == out_channels {
                for (d, s) in dst.iter_mut().zip(frame) {
                    *d += s * gain;
                }
            } else {
                // Mono clips (and any other layout) are folded and spread
                let value = frame.iter().sum::<f32>() / self.channels as f32 * gain;
                for d in dst.iter_mut() {
                    *d += value;
                }
            }
        }

        // A seek issued while rendering wins over the advance
        let end = start + count as u64;
        let _ = self
            .cursor
            .compare_exchange(start, end, Ordering::AcqRel, Ordering::Acquire);
        self.rendered.store(true, Ordering::Release);
        if end >= total {
            self.playing.store(false, Ordering::Release);
        }
    }
}

impl TrackPlayer for Voice {
    fn seek_to(&self, local_ms: i64) {
        let frame = (local_ms.max(0) as u64 * self.sample_rate as u64 / 1000).min(self.frames());
        self.cursor.store(frame, Ordering::Release);
    }

    fn play(&self) {
        self.rendered.store(false, Ordering::Release);
        self.playing.store(true, Ordering::Release);
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::Release);
    }

    fn is_rendering(&self) -> bool {
        self.playing.load(Ordering::Acquire) && self.rendered.load(Ordering::Acquire)
    }

    fn position_ms(&self) -> i64 {
        (self.cursor.load(Ordering::Acquire) * 1000 / self.sample_rate.max(1) as u64) as i64
    }

    fn set_volume(&self, volume: f32) {
        self.volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }
}

type VoiceList = Vec<Arc<Voice>>;

/// Control side of the mixer
pub struct Mixer {
    commands: rtrb::Producer<VoiceList>,
    garbage: rtrb::Consumer<VoiceList>,
}

/// Render side of the mixer, moved into the output stream callback
pub struct MixerRenderer {
    commands: rtrb::Consumer<VoiceList>,
    garbage: rtrb::Producer<VoiceList>,
    voices: VoiceList,
    channels: usize,
}

impl Mixer {
    pub fn new(output_channels: u16) -> (Mixer, MixerRenderer) {
        let (command_tx, command_rx) = rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY);
        let (garbage_tx, garbage_rx) = rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY + 1);

        (
            Mixer {
                commands: command_tx,
                garbage: garbage_rx,
            },
            MixerRenderer {
                commands: command_rx,
                garbage: garbage_tx,
                voices: Vec::new(),
                channels: output_channels.max(1) as usize,
            },
        )
    }

    /// Replace the set of voices the output stream renders
    pub fn set_voices(&mut self, voices: Vec<Arc<Voice>>) -> EngineResult<()> {
        self.collect_garbage();
        self.commands
            .push(voices)
            .map_err(|_| EngineError::InvalidState("mixer command queue is full".into()))
    }

    /// Drop voice lists the render side has retired
    pub fn collect_garbage(&mut self) -> usize {
        let mut collected = 0;
        while self.garbage.pop().is_ok() {
            collected += 1;
        }
        collected
    }
}

impl MixerRenderer {
    /// Fill `out` with the mix of every playing voice
    pub fn render(&mut self, out: &mut [f32]) {
        while let Ok(voices) = self.commands.pop() {
            let retired = std::mem::replace(&mut self.voices, voices);
            // Sized so this cannot fail while the control side keeps collecting
            let _ = self.garbage.push(retired);
        }

        out.fill(0.0);
        for voice in &self.voices {
            voice.render_into(out, self.channels);
        }
        for sample in out.iter_mut() {
            *sample = sample.tanh();
        }
    }

    pub fn into_callback(mut self) -> OutputCallback {
        Box::new(move |out: &mut [f32]| {
            self.render(out);
            CallbackAction::Continue
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioFormat;

    fn voice(samples: Vec<f32>, channels: u16) -> Arc<Voice> {
        Voice::new(&ClipSource::from_samples(
            samples,
            AudioFormat::new(1000, channels),
        ))
    }

    #[test]
    fn test_mono_voice_spreads_to_all_channels() {
        let (mut mixer, mut renderer) = Mixer::new(2);
        let v = voice(vec![0.25; 100], 1);
        mixer.set_voices(vec![v.clone()]).unwrap();
        v.play();

        let mut out = [0.0f32; 20];
        renderer.render(&mut out);
        assert!(out.iter().all(|s| (*s - 0.25f32.tanh()).abs() < 1e-6));
        assert_eq!(v.position_ms(), 10);
        assert!(v.is_rendering());
    }

    #[test]
    fn test_paused_voice_is_silent_and_holds_position() {
        let (mut mixer, mut renderer) = Mixer::new(1);
        let v = voice(vec![0.5; 100], 1);
        mixer.set_voices(vec![v.clone()]).unwrap();
        v.seek_to(30);

        let mut out = [1.0f32; 10];
        renderer.render(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(v.position_ms(), 30);
        assert!(!v.is_rendering());
    }

    #[test]
    fn test_voice_stops_at_end_of_clip() {
        let (mut mixer, mut renderer) = Mixer::new(1);
        let v = voice(vec![0.5; 15], 1);
        mixer.set_voices(vec![v.clone()]).unwrap();
        v.play();

        let mut out = [0.0f32; 10];
        renderer.render(&mut out);
        renderer.render(&mut out);
        assert_eq!(&out[5..], &[0.0; 5]);
        assert!(!v.is_playing());
        assert_eq!(v.position_ms(), 15);
    }

    #[test]
    fn test_volume_and_mute() {
        let (mut mixer, mut renderer) = Mixer::new(1);
        let v = voice(vec![0.5; 100], 1);
        mixer.set_voices(vec![v.clone()]).unwrap();
        v.set_volume(0.5);
        v.play();

        let mut out = [0.0f32; 4];
        renderer.render(&mut out);
        assert!((out[0] - 0.25f32.tanh()).abs() < 1e-6);

        v.set_muted(true);
        renderer.render(&mut out);
        assert_eq!(out, [0.0; 4]);
        // Muted voices keep advancing
        assert_eq!(v.position_ms(), 8);
    }

    #[test]
    fn test_sum_is_soft_clipped() {
        let (mut mixer, mut renderer) = Mixer::new(1);
        let voices: Vec<_> = (0..4).map(|_| voice(vec![0.9; 10], 1)).collect();
        for v in &voices {
            v.play();
        }
        mixer.set_voices(voices).unwrap();

        let mut out = [0.0f32; 10];
        renderer.render(&mut out);
        assert!(out.iter().all(|s| *s < 1.0 && *s > 0.99));
    }

    #[test]
    fn test_retired_lists_come_back() {
        let (mut mixer, mut renderer) = Mixer::new(1);
        mixer.set_voices(vec![voice(vec![0.0; 4], 1)]).unwrap();
        mixer.set_voices(Vec::new()).unwrap();
        let mut out = [0.0f32; 4];
        renderer.render(&mut out);
        // Initial empty list and the first list
        assert_eq!(mixer.collect_garbage(), 2);
        assert_eq!(mixer.collect_garbage(), 0);
    }
}
