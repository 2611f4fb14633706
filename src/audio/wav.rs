//! Container file writer
//!
//! Files are canonical 16-bit PCM WAV: a fixed 44-byte header followed by
//! interleaved little-endian samples. The writer thread is the only place file
//! I/O happens during a recording; the capture callback never touches the
//! filesystem. A placeholder header goes out first and is rewritten in place
//! with the real sizes once the capture is finished.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{AudioFormat, BITS_PER_SAMPLE};
use crate::error::{EngineError, EngineResult};

use super::ring::FrameConsumer;

/// Size of the canonical PCM header
pub const HEADER_LEN: usize = 44;

/// Samples drained from the ring per write
const WRITE_CHUNK_SAMPLES: usize = 4096;

/// How long the writer waits on an empty ring before re-checking for stop
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Parsed or to-be-written 44-byte PCM header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Size of the PCM payload in bytes
    pub data_len: u32,
}

impl WavHeader {
    pub fn new(format: AudioFormat, data_len: u32) -> Self {
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            bits_per_sample: BITS_PER_SAMPLE,
            data_len,
        }
    }

    pub fn block_align(&self) -> u16 {
        self.checked_block_align().unwrap_or(u16::MAX)
    }

    pub fn byte_rate(&self) -> u32 {
        self.checked_byte_rate().unwrap_or(u32::MAX)
    }

    fn checked_block_align(&self) -> Option<u16> {
        self.channels.checked_mul(self.bits_per_sample / 8)
    }

    fn checked_byte_rate(&self) -> Option<u32> {
        self.sample_rate
            .checked_mul(self.checked_block_align()? as u32)
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }

    /// Payload duration in milliseconds
    pub fn duration_ms(&self) -> i64 {
        if self.byte_rate() == 0 {
            return 0;
        }
        self.data_len as i64 * 1000 / self.byte_rate() as i64
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(b"RIFF");
        header[4..8].copy_from_slice(&(self.data_len.saturating_add(36)).to_le_bytes());
        header[8..12].copy_from_slice(b"WAVE");

        header[12..16].copy_from_slice(b"fmt ");
        header[16..20].copy_from_slice(&16u32.to_le_bytes());
        header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
        header[22..24].copy_from_slice(&self.channels.to_le_bytes());
        header[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        header[28..32].copy_from_slice(&self.byte_rate().to_le_bytes());
        header[32..34].copy_from_slice(&self.block_align().to_le_bytes());
        header[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());

        header[36..40].copy_from_slice(b"data");
        header[40..44].copy_from_slice(&self.data_len.to_le_bytes());
        header
    }

    /// Parse the canonical layout. Files with extra chunks before `data`
    /// are rejected; use `hound` to read those.
    pub fn parse(bytes: &[u8]) -> EngineResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(EngineError::InvalidContainer(format!(
                "header is {} bytes, need {}",
                bytes.len(),
                HEADER_LEN
            )));
        }
        if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
            return Err(EngineError::InvalidContainer("not a RIFF/WAVE file".into()));
        }
        if &bytes[12..16] != b"fmt " || le_u32(bytes, 16) != 16 {
            return Err(EngineError::InvalidContainer("unexpected fmt chunk".into()));
        }
        if le_u16(bytes, 20) != 1 {
            return Err(EngineError::InvalidContainer("not linear PCM".into()));
        }
        if &bytes[36..40] != b"data" {
            return Err(EngineError::InvalidContainer("data chunk not at offset 36".into()));
        }

        let header = Self {
            channels: le_u16(bytes, 22),
            sample_rate: le_u32(bytes, 24),
            bits_per_sample: le_u16(bytes, 34),
            data_len: le_u32(bytes, 40),
        };
        if header.channels == 0 || header.bits_per_sample == 0 || header.bits_per_sample % 8 != 0 {
            return Err(EngineError::InvalidContainer(format!(
                "unsupported layout: {} channels of {} bits",
                header.channels, header.bits_per_sample
            )));
        }
        let (Some(byte_rate), Some(block_align)) =
            (header.checked_byte_rate(), header.checked_block_align())
        else {
            return Err(EngineError::InvalidContainer(format!(
                "{} channels at {}Hz overflows the byte rate",
                header.channels, header.sample_rate
            )));
        };
        if byte_rate != le_u32(bytes, 28) || block_align != le_u16(bytes, 32) {
            return Err(EngineError::InvalidContainer(
                "byte rate / block align disagree with format".into(),
            ));
        }
        Ok(header)
    }

    pub fn read_from(path: impl AsRef<Path>) -> EngineResult<Self> {
        let mut file = File::open(path.as_ref())?;
        let mut bytes = [0u8; HEADER_LEN];
        file.read_exact(&mut bytes)?;
        Self::parse(&bytes)
    }
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Rewrite just the header of `file` from the final payload size
fn patch_header(file: &mut File, format: AudioFormat, data_len: u64) -> io::Result<()> {
    let data_len = data_len.min((u32::MAX - 36) as u64) as u32;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&WavHeader::new(format, data_len).to_bytes())?;
    file.flush()
}

/// Create `path` and run `init` on it. The file is removed again if `init`
/// fails.
fn create_with(
    path: &Path,
    init: impl FnOnce(&mut File) -> io::Result<()>,
) -> io::Result<File> {
    let mut file = File::create(path)?;
    if let Err(e) = init(&mut file) {
        drop(file);
        if let Err(remove_err) = std::fs::remove_file(path) {
            log::warn!("Failed to remove {}: {}", path.display(), remove_err);
        }
        return Err(e);
    }
    Ok(file)
}

/// Convert float samples to 16-bit PCM bytes, appending to `out`
fn encode_pcm16(samples: &[f32], out: &mut Vec<u8>) {
    out.clear();
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Drains a frame ring into a container file on a dedicated thread
pub struct FileWriter {
    path: PathBuf,
    format: AudioFormat,
    file: Option<File>,
    bytes_written: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<io::Result<u64>>>,
}

impl FileWriter {
    /// Create the file and write the placeholder header
    pub fn open(path: impl AsRef<Path>, format: AudioFormat) -> EngineResult<Self> {
        Self::with_counter(path, format, Arc::new(AtomicU64::new(0)))
    }

    /// Like [`open`](Self::open), publishing the PCM byte count into
    /// `bytes_written`. The counter is reset to zero.
    pub fn with_counter(
        path: impl AsRef<Path>,
        format: AudioFormat,
        bytes_written: Arc<AtomicU64>,
    ) -> EngineResult<Self> {
        bytes_written.store(0, Ordering::Relaxed);
        let path = path.as_ref().to_path_buf();
        let header = WavHeader::new(format, 0).to_bytes();
        let file = create_with(&path, |file| file.write_all(&header))?;
        log::debug!("Opened take file {}", path.display());

        Ok(Self {
            path,
            format,
            file: Some(file),
            bytes_written,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PCM bytes written so far (excluding the header)
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn duration_ms(&self) -> i64 {
        self.format.bytes_to_ms(self.bytes_written())
    }

    /// Spawn the consumer thread
    pub fn start(&mut self, consumer: FrameConsumer) -> EngineResult<()> {
        let file = self.file.take().ok_or_else(|| {
            EngineError::InvalidState("writer already started or finished".into())
        })?;

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let bytes_written = self.bytes_written.clone();
        let format = self.format;

        let handle = thread::Builder::new()
            .name("layerdeck-writer".into())
            .spawn(move || writer_loop(file, consumer, format, running, bytes_written))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Signal the thread to drain what is left, patch the header and close.
    /// Returns the total PCM bytes written. Safe to call more than once.
    pub fn finish(&mut self) -> EngineResult<u64> {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.thread.take() {
            let result = handle
                .join()
                .map_err(|_| EngineError::InvalidState("writer thread panicked".into()))?;
            let total = result?;
            log::debug!(
                "Closed take file {} ({} bytes, {}ms)",
                self.path.display(),
                total,
                self.format.bytes_to_ms(total)
            );
        } else if let Some(mut file) = self.file.take() {
            // Never started: the placeholder header already describes an empty file
            patch_header(&mut file, self.format, 0)?;
        }

        Ok(self.bytes_written())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.finish();
        }
    }
}

fn append_pcm(
    samples: &[f32],
    pcm: &mut Vec<u8>,
    out: &mut BufWriter<File>,
    bytes_written: &AtomicU64,
) -> io::Result<()> {
    encode_pcm16(samples, pcm);
    out.write_all(pcm)?;
    bytes_written.fetch_add(pcm.len() as u64, Ordering::Relaxed);
    Ok(())
}

fn writer_loop(
    file: File,
    mut consumer: FrameConsumer,
    format: AudioFormat,
    running: Arc<AtomicBool>,
    bytes_written: Arc<AtomicU64>,
) -> io::Result<u64> {
    let mut samples = vec![0.0f32; WRITE_CHUNK_SAMPLES];
    let mut pcm = Vec::with_capacity(WRITE_CHUNK_SAMPLES * 2);
    let mut out = BufWriter::new(file);
    let mut reported_drops = 0u64;

    while running.load(Ordering::Acquire) {
        let read = consumer.read_blocking(&mut samples, IDLE_WAIT);
        if read > 0 {
            append_pcm(&samples[..read], &mut pcm, &mut out, &bytes_written)?;
        } else if consumer.is_abandoned() {
            thread::sleep(IDLE_WAIT);
        }

        let dropped = consumer.dropped_frames();
        if dropped > reported_drops {
            log::warn!("Writer fell behind: {} frames dropped so far", dropped);
            reported_drops = dropped;
        }
    }

    // Drain whatever the callback pushed before it stopped
    loop {
        let read = consumer.read(&mut samples);
        if read == 0 {
            break;
        }
        append_pcm(&samples[..read], &mut pcm, &mut out, &bytes_written)?;
    }

    let mut file = out.into_inner().map_err(|e| e.into_error())?;
    let total = bytes_written.load(Ordering::Relaxed);
    patch_header(&mut file, format, total)?;
    file.sync_all()?;
    Ok(total)
}
