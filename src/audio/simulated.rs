//! Simulated audio backend
//!
//! Streams are driven by a plain thread that fires the callback once per
//! buffer period. Input streams deliver a generated signal. Start-up delay,
//! open failures, mid-stream faults and a hardware latency figure are all
//! configurable, which makes the backend usable for tests and for running the
//! engine on machines without audio hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::AudioFormat;

use super::backend::{
    AudioBackend, AudioStream, CallbackAction, DeviceReport, FaultCallback, InputCallback,
    OutputCallback, OutputDeviceKind, StreamFault,
};
use super::error::{AudioError, AudioResult};

/// Signal produced by simulated input streams
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalShape {
    Silence,
    Sine { frequency_hz: f32, amplitude: f32 },
}

/// Behaviour of the simulated device
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Frames per callback
    pub buffer_frames: u32,
    /// Delay between `start()` and the first callback
    pub startup_delay: Duration,
    /// Refuse to open streams, as if the device were busy
    pub fail_open: bool,
    /// Report a fault this long after the first callback
    pub fault_after: Option<Duration>,
    pub signal: SignalShape,
    /// Latency reported by running streams, as if measured from timestamps
    pub hardware_latency_ms: Option<f64>,
    pub report: DeviceReport,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            buffer_frames: 256,
            startup_delay: Duration::ZERO,
            fail_open: false,
            fault_after: None,
            signal: SignalShape::Sine {
                frequency_hz: 440.0,
                amplitude: 0.5,
            },
            hardware_latency_ms: None,
            report: DeviceReport {
                outputs: vec![OutputDeviceKind::BuiltInSpeaker],
                native_buffer_frames: Some(256),
                native_sample_rate: Some(48000),
                min_input_buffer_bytes: Some(3528),
            },
        }
    }
}

pub struct SimulatedBackend {
    config: SimulatedConfig,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    fn open(
        &self,
        format: AudioFormat,
        driver: Driver,
        on_fault: FaultCallback,
    ) -> AudioResult<Box<dyn AudioStream>> {
        if self.config.fail_open {
            return Err(AudioError::DeviceBusy("simulated device refused to open".into()));
        }
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(AudioError::UnsupportedFormat(format!("{:?}", format)));
        }

        Ok(Box::new(SimulatedStream {
            format,
            config: self.config.clone(),
            driver: Some(driver),
            on_fault,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }))
    }
}

impl AudioBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn open_input(
        &self,
        format: AudioFormat,
        on_data: InputCallback,
        on_fault: FaultCallback,
    ) -> AudioResult<Box<dyn AudioStream>> {
        self.open(format, Driver::Input(on_data), on_fault)
    }

    fn open_output(
        &self,
        format: AudioFormat,
        on_data: OutputCallback,
        on_fault: FaultCallback,
    ) -> AudioResult<Box<dyn AudioStream>> {
        self.open(format, Driver::Output(on_data), on_fault)
    }

    fn probe(&self) -> DeviceReport {
        self.config.report.clone()
    }
}

enum Driver {
    Input(InputCallback),
    Output(OutputCallback),
}

struct SimulatedStream {
    format: AudioFormat,
    config: SimulatedConfig,
    driver: Option<Driver>,
    on_fault: FaultCallback,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Driver>>,
}

impl AudioStream for SimulatedStream {
    fn start(&mut self) -> AudioResult<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let driver = self
            .driver
            .take()
            .ok_or_else(|| AudioError::StreamControlError("stream callback missing".into()))?;

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let format = self.format;
        let config = self.config.clone();
        let on_fault = self.on_fault.clone();

        let handle = thread::Builder::new()
            .name("layerdeck-sim-audio".into())
            .spawn(move || drive(driver, format, config, running, on_fault))
            .map_err(|e| AudioError::StreamControlError(e.to_string()))?;
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> AudioResult<()> {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let driver = handle
                .join()
                .map_err(|_| AudioError::StreamControlError("audio thread panicked".into()))?;
            self.driver = Some(driver);
        }
        Ok(())
    }

    fn latency_ms(&self) -> Option<f64> {
        if self.running.load(Ordering::Acquire) {
            self.config.hardware_latency_ms.filter(|ms| *ms > 0.0)
        } else {
            None
        }
    }

    fn buffer_frames(&self) -> u32 {
        self.config.buffer_frames
    }
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Sleep until `deadline`, waking early if the stream is stopped
fn sleep_until(deadline: Instant, running: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(5);
    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLICE));
    }
}

fn drive(
    mut driver: Driver,
    format: AudioFormat,
    config: SimulatedConfig,
    running: Arc<AtomicBool>,
    on_fault: FaultCallback,
) -> Driver {
    let frames = config.buffer_frames.max(1) as usize;
    let channels = format.channels as usize;
    let period = Duration::from_secs_f64(frames as f64 / format.sample_rate as f64);
    let mut buffer = vec![0.0f32; frames * channels];
    let mut phase = 0.0f32;

    if !sleep_until(Instant::now() + config.startup_delay, &running) {
        return driver;
    }

    let first_callback = Instant::now();
    let mut next = first_callback;
    while running.load(Ordering::Acquire) {
        let action = match &mut driver {
            Driver::Input(callback) => {
                fill_signal(&mut buffer, channels, config.signal, format.sample_rate, &mut phase);
                callback(&buffer)
            }
            Driver::Output(callback) => {
                buffer.fill(0.0);
                callback(&mut buffer)
            }
        };
        if action == CallbackAction::Stop {
            break;
        }

        if let Some(after) = config.fault_after {
            if first_callback.elapsed() >= after {
                running.store(false, Ordering::Release);
                on_fault(StreamFault::new("simulated device disconnected"));
                break;
            }
        }

        next += period;
        if !sleep_until(next, &running) {
            break;
        }
    }
    driver
}

fn fill_signal(
    buffer: &mut [f32],
    channels: usize,
    shape: SignalShape,
    sample_rate: u32,
    phase: &mut f32,
) {
    match shape {
        SignalShape::Silence => buffer.fill(0.0),
        SignalShape::Sine {
            frequency_hz,
            amplitude,
        } => {
            let step = std::f32::consts::TAU * frequency_hz / sample_rate as f32;
            for frame in buffer.chunks_mut(channels) {
                let value = phase.sin() * amplitude;
                frame.fill(value);
                *phase = (*phase + step) % std::f32::consts::TAU;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn no_faults() -> FaultCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_input_stream_delivers_buffers() {
        let backend = SimulatedBackend::new(SimulatedConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let mut stream = backend
            .open_input(
                AudioFormat::new(44100, 1),
                Box::new(move |buffer| {
                    assert_eq!(buffer.len(), 256);
                    seen.fetch_add(1, Ordering::Relaxed);
                    CallbackAction::Continue
                }),
                no_faults(),
            )
            .unwrap();

        stream.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        stream.stop().unwrap();
        let after_stop = calls.load(Ordering::Relaxed);
        assert!(after_stop >= 2, "only {} callbacks", after_stop);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn test_fail_open() {
        let backend = SimulatedBackend::new(SimulatedConfig {
            fail_open: true,
            ..Default::default()
        });
        let result = backend.open_input(
            AudioFormat::default(),
            Box::new(|_| CallbackAction::Continue),
            no_faults(),
        );
        assert!(matches!(result, Err(AudioError::DeviceBusy(_))));
    }

    #[test]
    fn test_fault_is_reported() {
        let backend = SimulatedBackend::new(SimulatedConfig {
            fault_after: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();

        let mut stream = backend
            .open_output(
                AudioFormat::new(44100, 2),
                Box::new(|_| CallbackAction::Continue),
                Arc::new(move |fault| sink.lock().unwrap().push(fault)),
            )
            .unwrap();
        stream.start().unwrap();
        thread::sleep(Duration::from_millis(80));
        stream.stop().unwrap();

        assert_eq!(faults.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_latency_only_while_running() {
        let backend = SimulatedBackend::new(SimulatedConfig {
            hardware_latency_ms: Some(42.0),
            ..Default::default()
        });
        let mut stream = backend
            .open_output(
                AudioFormat::new(44100, 2),
                Box::new(|_| CallbackAction::Continue),
                no_faults(),
            )
            .unwrap();
        assert_eq!(stream.latency_ms(), None);
        stream.start().unwrap();
        assert_eq!(stream.latency_ms(), Some(42.0));
        stream.stop().unwrap();
        assert_eq!(stream.latency_ms(), None);
    }

    #[test]
    fn test_sine_is_bounded() {
        let mut buffer = vec![0.0f32; 512];
        let mut phase = 0.0;
        fill_signal(
            &mut buffer,
            2,
            SignalShape::Sine {
                frequency_hz: 1000.0,
                amplitude: 0.25,
            },
            44100,
            &mut phase,
        );
        assert!(buffer.iter().all(|s| s.abs() <= 0.25));
        assert!(buffer.iter().any(|s| s.abs() > 0.1));
        // Channels of one frame carry the same sample
        assert_eq!(buffer[2], buffer[3]);
    }
}
