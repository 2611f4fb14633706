//! Latency estimation and take compensation
//!
//! Output and input latency are each taken from the running stream when the
//! backend measures it, and estimated from the device report otherwise.
//! The compensation trimmed from the head of a new take is
//!
//! ```text
//! max(0, pre_roll + output (only if something is audible) + input - manual_offset)
//! ```

use serde::Serialize;

use crate::audio::{DeviceReport, OutputDeviceKind};
use crate::config::AudioFormat;
use crate::error::EngineResult;
use crate::settings::Preferences;

/// Bound on the user's manual offset, either direction
pub const MANUAL_OFFSET_LIMIT_MS: i64 = 500;

/// Added to the buffer estimate on Bluetooth routes. Real codecs range
/// roughly 80-400ms; this is a conservative midpoint.
pub const BLUETOOTH_CODEC_LATENCY_MS: f64 = 150.0;

/// Output clamp for wired, USB, speaker and unknown routes
pub const OUTPUT_CLAMP_MS: (f64, f64) = (10.0, 100.0);

/// Output clamp for Bluetooth routes
pub const BLUETOOTH_OUTPUT_CLAMP_MS: (f64, f64) = (120.0, 400.0);

pub const INPUT_CLAMP_MS: (f64, f64) = (5.0, 60.0);

/// Used when the platform does not report its buffer geometry
const FALLBACK_BUFFER_FRAMES: u32 = 256;
const FALLBACK_SAMPLE_RATE: u32 = 48000;

/// Effective output route, in classification priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteClass {
    Bluetooth,
    Usb,
    Wired,
    Speaker,
    Unknown,
}

/// Pick the route most likely to be audible among the enumerated outputs.
///
/// Bluetooth wins whenever present: it is usually the effective route even
/// when other devices are enumerated alongside it.
pub fn classify_route(outputs: &[OutputDeviceKind]) -> RouteClass {
    let has = |kind: OutputDeviceKind| outputs.contains(&kind);
    if has(OutputDeviceKind::Bluetooth) {
        RouteClass::Bluetooth
    } else if has(OutputDeviceKind::Usb) {
        RouteClass::Usb
    } else if has(OutputDeviceKind::Wired) {
        RouteClass::Wired
    } else if has(OutputDeviceKind::BuiltInSpeaker) {
        RouteClass::Speaker
    } else {
        RouteClass::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LatencySource {
    /// Measured from the stream's own timestamps
    Hardware,
    /// Estimated from the device report
    Heuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyEstimate {
    pub route: RouteClass,
    pub output_ms: f64,
    pub output_source: LatencySource,
    pub input_ms: f64,
    pub input_source: LatencySource,
}

/// Two native buffer periods, plus the codec constant on Bluetooth, clamped
pub fn heuristic_output_ms(report: &DeviceReport, route: RouteClass) -> f64 {
    let frames = report.native_buffer_frames.unwrap_or(FALLBACK_BUFFER_FRAMES) as f64;
    let rate = report
        .native_sample_rate
        .filter(|rate| *rate > 0)
        .unwrap_or(FALLBACK_SAMPLE_RATE) as f64;
    let buffers = 2.0 * frames / rate * 1000.0;

    match route {
        RouteClass::Bluetooth => (buffers + BLUETOOTH_CODEC_LATENCY_MS)
            .clamp(BLUETOOTH_OUTPUT_CLAMP_MS.0, BLUETOOTH_OUTPUT_CLAMP_MS.1),
        _ => buffers.clamp(OUTPUT_CLAMP_MS.0, OUTPUT_CLAMP_MS.1),
    }
}

/// Minimum input buffer over the capture byte rate, clamped
pub fn heuristic_input_ms(report: &DeviceReport, format: AudioFormat) -> f64 {
    let estimate = match report.min_input_buffer_bytes {
        Some(bytes) if format.byte_rate() > 0 => bytes as f64 / format.byte_rate() as f64 * 1000.0,
        // One buffer period when the platform has no minimum to report
        _ => {
            report.native_buffer_frames.unwrap_or(FALLBACK_BUFFER_FRAMES) as f64
                / format.sample_rate.max(1) as f64
                * 1000.0
        }
    };
    estimate.clamp(INPUT_CLAMP_MS.0, INPUT_CLAMP_MS.1)
}

/// Combine hardware measurements (used when positive) with heuristics
pub fn estimate_latency(
    report: &DeviceReport,
    format: AudioFormat,
    hardware_output_ms: Option<f64>,
    hardware_input_ms: Option<f64>,
) -> LatencyEstimate {
    let route = classify_route(&report.outputs);

    let (output_ms, output_source) = match hardware_output_ms.filter(|ms| *ms > 0.0) {
        Some(ms) => (ms, LatencySource::Hardware),
        None => (heuristic_output_ms(report, route), LatencySource::Heuristic),
    };
    let (input_ms, input_source) = match hardware_input_ms.filter(|ms| *ms > 0.0) {
        Some(ms) => (ms, LatencySource::Hardware),
        None => (heuristic_input_ms(report, format), LatencySource::Heuristic),
    };

    LatencyEstimate {
        route,
        output_ms,
        output_source,
        input_ms,
        input_source,
    }
}

/// Milliseconds to trim from the head of a new take.
///
/// The manual offset is subtracted: a negative offset lengthens the trim and
/// a positive one shortens it. Never negative.
pub fn compute_compensation(
    pre_roll_ms: i64,
    output_ms: f64,
    input_ms: f64,
    manual_offset_ms: i64,
    audible: bool,
) -> i64 {
    let output = if audible { output_ms } else { 0.0 };
    let raw = pre_roll_ms as f64 + output + input_ms - manual_offset_ms as f64;
    raw.round().max(0.0) as i64
}

/// What the engine knows about its devices at the moment of a take
#[derive(Debug, Clone)]
pub struct LatencyProbe {
    pub backend: String,
    pub report: DeviceReport,
    pub format: AudioFormat,
    pub hardware_output_ms: Option<f64>,
    pub hardware_input_ms: Option<f64>,
}

/// Everything that went into one compensation decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyDiagnostics {
    pub backend: String,
    pub route: RouteClass,
    pub output_ms: f64,
    pub output_source: LatencySource,
    pub input_ms: f64,
    pub input_source: LatencySource,
    pub pre_roll_ms: i64,
    pub manual_offset_ms: i64,
    pub audible: bool,
    pub compensation_ms: i64,
}

/// Owns the persisted manual offset and produces compensation decisions
pub struct LatencyCompensator {
    preferences: Box<dyn Preferences>,
    manual_offset_ms: i64,
}

impl LatencyCompensator {
    pub fn new(preferences: Box<dyn Preferences>) -> Self {
        let stored = preferences.manual_offset_ms().unwrap_or(0);
        let manual_offset_ms = stored.clamp(-MANUAL_OFFSET_LIMIT_MS, MANUAL_OFFSET_LIMIT_MS);
        if manual_offset_ms != stored {
            log::warn!(
                "Stored latency offset {}ms out of range, using {}ms",
                stored,
                manual_offset_ms
            );
        }
        Self {
            preferences,
            manual_offset_ms,
        }
    }

    pub fn manual_offset_ms(&self) -> i64 {
        self.manual_offset_ms
    }

    /// Set and persist the manual offset, clamped to ±500ms. Returns the
    /// value actually stored.
    pub fn set_manual_offset_ms(&mut self, offset_ms: i64) -> EngineResult<i64> {
        let clamped = offset_ms.clamp(-MANUAL_OFFSET_LIMIT_MS, MANUAL_OFFSET_LIMIT_MS);
        self.preferences.set_manual_offset_ms(clamped)?;
        self.manual_offset_ms = clamped;
        log::info!("Manual latency offset set to {}ms", clamped);
        Ok(clamped)
    }

    /// Estimate latencies and compute the compensation for one take
    pub fn diagnose(&self, probe: &LatencyProbe, pre_roll_ms: i64, audible: bool) -> LatencyDiagnostics {
        let estimate = estimate_latency(
            &probe.report,
            probe.format,
            probe.hardware_output_ms,
            probe.hardware_input_ms,
        );
        let compensation_ms = compute_compensation(
            pre_roll_ms,
            estimate.output_ms,
            estimate.input_ms,
            self.manual_offset_ms,
            audible,
        );

        log::debug!(
            "Latency: route {:?}, output {:.1}ms ({:?}), input {:.1}ms ({:?}), compensation {}ms",
            estimate.route,
            estimate.output_ms,
            estimate.output_source,
            estimate.input_ms,
            estimate.input_source,
            compensation_ms
        );

        LatencyDiagnostics {
            backend: probe.backend.clone(),
            route: estimate.route,
            output_ms: estimate.output_ms,
            output_source: estimate.output_source,
            input_ms: estimate.input_ms,
            input_source: estimate.input_source,
            pre_roll_ms,
            manual_offset_ms: self.manual_offset_ms,
            audible,
            compensation_ms,
        }
    }
}
