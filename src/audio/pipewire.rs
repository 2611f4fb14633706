//! PipeWire backend
//!
//! Each stream runs its own PipeWire main loop on a dedicated thread with an
//! `RT_PROCESS` stream, so the process callback (and with it the engine's
//! real-time callback) runs on PipeWire's data thread.

use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::registry::GlobalObject;
use pw::spa::pod::Pod;
use pw::spa::utils::dict::DictRef;
use pw::types::ObjectType;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::AudioFormat;

use super::backend::{
    AudioBackend, AudioStream, CallbackAction, DeviceReport, FaultCallback, InputCallback,
    OutputCallback, OutputDeviceKind, StreamFault,
};
use super::error::{AudioError, AudioResult};

/// PipeWire's default graph quantum
const DEFAULT_QUANTUM: u32 = 1024;

/// Largest buffer converted per process call, in samples
const SCRATCH_SAMPLES: usize = 16384;

/// How long `start()` waits for the stream to connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the registry is listened to when enumerating sinks
const REGISTRY_SETTLE: Duration = Duration::from_millis(100);

enum StreamCommand {
    Stop,
}

enum Driver {
    Input(InputCallback),
    Output(OutputCallback),
}

#[derive(Default)]
pub struct PipeWireBackend;

impl PipeWireBackend {
    pub fn new() -> Self {
        Self
    }

    fn open(&self, format: AudioFormat, driver: Driver, on_fault: FaultCallback) -> PipeWireStream {
        PipeWireStream {
            format,
            driver: Some(driver),
            on_fault,
            delay_bits: Arc::new(AtomicU64::new(0)),
            sender: None,
            thread: None,
        }
    }
}

impl AudioBackend for PipeWireBackend {
    fn name(&self) -> &'static str {
        "pipewire"
    }

    fn open_input(
        &self,
        format: AudioFormat,
        on_data: InputCallback,
        on_fault: FaultCallback,
    ) -> AudioResult<Box<dyn AudioStream>> {
        Ok(Box::new(self.open(format, Driver::Input(on_data), on_fault)))
    }

    fn open_output(
        &self,
        format: AudioFormat,
        on_data: OutputCallback,
        on_fault: FaultCallback,
    ) -> AudioResult<Box<dyn AudioStream>> {
        Ok(Box::new(self.open(format, Driver::Output(on_data), on_fault)))
    }

    fn probe(&self) -> DeviceReport {
        let outputs = match enumerate_sinks() {
            Ok(sinks) => sinks.iter().map(SinkInfo::kind).collect(),
            Err(e) => {
                log::warn!("Could not enumerate PipeWire sinks: {}", e);
                Vec::new()
            }
        };
        log::debug!("PipeWire outputs: {:?}", outputs);

        DeviceReport {
            outputs,
            native_buffer_frames: Some(DEFAULT_QUANTUM),
            native_sample_rate: Some(48000),
            min_input_buffer_bytes: None,
        }
    }
}

struct PipeWireStream {
    format: AudioFormat,
    driver: Option<Driver>,
    on_fault: FaultCallback,
    /// Graph delay of the stream in ms, as f64 bits; 0 until measured
    delay_bits: Arc<AtomicU64>,
    sender: Option<pw::channel::Sender<StreamCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioStream for PipeWireStream {
    fn start(&mut self) -> AudioResult<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let driver = self.driver.take().ok_or_else(|| {
            AudioError::StreamControlError("PipeWire streams cannot be restarted".into())
        })?;

        let (sender, receiver) = pw::channel::channel::<StreamCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let format = self.format;
        let on_fault = self.on_fault.clone();
        let delay_bits = self.delay_bits.clone();

        let handle = thread::Builder::new()
            .name("layerdeck-pipewire".into())
            .spawn(move || {
                if let Err(e) =
                    run_stream_loop(driver, format, on_fault.clone(), delay_bits, receiver, &ready_tx)
                {
                    log::error!("PipeWire stream failed: {}", e);
                    if ready_tx.send(Err(e.clone())).is_err() {
                        on_fault(StreamFault::new(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamControlError(e.to_string()))?;

        self.sender = Some(sender);
        self.thread = Some(handle);

        match ready_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                let _ = self.stop();
                Err(AudioError::StreamBuildError(e))
            }
            Err(_) => {
                let _ = self.stop();
                Err(AudioError::NoDevice("timed out connecting to PipeWire".into()))
            }
        }
    }

    fn stop(&mut self) -> AudioResult<()> {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(StreamCommand::Stop);
        }
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| AudioError::StreamControlError("PipeWire thread panicked".into()))?;
        }
        Ok(())
    }

    fn latency_ms(&self) -> Option<f64> {
        if self.thread.is_none() {
            return None;
        }
        let delay = f64::from_bits(self.delay_bits.load(Ordering::Relaxed));
        (delay > 0.0).then_some(delay)
    }

    fn buffer_frames(&self) -> u32 {
        DEFAULT_QUANTUM
    }
}

impl Drop for PipeWireStream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Run one PipeWire stream until told to stop
fn run_stream_loop(
    driver: Driver,
    format: AudioFormat,
    on_fault: FaultCallback,
    delay_bits: Arc<AtomicU64>,
    receiver: pw::channel::Receiver<StreamCommand>,
    ready: &mpsc::Sender<Result<(), String>>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        StreamCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    let (direction, category, role, name) = match driver {
        Driver::Input(_) => (
            spa::utils::Direction::Input,
            "Capture",
            "Production",
            "layerdeck-capture",
        ),
        Driver::Output(_) => (
            spa::utils::Direction::Output,
            "Playback",
            "Production",
            "layerdeck-playback",
        ),
    };

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        driver: Driver,
        scratch: Vec<f32>,
        on_fault: FaultCallback,
        delay_bits: Arc<AtomicU64>,
        mainloop_weak: pw::main_loop::MainLoopWeak,
    }

    let user_data = UserData {
        format: Default::default(),
        driver,
        scratch: vec![0.0; SCRATCH_SAMPLES],
        on_fault,
        delay_bits,
        mainloop_weak: mainloop.downgrade(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => category,
        *pw::keys::MEDIA_ROLE => role,
        *pw::keys::APP_NAME => "Layerdeck",
    };

    let stream = pw::stream::StreamBox::new(&core, name, props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .state_changed(|_, user_data, _old, new| {
            if let pw::stream::StreamState::Error(message) = new {
                (user_data.on_fault)(StreamFault::new(message));
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
            }
        })
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };

            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            if let Err(e) = user_data.format.parse(param) {
                (user_data.on_fault)(StreamFault::new(format!(
                    "unparseable stream format: {:?}",
                    e
                )));
            }
        })
        .process(|stream, user_data| {
            if let Some(delay) = stream_delay_ms(stream) {
                user_data.delay_bits.store(delay.to_bits(), Ordering::Relaxed);
            }

            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let sample_size = std::mem::size_of::<f32>();
            let stride = sample_size * n_channels;

            let action = match &mut user_data.driver {
                Driver::Input(callback) => {
                    let size = data.chunk().size() as usize;
                    let Some(raw) = data.data() else { return };
                    let bytes = &raw[..size.min(raw.len())];
                    let count = (bytes.len() / stride * n_channels).min(user_data.scratch.len());
                    let count = count - count % n_channels;

                    for (dst, src) in user_data.scratch[..count]
                        .iter_mut()
                        .zip(bytes.chunks_exact(sample_size))
                    {
                        *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
                    }
                    callback(&user_data.scratch[..count])
                }
                Driver::Output(callback) => {
                    let Some(slice) = data.data() else { return };
                    let frames = (slice.len() / stride).min(user_data.scratch.len() / n_channels);
                    let count = frames * n_channels;

                    let out = &mut user_data.scratch[..count];
                    out.fill(0.0);
                    let action = callback(out);
                    for (dst, sample) in slice.chunks_exact_mut(sample_size).zip(out.iter()) {
                        dst.copy_from_slice(&sample.to_le_bytes());
                    }

                    let chunk = data.chunk_mut();
                    *chunk.offset_mut() = 0;
                    *chunk.stride_mut() = stride as i32;
                    *chunk.size_mut() = (frames * stride) as u32;
                    action
                }
            };

            if action == CallbackAction::Stop {
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // Request F32LE at the engine's rate and channel count
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(format.sample_rate);
    audio_info.set_channels(format.channels as u32);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner();

    let pod = Pod::from_bytes(&values).ok_or_else(|| "Invalid format pod".to_string())?;
    let mut params = [pod];

    stream
        .connect(
            direction,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    let _ = ready.send(Ok(()));
    log::debug!("PipeWire stream {} connected", name);

    mainloop.run();
    Ok(())
}

/// Graph delay of `stream` in milliseconds, from its timing snapshot
fn stream_delay_ms(stream: &pw::stream::Stream) -> Option<f64> {
    let mut time: pw::sys::pw_time = unsafe { std::mem::zeroed() };
    // SAFETY: the stream pointer is live for the duration of the process
    // callback and `time` is a properly sized, writable pw_time.
    let res = unsafe {
        pw::sys::pw_stream_get_time_n(
            stream.as_raw_ptr(),
            &mut time,
            std::mem::size_of::<pw::sys::pw_time>(),
        )
    };
    if res < 0 {
        return None;
    }
    delay_to_ms(time.delay, time.rate.num, time.rate.denom)
}

/// Convert a delay in graph ticks of `num / denom` seconds to milliseconds
fn delay_to_ms(delay: i64, num: u32, denom: u32) -> Option<f64> {
    if delay <= 0 || num == 0 || denom == 0 {
        return None;
    }
    Some(delay as f64 * num as f64 / denom as f64 * 1000.0)
}

/// The properties of an audio sink that route classification looks at
#[derive(Debug, Clone, Default, PartialEq)]
struct SinkInfo {
    node_name: String,
    api: Option<String>,
    bus: Option<String>,
    bus_path: Option<String>,
    form_factor: Option<String>,
}

impl SinkInfo {
    fn kind(&self) -> OutputDeviceKind {
        let is = |value: &Option<String>, wanted: &[&str]| {
            value.as_deref().is_some_and(|v| wanted.contains(&v))
        };

        if is(&self.api, &["bluez5"])
            || is(&self.bus, &["bluetooth"])
            || self.node_name.starts_with("bluez_output")
        {
            OutputDeviceKind::Bluetooth
        } else if is(&self.bus, &["usb"])
            || self.bus_path.as_deref().is_some_and(|p| p.contains("-usb-"))
        {
            OutputDeviceKind::Usb
        } else if is(&self.form_factor, &["headphone", "headset", "handset"]) {
            OutputDeviceKind::Wired
        } else if is(&self.form_factor, &["internal", "speaker"]) || is(&self.bus, &["pci"]) {
            OutputDeviceKind::BuiltInSpeaker
        } else {
            OutputDeviceKind::Other
        }
    }

    /// Fill fields the node does not carry from its device
    fn inherit(&mut self, device: &SinkInfo) {
        for (field, parent) in [
            (&mut self.api, &device.api),
            (&mut self.bus, &device.bus),
            (&mut self.bus_path, &device.bus_path),
            (&mut self.form_factor, &device.form_factor),
        ] {
            if field.is_none() {
                *field = parent.clone();
            }
        }
    }
}

#[derive(Default)]
struct RegistrySnapshot {
    devices: HashMap<u32, SinkInfo>,
    /// Sinks with the id of the device they belong to
    sinks: Vec<(Option<u32>, SinkInfo)>,
}

fn sink_info(props: &DictRef) -> SinkInfo {
    let get = |key: &str| props.get(key).map(String::from);
    SinkInfo {
        node_name: props.get(*pw::keys::NODE_NAME).unwrap_or_default().to_string(),
        api: get("device.api"),
        bus: get("device.bus"),
        bus_path: get("device.bus-path"),
        form_factor: get("device.form-factor"),
    }
}

fn record_global<P: AsRef<DictRef>>(snapshot: &RefCell<RegistrySnapshot>, global: &GlobalObject<P>) {
    let Some(props): Option<&DictRef> = global.props.as_ref().map(|p| p.as_ref()) else {
        return;
    };
    match global.type_ {
        ObjectType::Device => {
            snapshot
                .borrow_mut()
                .devices
                .insert(global.id, sink_info(props));
        }
        ObjectType::Node if props.get(*pw::keys::MEDIA_CLASS) == Some("Audio/Sink") => {
            let device = props.get("device.id").and_then(|id| id.parse().ok());
            snapshot.borrow_mut().sinks.push((device, sink_info(props)));
        }
        _ => {}
    }
}

/// List the audio sinks currently in the graph
fn enumerate_sinks() -> Result<Vec<SinkInfo>, String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;
    let registry = core
        .get_registry_rc()
        .map_err(|e| format!("Failed to get PipeWire registry: {}", e))?;

    let snapshot = Rc::new(RefCell::new(RegistrySnapshot::default()));
    let sink = snapshot.clone();
    let _listener = registry
        .add_listener_local()
        .global(move |global| record_global(&sink, global))
        .register();

    let mainloop_weak = mainloop.downgrade();
    let timer = mainloop.loop_().add_timer(move |_| {
        if let Some(mainloop) = mainloop_weak.upgrade() {
            mainloop.quit();
        }
    });
    timer
        .update_timer(Some(REGISTRY_SETTLE), None)
        .into_result()
        .map_err(|e| format!("Failed to arm registry timer: {}", e))?;
    mainloop.run();

    let snapshot = snapshot.take();
    Ok(snapshot
        .sinks
        .into_iter()
        .map(|(device, mut info)| {
            if let Some(parent) = device.and_then(|id| snapshot.devices.get(&id)) {
                info.inherit(parent);
            }
            info
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(name: &str) -> SinkInfo {
        SinkInfo {
            node_name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sink_classification() {
        assert_eq!(
            sink("bluez_output.00_11_22_33_44_55.1").kind(),
            OutputDeviceKind::Bluetooth
        );

        let usb = SinkInfo {
            api: Some("alsa".into()),
            bus_path: Some("pci-0000:00:14.0-usb-0:3.2:1.0".into()),
            ..sink("alsa_output.usb-Focusrite")
        };
        assert_eq!(usb.kind(), OutputDeviceKind::Usb);

        let headset = SinkInfo {
            form_factor: Some("headset".into()),
            bus: Some("pci".into()),
            ..sink("alsa_output.pci-0000_00_1f.3.analog-stereo")
        };
        assert_eq!(headset.kind(), OutputDeviceKind::Wired);

        let internal = SinkInfo {
            bus: Some("pci".into()),
            ..sink("alsa_output.pci-0000_00_1f.3.analog-stereo")
        };
        assert_eq!(internal.kind(), OutputDeviceKind::BuiltInSpeaker);

        assert_eq!(sink("v4l2_output.null").kind(), OutputDeviceKind::Other);
    }

    #[test]
    fn test_sink_inherits_device_properties() {
        let mut node = sink("alsa_output.1");
        node.form_factor = Some("speaker".into());
        let device = SinkInfo {
            api: Some("bluez5".into()),
            form_factor: Some("headphone".into()),
            ..sink("bluez_card.1")
        };
        node.inherit(&device);

        assert_eq!(node.api.as_deref(), Some("bluez5"));
        assert_eq!(node.form_factor.as_deref(), Some("speaker"));
        assert_eq!(node.kind(), OutputDeviceKind::Bluetooth);
    }

    #[test]
    fn test_delay_conversion() {
        assert_eq!(delay_to_ms(480, 1, 48000), Some(10.0));
        assert_eq!(delay_to_ms(0, 1, 48000), None);
        assert_eq!(delay_to_ms(-5, 1, 48000), None);
        assert_eq!(delay_to_ms(480, 1, 0), None);
    }
}
