//! Audio capture using PipeWire
//!
//! Provides the capture pipeline: a device track delivers raw samples, a
//! frame assembler cuts them into fixed-size blocks, and completed frames
//! are posted to the session loop in capture order.

use log::{debug, error, info, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

use super::pcm::INPUT_SAMPLE_RATE;
use crate::errors::SessionError;

/// Samples per captured frame
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Channel on which completed frames reach the session loop
pub type FrameSender = mpsc::UnboundedSender<CapturedFrame>;

/// A fixed-size window of mono samples in [-1.0, 1.0]
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedFrame {
    /// Position of this frame in the capture stream, starting at 0
    pub sequence: u64,
    pub samples: Vec<f32>,
}

/// Current state of the capture pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Stopped,
}

/// Audio capture configuration
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Sample rate (default: 16000)
    pub sample_rate: u32,
    /// Number of channels (default: 1 for mono)
    pub channels: u32,
    /// Samples per frame handed to the encoder
    pub block_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            channels: 1,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Re-blocks arbitrarily sized device buffers into fixed-size frames
#[derive(Debug)]
pub struct FrameAssembler {
    block_size: usize,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
            next_sequence: 0,
        }
    }

    /// Append samples, returning every frame completed by them
    pub fn push(&mut self, samples: &[f32]) -> Vec<CapturedFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let room = self.block_size - self.pending.len();
            let take = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.block_size {
                let samples = std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.block_size),
                );
                frames.push(CapturedFrame {
                    sequence: self.next_sequence,
                    samples,
                });
                self.next_sequence += 1;
            }
        }

        frames
    }

    /// Number of samples waiting for the next full frame
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// A source of live microphone audio
pub trait InputDevice {
    /// Acquire a capture track. Fails with `DeviceUnavailable` when the
    /// device cannot be opened or access is denied.
    fn acquire(&mut self, config: &CaptureConfig) -> Result<Box<dyn InputTrack>, SessionError>;

    /// Release the device context. Safe to call more than once.
    fn close(&mut self) -> Result<(), SessionError>;
}

/// An acquired capture track
pub trait InputTrack {
    /// Connect the processing graph so frames flow to `frames`
    fn connect(&mut self, frames: FrameSender) -> Result<(), SessionError>;

    /// Disconnect the processing graph. Samples captured afterwards are
    /// discarded.
    fn disconnect(&mut self);

    /// Halt the underlying device track
    fn stop(&mut self) -> Result<(), SessionError>;
}

/// Drives frame delivery from an acquired track
pub struct CapturePipeline {
    state: CaptureState,
}

impl CapturePipeline {
    pub fn new() -> Self {
        Self {
            state: CaptureState::Idle,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Check if frames are currently flowing
    pub fn is_active(&self) -> bool {
        self.state == CaptureState::Capturing
    }

    /// Start delivering frames from `track`
    pub fn start(
        &mut self,
        track: &mut dyn InputTrack,
        frames: FrameSender,
    ) -> Result<(), SessionError> {
        if self.state == CaptureState::Capturing {
            return Ok(());
        }
        track.connect(frames)?;
        self.state = CaptureState::Capturing;
        info!("Capture pipeline started");
        Ok(())
    }

    /// Disconnect the processing graph. Idempotent.
    pub fn stop(&mut self, track: Option<&mut (dyn InputTrack + '_)>) {
        if self.state != CaptureState::Capturing {
            self.state = CaptureState::Stopped;
            return;
        }
        if let Some(track) = track {
            track.disconnect();
        }
        self.state = CaptureState::Stopped;
        info!("Capture pipeline stopped");
    }
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Microphone input through PipeWire
pub struct PipeWireInput {
    app_name: String,
}

impl PipeWireInput {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

impl InputDevice for PipeWireInput {
    fn acquire(&mut self, config: &CaptureConfig) -> Result<Box<dyn InputTrack>, SessionError> {
        let track = PipeWireTrack::open(config.clone(), self.app_name.clone())?;
        Ok(Box::new(track))
    }

    fn close(&mut self) -> Result<(), SessionError> {
        // Each track owns its own PipeWire context; nothing is shared here.
        Ok(())
    }
}

enum PipeWireCommand {
    Stop,
}

/// Frame routing shared with the PipeWire process callback
struct FrameRoute {
    assembler: FrameAssembler,
    sender: FrameSender,
}

/// A live PipeWire capture stream running on its own thread
pub struct PipeWireTrack {
    route: Arc<Mutex<Option<FrameRoute>>>,
    block_size: usize,
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<pw::channel::Sender<PipeWireCommand>>,
}

impl PipeWireTrack {
    const READY_TIMEOUT: Duration = Duration::from_secs(5);

    fn open(config: CaptureConfig, app_name: String) -> Result<Self, SessionError> {
        let route: Arc<Mutex<Option<FrameRoute>>> = Arc::new(Mutex::new(None));
        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();

        let thread_route = route.clone();
        let thread_config = config.clone();
        let handle = thread::spawn(move || {
            if let Err(e) = run_capture_loop(
                thread_config,
                app_name,
                thread_route,
                receiver,
                ready_tx.clone(),
            ) {
                error!("Capture loop failed: {}", e);
                let _ = ready_tx.send(Err(e));
            }
        });

        match ready_rx.recv_timeout(Self::READY_TIMEOUT) {
            Ok(Ok(())) => {
                info!(
                    "Acquired PipeWire capture track ({} Hz, {} ch)",
                    config.sample_rate, config.channels
                );
                Ok(Self {
                    route,
                    block_size: config.block_size,
                    thread_handle: Some(handle),
                    sender: Some(sender),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(SessionError::DeviceUnavailable(e))
            }
            Err(_) => {
                let _ = sender.send(PipeWireCommand::Stop);
                Err(SessionError::DeviceUnavailable(
                    "timed out waiting for PipeWire capture stream".to_string(),
                ))
            }
        }
    }
}

impl InputTrack for PipeWireTrack {
    fn connect(&mut self, frames: FrameSender) -> Result<(), SessionError> {
        let mut route = self
            .route
            .lock()
            .map_err(|_| SessionError::DeviceUnavailable("capture state poisoned".into()))?;
        *route = Some(FrameRoute {
            assembler: FrameAssembler::new(self.block_size),
            sender: frames,
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Ok(mut route) = self.route.lock() {
            if let Some(route) = route.take() {
                debug!(
                    "Discarding {} samples of partial frame",
                    route.assembler.pending_len()
                );
            }
        }
    }

    fn stop(&mut self) -> Result<(), SessionError> {
        self.disconnect();

        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PipeWireCommand::Stop);
        }

        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| SessionError::DeviceUnavailable("capture thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for PipeWireTrack {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Run the PipeWire capture loop in a background thread
fn run_capture_loop(
    config: CaptureConfig,
    app_name: String,
    route: Arc<Mutex<Option<FrameRoute>>>,
    receiver: pw::channel::Receiver<PipeWireCommand>,
    ready: std_mpsc::Sender<Result<(), String>>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    // Set up channel receiver to stop the loop
    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        PipeWireCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        route: Arc<Mutex<Option<FrameRoute>>>,
    }

    let user_data = UserData {
        format: Default::default(),
        route,
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => app_name.as_str(),
    };

    let stream = pw::stream::StreamBox::new(&core, "voicelink-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
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
                warn!("Failed to parse capture format: {:?}", e);
            }
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1);
            let n_samples = data.chunk().size() / (std::mem::size_of::<f32>() as u32);

            let Some(raw_samples) = data.data() else {
                return;
            };

            // Keep the first channel if the server hands us more than mono
            let mut mono_samples = Vec::with_capacity((n_samples / n_channels) as usize);
            for i in (0..n_samples).step_by(n_channels as usize) {
                let start = i as usize * std::mem::size_of::<f32>();
                let end = start + std::mem::size_of::<f32>();
                if end <= raw_samples.len() {
                    let sample =
                        f32::from_le_bytes(raw_samples[start..end].try_into().unwrap_or([0; 4]));
                    mono_samples.push(sample);
                }
            }

            let Ok(mut route) = user_data.route.lock() else {
                return;
            };
            let Some(active) = route.as_mut() else {
                return;
            };
            for frame in active.assembler.push(&mono_samples) {
                if active.sender.send(frame).is_err() {
                    // Session loop has gone away
                    *route = None;
                    return;
                }
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(config.sample_rate);
    audio_info.set_channels(config.channels);

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

    let pod = Pod::from_bytes(&values).ok_or("Failed to build audio format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    let _ = ready.send(Ok(()));

    // Run until stopped
    mainloop.run();

    Ok(())
}
