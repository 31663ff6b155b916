//! Gapless audio playback
//!
//! The scheduler decodes inbound PCM16 chunks and places each one on the
//! output clock exactly where the previous one ends. The PipeWire sink mixes
//! scheduled units into its output stream and keeps a sample-counted clock.

use log::{debug, error, info, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::collections::BTreeMap;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

use super::pcm::OUTPUT_SAMPLE_RATE;
use crate::errors::SessionError;

/// Identifier of a scheduled playback unit, unique within a session
pub type UnitId = u64;

/// Channel on which the sink reports units that finished playing
pub type EndedSender = mpsc::UnboundedSender<UnitId>;

/// Decoded mono audio ready to be scheduled
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// An audio sink that can start buffers at absolute clock times
pub trait OutputSink {
    /// Current output clock time in seconds. Monotonic.
    fn now(&self) -> f64;

    /// Start `buffer` at absolute time `start_at`. The sink reports `id`
    /// on its ended channel once playback completes.
    ///
    /// Returns the time the unit actually starts, which is later than
    /// `start_at` if the clock has already passed it.
    fn schedule(
        &mut self,
        id: UnitId,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<f64, SessionError>;

    /// Stop a unit regardless of its playback progress
    fn stop(&mut self, id: UnitId);

    /// Release the output device context. Safe to call more than once.
    fn close(&mut self) -> Result<(), SessionError>;
}

/// A unit in the scheduler's active set
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduledUnit {
    pub id: UnitId,
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledUnit {
    #[cfg(test)]
    pub fn end(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Places decoded chunks back to back on the output clock
pub struct PlaybackScheduler {
    watermark: f64,
    sample_rate: u32,
    active: BTreeMap<UnitId, ScheduledUnit>,
    next_id: UnitId,
}

impl PlaybackScheduler {
    /// Create a scheduler whose watermark starts at the sink's current time
    pub fn new(sink: &dyn OutputSink) -> Self {
        Self::with_sample_rate(sink, OUTPUT_SAMPLE_RATE)
    }

    pub fn with_sample_rate(sink: &dyn OutputSink, sample_rate: u32) -> Self {
        Self {
            watermark: sink.now(),
            sample_rate,
            active: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Absolute time at which the next unit will start
    pub fn watermark(&self) -> f64 {
        self.watermark
    }

    /// Number of units scheduled and not yet ended
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Schedule decoded samples at the scheduler's output rate
    pub fn enqueue_samples(
        &mut self,
        sink: &mut dyn OutputSink,
        samples: Vec<f32>,
    ) -> Result<ScheduledUnit, SessionError> {
        self.enqueue(sink, PlaybackBuffer::new(samples, self.sample_rate))
    }

    /// Schedule a decoded buffer at the watermark and advance it
    pub fn enqueue(
        &mut self,
        sink: &mut dyn OutputSink,
        buffer: PlaybackBuffer,
    ) -> Result<ScheduledUnit, SessionError> {
        // Resynchronize after idle periods rather than scheduling in the past
        let now = sink.now();
        if now > self.watermark {
            debug!(
                "Watermark {:.3}s behind clock {:.3}s, resynchronizing",
                self.watermark, now
            );
            self.watermark = now;
        }

        let id = self.next_id;
        self.next_id += 1;

        let duration = buffer.duration();
        let start_at = sink.schedule(id, buffer, self.watermark)?;
        let unit = ScheduledUnit {
            id,
            start_at,
            duration,
        };

        self.watermark = start_at.max(self.watermark) + duration;
        self.active.insert(id, unit);

        Ok(unit)
    }

    /// Remove a unit whose playback has ended
    pub fn on_ended(&mut self, id: UnitId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Stop every active unit and empty the active set
    pub fn stop_all(&mut self, sink: &mut dyn OutputSink) -> usize {
        let stopped = self.active.len();
        for id in self.active.keys() {
            sink.stop(*id);
        }
        self.active.clear();
        stopped
    }
}

struct TimelineUnit {
    id: UnitId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl TimelineUnit {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Sample-accurate mix of scheduled units against a frame counter
pub struct Timeline {
    sample_rate: u32,
    position: u64,
    units: Vec<TimelineUnit>,
}

impl Timeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            position: 0,
            units: Vec::new(),
        }
    }

    /// Clock time in seconds of the next frame to be rendered
    pub fn now(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }

    /// Add a unit starting at `start_at`, or at the current position if
    /// that has already been rendered. Returns the start time used.
    pub fn insert(&mut self, id: UnitId, start_at: f64, samples: Vec<f32>) -> f64 {
        let requested = (start_at * self.sample_rate as f64).round().max(0.0) as u64;
        let start_frame = requested.max(self.position);
        if start_frame > requested {
            debug!(
                "Unit {} arrived {} frames late, starting at {}",
                id,
                start_frame - requested,
                start_frame
            );
        }
        self.units.push(TimelineUnit {
            id,
            start_frame,
            samples,
        });
        start_frame as f64 / self.sample_rate as f64
    }

    pub fn remove(&mut self, id: UnitId) -> bool {
        let before = self.units.len();
        self.units.retain(|unit| unit.id != id);
        self.units.len() != before
    }

    pub fn clear(&mut self) {
        self.units.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Mix the next `out.len()` frames and advance the clock.
    ///
    /// Returns the ids of units that finished within this window.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<UnitId> {
        out.fill(0.0);
        let window_start = self.position;
        let window_end = self.position + out.len() as u64;

        for unit in &self.units {
            let from = unit.start_frame.max(window_start);
            let to = unit.end_frame().min(window_end);
            for frame in from..to {
                out[(frame - window_start) as usize] +=
                    unit.samples[(frame - unit.start_frame) as usize];
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.position = window_end;

        let mut ended = Vec::new();
        self.units.retain(|unit| {
            if unit.end_frame() <= window_end {
                ended.push(unit.id);
                false
            } else {
                true
            }
        });
        ended
    }
}

/// Output configuration
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Sample rate (default: 24000)
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }
}

enum PlaybackCommand {
    Stop,
}

/// Speaker output through PipeWire with a scheduling timeline
pub struct PipeWireOutput {
    timeline: Arc<Mutex<Timeline>>,
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<pw::channel::Sender<PlaybackCommand>>,
}

impl PipeWireOutput {
    const READY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open the output stream. It renders silence until units are scheduled.
    pub fn open(
        config: PlaybackConfig,
        app_name: impl Into<String>,
        ended: EndedSender,
    ) -> Result<Self, SessionError> {
        let timeline = Arc::new(Mutex::new(Timeline::new(config.sample_rate)));
        let (sender, receiver) = pw::channel::channel::<PlaybackCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
        let app_name = app_name.into();

        let thread_timeline = timeline.clone();
        let handle = thread::spawn(move || {
            if let Err(e) = run_playback_loop(
                config,
                app_name,
                thread_timeline,
                ended,
                receiver,
                ready_tx.clone(),
            ) {
                error!("Playback loop failed: {}", e);
                let _ = ready_tx.send(Err(e));
            }
        });

        match ready_rx.recv_timeout(Self::READY_TIMEOUT) {
            Ok(Ok(())) => {
                info!("PipeWire output stream ready");
                Ok(Self {
                    timeline,
                    thread_handle: Some(handle),
                    sender: Some(sender),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(SessionError::OutputDevice(e))
            }
            Err(_) => {
                let _ = sender.send(PlaybackCommand::Stop);
                Err(SessionError::OutputDevice(
                    "timed out waiting for PipeWire output stream".to_string(),
                ))
            }
        }
    }
}

impl OutputSink for PipeWireOutput {
    fn now(&self) -> f64 {
        match self.timeline.lock() {
            Ok(timeline) => timeline.now(),
            Err(poisoned) => poisoned.into_inner().now(),
        }
    }

    fn schedule(
        &mut self,
        id: UnitId,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<f64, SessionError> {
        if self.sender.is_none() {
            return Err(SessionError::OutputDevice("output stream closed".into()));
        }
        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| SessionError::OutputDevice("playback timeline poisoned".into()))?;
        if buffer.sample_rate != timeline.sample_rate {
            warn!(
                "Unit {} is {} Hz, output runs at {} Hz",
                id, buffer.sample_rate, timeline.sample_rate
            );
        }
        Ok(timeline.insert(id, start_at, buffer.samples))
    }

    fn stop(&mut self, id: UnitId) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.remove(id);
        }
    }

    fn close(&mut self) -> Result<(), SessionError> {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.clear();
        }

        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PlaybackCommand::Stop);
        }

        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| SessionError::OutputDevice("playback thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for PipeWireOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Run the PipeWire playback loop in a background thread
fn run_playback_loop(
    config: PlaybackConfig,
    app_name: String,
    timeline: Arc<Mutex<Timeline>>,
    ended: EndedSender,
    receiver: pw::channel::Receiver<PlaybackCommand>,
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

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        PlaybackCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        timeline: Arc<Mutex<Timeline>>,
        ended: EndedSender,
        scratch: Vec<f32>,
    }

    let user_data = UserData {
        format: Default::default(),
        timeline,
        ended,
        scratch: Vec::new(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => app_name.as_str(),
    };

    let stream = pw::stream::StreamBox::new(&core, "voicelink-playback", props)
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
                warn!("Failed to parse playback format: {:?}", e);
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
            let n_channels = user_data.format.channels().max(1) as usize;
            let stride = std::mem::size_of::<f32>() * n_channels;

            let Some(slice) = data.data() else {
                return;
            };

            let n_frames = slice.len() / stride;
            user_data.scratch.resize(n_frames, 0.0);

            let ended = match user_data.timeline.lock() {
                Ok(mut timeline) => timeline.render(&mut user_data.scratch),
                Err(_) => {
                    user_data.scratch.fill(0.0);
                    Vec::new()
                }
            };

            // Duplicate the mono mix into every output channel
            for (i, &sample) in user_data.scratch.iter().enumerate() {
                let bytes = sample.to_le_bytes();
                for channel in 0..n_channels {
                    let offset = i * stride + channel * 4;
                    slice[offset..offset + 4].copy_from_slice(&bytes);
                }
            }

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (n_frames * stride) as u32;

            for id in ended {
                let _ = user_data.ended.send(id);
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(config.sample_rate);
    audio_info.set_channels(1);

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
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    let _ = ready.send(Ok(()));

    mainloop.run();

    Ok(())
}
