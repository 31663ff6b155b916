//! Duplex voice session
//!
//! A `Session` owns one connect/disconnect cycle: the input track, the
//! playback scheduler, the channel and the pending outbound queue. All of
//! its methods run on the controller's single event loop, so nothing here
//! is shared or locked.

pub mod channel;
pub mod protocol;

#[cfg(test)]
mod tests;

use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;

use crate::audio::pcm::{mime_sample_rate, OUTPUT_SAMPLE_RATE};
use crate::audio::{
    decode_pcm16, encode_frame, CaptureConfig, CapturePipeline, CapturedFrame, EncodedAudioPacket,
    FrameSender, InputDevice, InputTrack, OutputSink, PlaybackScheduler, SessionRecording,
    UnitId,
};
use crate::errors::SessionError;
use crate::tools::ToolHandler;
use channel::{ChannelEvent, ChannelEventSender, Connector, DuplexChannel};
use protocol::{ClientMessage, ServerMessage, SetupConfig, ToolInvocation};

/// Lifecycle state of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Errored,
}

impl SessionState {
    /// Disconnected and Errored sessions cannot be reused
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Errored)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coarse lifecycle notifications for the UI
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Connecting => "Connecting",
            Status::Connected => "Connected",
            Status::Disconnected => "Disconnected",
            Status::Error => "Error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives lifecycle notifications
pub type StatusCallback = Box<dyn FnMut(Status)>;

/// Senders the session hands to its devices and channel
#[derive(Clone)]
pub struct SessionEvents {
    pub frames: FrameSender,
    pub channel: ChannelEventSender,
}

/// Everything a session needs from the outside world
pub struct Collaborators {
    pub input: Box<dyn InputDevice>,
    pub output: Box<dyn OutputSink>,
    pub connector: Box<dyn Connector>,
    pub tools: Box<dyn ToolHandler>,
    pub status: StatusCallback,
}

/// An outbound message waiting for the channel
struct Pending {
    message: ClientMessage,
    /// Queued before the channel opened. Never dropped for backpressure.
    deferred: bool,
}

/// One realtime voice session
pub struct Session {
    state: SessionState,
    setup: SetupConfig,
    capture_config: CaptureConfig,
    input: Box<dyn InputDevice>,
    output: Box<dyn OutputSink>,
    connector: Box<dyn Connector>,
    tools: Box<dyn ToolHandler>,
    status: StatusCallback,
    track: Option<Box<dyn InputTrack>>,
    capture: CapturePipeline,
    scheduler: PlaybackScheduler,
    channel: Option<Box<dyn DuplexChannel>>,
    outbound: VecDeque<Pending>,
    frames: Option<FrameSender>,
    recording: Option<SessionRecording>,
    torn_down: bool,
}

impl Session {
    pub fn new(setup: SetupConfig, capture_config: CaptureConfig, parts: Collaborators) -> Self {
        let scheduler = PlaybackScheduler::new(parts.output.as_ref());
        Self {
            state: SessionState::Idle,
            setup,
            capture_config,
            input: parts.input,
            output: parts.output,
            connector: parts.connector,
            tools: parts.tools,
            status: parts.status,
            track: None,
            capture: CapturePipeline::new(),
            scheduler,
            channel: None,
            outbound: VecDeque::new(),
            frames: None,
            recording: None,
            torn_down: false,
        }
    }

    /// Keep a copy of sent and received audio for `take_recording`
    pub fn with_recording(mut self) -> Self {
        self.recording = Some(SessionRecording::default());
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of playback units scheduled and not yet ended
    pub fn active_playback_units(&self) -> usize {
        self.scheduler.active_len()
    }

    /// Output clock time at which the next inbound chunk will start
    pub fn watermark(&self) -> f64 {
        self.scheduler.watermark()
    }

    /// Messages waiting for the channel to open
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_active()
    }

    pub fn take_recording(&mut self) -> Option<SessionRecording> {
        self.recording.take()
    }

    fn set_state(&mut self, state: SessionState) {
        debug!("Session {} -> {}", self.state, state);
        self.state = state;
    }

    fn notify(&mut self, status: Status) {
        info!("Session status: {}", status);
        (self.status)(status);
    }

    /// Acquire the microphone and begin opening the channel.
    ///
    /// Only valid on an `Idle` session. Any failure moves the session to
    /// `Errored`, reports `Error` and releases whatever was acquired.
    pub fn connect(&mut self, events: SessionEvents) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState(self.state.to_string()));
        }

        self.set_state(SessionState::Connecting);
        self.notify(Status::Connecting);
        self.frames = Some(events.frames);

        match self.input.acquire(&self.capture_config) {
            Ok(track) => self.track = Some(track),
            Err(e) => {
                error!("Microphone acquisition failed: {}", e);
                self.fail();
                return Err(e);
            }
        }

        match self.connector.open(&self.setup, events.channel) {
            Ok(channel) => self.channel = Some(channel),
            Err(e) => {
                error!("Channel open failed: {}", e);
                self.fail();
                return Err(e);
            }
        }

        Ok(())
    }

    /// User-initiated disconnect. A no-op on Idle or terminated sessions.
    pub fn disconnect(&mut self) {
        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                self.teardown();
                self.set_state(SessionState::Disconnected);
                self.notify(Status::Disconnected);
            }
            SessionState::Idle | SessionState::Disconnected | SessionState::Errored => {
                debug!("Disconnect ignored in state {}", self.state);
            }
        }
    }

    /// Queue an encoded packet. Deferred while connecting, transmitted in
    /// order once open, dropped after the session ends.
    pub fn send_audio(&mut self, packet: EncodedAudioPacket) {
        self.enqueue(ClientMessage::audio(packet));
    }

    /// Handle a frame from the capture pipeline
    pub fn handle_frame(&mut self, frame: CapturedFrame) {
        if !self.capture.is_active() {
            debug!("Dropping frame {} captured while stopped", frame.sequence);
            return;
        }

        let packet = encode_frame(&frame);
        if let Some(recording) = self.recording.as_mut() {
            recording.captured.extend_from_slice(&frame.samples);
        }
        self.send_audio(packet);
    }

    /// Handle a lifecycle or message event from the channel
    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        match (self.state, event) {
            (SessionState::Connecting, ChannelEvent::Open) => self.on_open(),
            (SessionState::Connected, ChannelEvent::Message(message)) => {
                self.handle_message(message)
            }
            (SessionState::Connecting | SessionState::Connected, ChannelEvent::Close(reason)) => {
                info!(
                    "Channel closed by endpoint: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.teardown();
                self.set_state(SessionState::Disconnected);
                self.notify(Status::Disconnected);
            }
            (SessionState::Connecting | SessionState::Connected, ChannelEvent::Error(e)) => {
                error!("{}", SessionError::ChannelError(e));
                self.fail();
            }
            (state, event) => {
                debug!("Ignoring {:?} in state {}", event, state);
            }
        }
    }

    /// Handle a playback-ended notification from the output sink
    pub fn handle_playback_ended(&mut self, id: UnitId) {
        if !self.scheduler.on_ended(id) {
            debug!("Ended notification for unknown unit {}", id);
        }
    }

    fn on_open(&mut self) {
        self.set_state(SessionState::Connected);
        self.notify(Status::Connected);

        let started = match (self.track.as_deref_mut(), self.frames.clone()) {
            (Some(track), Some(frames)) => self.capture.start(track, frames),
            _ => Err(SessionError::DeviceUnavailable("no capture track".into())),
        };
        if let Err(e) = started {
            error!("Failed to start capture: {}", e);
            self.fail();
            return;
        }

        self.flush_outbound();
    }

    fn handle_message(&mut self, message: ServerMessage) {
        for blob in message.audio_payloads() {
            if let Some(rate) = mime_sample_rate(&blob.mime_type) {
                if rate != OUTPUT_SAMPLE_RATE {
                    warn!(
                        "Inbound audio declares {} Hz, playing at {} Hz",
                        rate, OUTPUT_SAMPLE_RATE
                    );
                }
            }
            let samples = match decode_pcm16(&blob.data) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("Dropping inbound audio chunk: {}", e);
                    continue;
                }
            };
            if let Some(recording) = self.recording.as_mut() {
                recording.received.extend_from_slice(&samples);
            }
            match self.scheduler.enqueue_samples(self.output.as_mut(), samples) {
                Ok(unit) => debug!(
                    "Scheduled unit {} at {:.3}s for {:.3}s",
                    unit.id, unit.start_at, unit.duration
                ),
                Err(e) => warn!("Failed to schedule inbound audio chunk: {}", e),
            }
        }

        for text in message.text_parts() {
            debug!("Model text: {}", text);
        }

        if let Some(content) = &message.server_content {
            if content.interrupted {
                debug!("Model turn interrupted");
            }
            if content.turn_complete {
                debug!("Model turn complete");
            }
        }

        for invocation in message.tool_invocations() {
            self.run_tool(invocation);
        }

        if let Some(cancellation) = &message.tool_call_cancellation {
            debug!("Endpoint cancelled tool calls {:?}", cancellation.ids);
        }

        if message.go_away.is_some() {
            warn!("Endpoint announced it will close the session soon");
        }
    }

    fn run_tool(&mut self, invocation: &ToolInvocation) {
        info!("Tool call {} ({})", invocation.name, invocation.id);
        let response = match self.tools.handle(invocation) {
            Ok(effect) => {
                debug!("Tool {} produced {}", invocation.name, effect);
                json!({ "result": "ok" })
            }
            Err(e) => {
                warn!("Tool {} failed: {}", invocation.name, e);
                json!({ "error": e })
            }
        };

        self.enqueue(ClientMessage::tool_result(
            invocation.id.clone(),
            invocation.name.clone(),
            response,
        ));
    }

    fn enqueue(&mut self, message: ClientMessage) {
        match self.state {
            SessionState::Connecting => self.outbound.push_back(Pending {
                message,
                deferred: true,
            }),
            SessionState::Connected => {
                self.outbound.push_back(Pending {
                    message,
                    deferred: false,
                });
                self.flush_outbound();
            }
            state => debug!("Dropping {} in state {}", message.kind(), state),
        }
    }

    /// Whether messages deferred before open are still waiting for room
    /// in the channel
    pub fn has_backlog(&self) -> bool {
        self.state == SessionState::Connected && !self.outbound.is_empty()
    }

    /// Retry sending the backlog after the channel has had time to drain
    pub fn flush_pending(&mut self) {
        if self.state == SessionState::Connected {
            self.flush_outbound();
        }
    }

    fn flush_outbound(&mut self) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        while let Some(pending) = self.outbound.pop_front() {
            match channel.send(&pending.message) {
                Ok(()) => {}
                Err(SessionError::QueueFull) if pending.deferred => {
                    debug!(
                        "Channel full, holding {} deferred messages",
                        self.outbound.len() + 1
                    );
                    self.outbound.push_front(pending);
                    break;
                }
                Err(e) => warn!("Dropping outbound {}: {}", pending.message.kind(), e),
            }
        }
    }

    fn fail(&mut self) {
        self.teardown();
        self.set_state(SessionState::Errored);
        self.notify(Status::Error);
    }

    /// Release every resource the session holds. Each step runs even if an
    /// earlier one fails; errors are logged and swallowed.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.capture.stop(self.track.as_deref_mut());
        self.frames = None;

        let stopped = self.scheduler.stop_all(self.output.as_mut());
        if stopped > 0 {
            debug!("Stopped {} playback units", stopped);
        }

        if let Some(mut track) = self.track.take() {
            if let Err(e) = track.stop() {
                warn!("Ignoring error while stopping input track: {}", e);
            }
        }

        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        let dropped = self.outbound.len();
        self.outbound.clear();
        if dropped > 0 {
            debug!("Discarded {} unsent messages", dropped);
        }

        if let Err(e) = self.input.close() {
            warn!("Ignoring error while closing input device: {}", e);
        }
        if let Err(e) = self.output.close() {
            warn!("Ignoring error while closing output device: {}", e);
        }

        info!("Session resources released");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
