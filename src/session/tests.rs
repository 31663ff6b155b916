use std::cell::{Cell, RefCell};
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::channel::{ChannelEvent, ChannelEventSender, Connector, DuplexChannel};
use super::protocol::{ClientMessage, GenerationConfig, ServerMessage, SetupConfig, ToolInvocation};
use super::*;
use crate::audio::pcm::encode_samples;
use crate::audio::{
    CaptureConfig, CapturedFrame, FrameSender, InputDevice, InputTrack, OutputSink,
    PlaybackBuffer, UnitId,
};
use crate::errors::SessionError;

type Log = Rc<RefCell<Vec<String>>>;

#[derive(Default, Clone)]
struct Faults {
    deny_microphone: bool,
    refuse_channel: bool,
    track_stop_fails: bool,
    input_close_fails: bool,
}

struct FakeInput {
    log: Log,
    faults: Faults,
}

impl InputDevice for FakeInput {
    fn acquire(&mut self, config: &CaptureConfig) -> Result<Box<dyn InputTrack>, SessionError> {
        assert_eq!(config.block_size, 4096);
        if self.faults.deny_microphone {
            return Err(SessionError::DeviceUnavailable("permission denied".into()));
        }
        self.log.borrow_mut().push("input.acquire".into());
        Ok(Box::new(FakeTrack {
            log: self.log.clone(),
            fail_stop: self.faults.track_stop_fails,
        }))
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.log.borrow_mut().push("input.close".into());
        if self.faults.input_close_fails {
            return Err(SessionError::DeviceUnavailable("already released".into()));
        }
        Ok(())
    }
}

struct FakeTrack {
    log: Log,
    fail_stop: bool,
}

impl InputTrack for FakeTrack {
    fn connect(&mut self, _frames: FrameSender) -> Result<(), SessionError> {
        self.log.borrow_mut().push("track.connect".into());
        Ok(())
    }

    fn disconnect(&mut self) {
        self.log.borrow_mut().push("track.disconnect".into());
    }

    fn stop(&mut self) -> Result<(), SessionError> {
        self.log.borrow_mut().push("track.stop".into());
        if self.fail_stop {
            return Err(SessionError::DeviceUnavailable("track gone".into()));
        }
        Ok(())
    }
}

struct FakeSink {
    log: Log,
    now: Rc<Cell<f64>>,
    scheduled: Rc<RefCell<Vec<(UnitId, f64)>>>,
}

impl OutputSink for FakeSink {
    fn now(&self) -> f64 {
        self.now.get()
    }

    fn schedule(
        &mut self,
        id: UnitId,
        _buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<f64, SessionError> {
        self.scheduled.borrow_mut().push((id, start_at));
        Ok(start_at)
    }

    fn stop(&mut self, id: UnitId) {
        self.log.borrow_mut().push(format!("sink.stop {}", id));
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.log.borrow_mut().push("sink.close".into());
        Ok(())
    }
}

struct FakeConnector {
    log: Log,
    sent: Rc<RefCell<Vec<ClientMessage>>>,
    room: Rc<Cell<usize>>,
    refuse: bool,
}

impl Connector for FakeConnector {
    fn open(
        &mut self,
        setup: &SetupConfig,
        _events: ChannelEventSender,
    ) -> Result<Box<dyn DuplexChannel>, SessionError> {
        assert_eq!(setup.model, "models/test");
        if self.refuse {
            return Err(SessionError::ChannelOpenFailure("bad endpoint".into()));
        }
        self.log.borrow_mut().push("channel.open".into());
        Ok(Box::new(FakeChannel {
            log: self.log.clone(),
            sent: self.sent.clone(),
            room: self.room.clone(),
        }))
    }
}

/// Channel whose transmit queue holds `room` more messages
struct FakeChannel {
    log: Log,
    sent: Rc<RefCell<Vec<ClientMessage>>>,
    room: Rc<Cell<usize>>,
}

impl DuplexChannel for FakeChannel {
    fn send(&mut self, message: &ClientMessage) -> Result<(), SessionError> {
        if self.room.get() == 0 {
            return Err(SessionError::QueueFull);
        }
        self.room.set(self.room.get() - 1);
        self.sent.borrow_mut().push(message.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.log.borrow_mut().push("channel.close".into());
    }
}

struct Harness {
    log: Log,
    sent: Rc<RefCell<Vec<ClientMessage>>>,
    room: Rc<Cell<usize>>,
    statuses: Rc<RefCell<Vec<Status>>>,
    tool_calls: Rc<RefCell<Vec<String>>>,
    now: Rc<Cell<f64>>,
    scheduled: Rc<RefCell<Vec<(UnitId, f64)>>>,
    events: SessionEvents,
    _frames_rx: mpsc::UnboundedReceiver<CapturedFrame>,
    _channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Harness {
    fn teardown_log(&self) -> Vec<String> {
        self.log
            .borrow()
            .iter()
            .filter(|entry| {
                !matches!(
                    entry.as_str(),
                    "input.acquire" | "channel.open" | "track.connect"
                )
            })
            .cloned()
            .collect()
    }
}

fn setup() -> SetupConfig {
    SetupConfig {
        model: "models/test".into(),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".into()],
            speech_config: None,
        },
        system_instruction: None,
        tools: Vec::new(),
    }
}

fn build(faults: Faults) -> (Session, Harness) {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sent = Rc::new(RefCell::new(Vec::new()));
    let room = Rc::new(Cell::new(usize::MAX));
    let statuses = Rc::new(RefCell::new(Vec::new()));
    let tool_calls = Rc::new(RefCell::new(Vec::new()));
    let now = Rc::new(Cell::new(0.0));
    let scheduled = Rc::new(RefCell::new(Vec::new()));

    let status_sink = statuses.clone();
    let call_sink = tool_calls.clone();
    let parts = Collaborators {
        input: Box::new(FakeInput {
            log: log.clone(),
            faults: faults.clone(),
        }),
        output: Box::new(FakeSink {
            log: log.clone(),
            now: now.clone(),
            scheduled: scheduled.clone(),
        }),
        connector: Box::new(FakeConnector {
            log: log.clone(),
            sent: sent.clone(),
            room: room.clone(),
            refuse: faults.refuse_channel,
        }),
        tools: Box::new(move |call: &ToolInvocation| -> Result<Value, String> {
            call_sink.borrow_mut().push(call.id.clone());
            if call.name == "broken" {
                return Err("renderer crashed".into());
            }
            Ok(json!({ "shown": call.args }))
        }),
        status: Box::new(move |status| status_sink.borrow_mut().push(status)),
    };

    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (channel_tx, channel_rx) = mpsc::unbounded_channel();
    let session = Session::new(setup(), CaptureConfig::default(), parts);

    let harness = Harness {
        log,
        sent,
        room,
        statuses,
        tool_calls,
        now,
        scheduled,
        events: SessionEvents {
            frames: frames_tx,
            channel: channel_tx,
        },
        _frames_rx: frames_rx,
        _channel_rx: channel_rx,
    };
    (session, harness)
}

fn connected() -> (Session, Harness) {
    let (mut session, harness) = build(Faults::default());
    session.connect(harness.events.clone()).unwrap();
    session.handle_channel_event(ChannelEvent::Open);
    assert_eq!(session.state(), SessionState::Connected);
    (session, harness)
}

fn audio_chunk(samples: usize) -> String {
    encode_samples(&vec![0.1; samples]).data
}

fn audio_message(chunks: &[String]) -> ServerMessage {
    let parts: Vec<Value> = chunks
        .iter()
        .map(|data| json!({ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": data } }))
        .collect();
    serde_json::from_value(json!({ "serverContent": { "modelTurn": { "parts": parts } } })).unwrap()
}

fn tool_responses(sent: &[ClientMessage]) -> Vec<(String, String, Value)> {
    sent.iter()
        .filter_map(|message| match message {
            ClientMessage::ToolResponse(response) => Some(response),
            _ => None,
        })
        .flat_map(|response| response.function_responses.iter())
        .map(|r| (r.id.clone(), r.name.clone(), r.response.clone()))
        .collect()
}

#[test]
fn test_disconnect_idle_is_noop() {
    let (mut session, harness) = build(Faults::default());
    session.disconnect();
    session.disconnect();

    assert_eq!(session.state(), SessionState::Idle);
    assert!(harness.statuses.borrow().is_empty());
    assert!(harness.log.borrow().is_empty());
}

#[test]
fn test_connect_reports_connecting_then_connected() {
    let (mut session, harness) = build(Faults::default());
    session.connect(harness.events.clone()).unwrap();
    assert_eq!(session.state(), SessionState::Connecting);
    assert!(!session.is_capturing());

    session.handle_channel_event(ChannelEvent::Open);
    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.is_capturing());
    assert_eq!(*harness.statuses.borrow(), vec![Status::Connecting, Status::Connected]);
    assert_eq!(
        *harness.log.borrow(),
        vec!["input.acquire", "channel.open", "track.connect"]
    );
}

#[test]
fn test_connect_twice_is_rejected() {
    let (mut session, harness) = connected();
    assert!(matches!(
        session.connect(harness.events.clone()),
        Err(SessionError::InvalidState(_))
    ));
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn test_audio_sent_while_connecting_is_deferred_until_open() {
    let (mut session, harness) = build(Faults::default());
    session.connect(harness.events.clone()).unwrap();

    let first = encode_samples(&[0.1; 8]);
    let second = encode_samples(&[0.2; 8]);
    session.send_audio(first.clone());
    session.send_audio(second.clone());

    assert_eq!(session.pending_outbound(), 2);
    assert!(harness.sent.borrow().is_empty());

    session.handle_channel_event(ChannelEvent::Open);

    assert_eq!(session.pending_outbound(), 0);
    assert_eq!(
        *harness.sent.borrow(),
        vec![ClientMessage::audio(first), ClientMessage::audio(second)]
    );
}

#[test]
fn test_deferred_audio_waits_for_channel_room() {
    let (mut session, harness) = build(Faults::default());
    session.connect(harness.events.clone()).unwrap();

    let packets: Vec<_> = (0..10)
        .map(|i| encode_samples(&[i as f32 / 10.0; 4]))
        .collect();
    for packet in &packets {
        session.send_audio(packet.clone());
    }

    harness.room.set(3);
    session.handle_channel_event(ChannelEvent::Open);
    assert_eq!(harness.sent.borrow().len(), 3);
    assert_eq!(session.pending_outbound(), 7);
    assert!(session.has_backlog());

    // Sent after open, so it queues behind the backlog
    let live = encode_samples(&[0.9; 4]);
    session.send_audio(live.clone());
    assert_eq!(session.pending_outbound(), 8);

    session.flush_pending();
    assert_eq!(harness.sent.borrow().len(), 3);

    harness.room.set(usize::MAX);
    session.flush_pending();
    assert!(!session.has_backlog());

    let mut expected: Vec<ClientMessage> = packets.into_iter().map(ClientMessage::audio).collect();
    expected.push(ClientMessage::audio(live));
    assert_eq!(*harness.sent.borrow(), expected);
}

#[test]
fn test_live_audio_dropped_when_channel_full() {
    let (mut session, harness) = connected();
    harness.room.set(0);

    session.send_audio(encode_samples(&[0.0; 4]));

    assert_eq!(session.pending_outbound(), 0);
    assert!(harness.sent.borrow().is_empty());
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn test_frames_flow_only_while_capturing() {
    let (mut session, harness) = build(Faults::default());
    session.connect(harness.events.clone()).unwrap();

    session.handle_frame(CapturedFrame {
        sequence: 0,
        samples: vec![0.0; 4096],
    });
    assert_eq!(session.pending_outbound(), 0);

    session.handle_channel_event(ChannelEvent::Open);
    session.handle_frame(CapturedFrame {
        sequence: 1,
        samples: vec![0.0; 4096],
    });

    let sent = harness.sent.borrow();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        ClientMessage::RealtimeInput(input) => {
            assert_eq!(input.media_chunks[0].mime_type, "audio/pcm;rate=16000");
            let bytes = B64.decode(&input.media_chunks[0].data).unwrap();
            assert_eq!(bytes.len(), 8192);
            assert!(bytes.iter().all(|&b| b == 0));
        }
        other => panic!("expected audio, got {:?}", other),
    }
}

#[test]
fn test_microphone_denied_errors_the_session() {
    let (mut session, harness) = build(Faults {
        deny_microphone: true,
        ..Default::default()
    });

    let err = session.connect(harness.events.clone()).unwrap_err();
    assert!(matches!(err, SessionError::DeviceUnavailable(_)));
    assert_eq!(session.state(), SessionState::Errored);
    assert_eq!(*harness.statuses.borrow(), vec![Status::Connecting, Status::Error]);
    assert!(!harness.log.borrow().contains(&"channel.open".to_string()));

    // Terminal: a later open is ignored
    session.handle_channel_event(ChannelEvent::Open);
    assert_eq!(session.state(), SessionState::Errored);
}

#[test]
fn test_channel_open_failure_releases_track() {
    let (mut session, harness) = build(Faults {
        refuse_channel: true,
        ..Default::default()
    });

    let err = session.connect(harness.events.clone()).unwrap_err();
    assert!(matches!(err, SessionError::ChannelOpenFailure(_)));
    assert_eq!(session.state(), SessionState::Errored);
    assert!(harness.log.borrow().contains(&"track.stop".to_string()));
}

#[test]
fn test_channel_error_while_connecting() {
    let (mut session, harness) = build(Faults::default());
    session.connect(harness.events.clone()).unwrap();
    session.send_audio(encode_samples(&[0.0; 4]));

    session.handle_channel_event(ChannelEvent::Error("handshake refused".into()));

    assert_eq!(session.state(), SessionState::Errored);
    assert_eq!(*harness.statuses.borrow(), vec![Status::Connecting, Status::Error]);
    assert_eq!(session.pending_outbound(), 0);
    assert!(harness.sent.borrow().is_empty());
}

#[test]
fn test_close_with_scheduled_units_disconnects() {
    let (mut session, harness) = connected();
    session.handle_channel_event(ChannelEvent::Message(audio_message(&[
        audio_chunk(2400),
        audio_chunk(2400),
        audio_chunk(2400),
    ])));
    assert_eq!(session.active_playback_units(), 3);

    session.handle_channel_event(ChannelEvent::Close(None));

    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(harness.statuses.borrow().last(), Some(&Status::Disconnected));
    assert_eq!(session.active_playback_units(), 0);

    // Nothing is scheduled after the close
    session.handle_channel_event(ChannelEvent::Message(audio_message(&[audio_chunk(2400)])));
    assert_eq!(harness.scheduled.borrow().len(), 3);
    assert_eq!(session.active_playback_units(), 0);
}

#[test]
fn test_disconnect_stops_every_unit_in_order() {
    let (mut session, harness) = connected();
    session.handle_channel_event(ChannelEvent::Message(audio_message(&[
        audio_chunk(480),
        audio_chunk(480),
    ])));
    session.handle_playback_ended(0);
    session.handle_channel_event(ChannelEvent::Message(audio_message(&[audio_chunk(480)])));
    assert_eq!(session.active_playback_units(), 2);

    session.disconnect();

    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.active_playback_units(), 0);
    assert_eq!(
        harness.teardown_log(),
        vec![
            "track.disconnect",
            "sink.stop 1",
            "sink.stop 2",
            "track.stop",
            "channel.close",
            "input.close",
            "sink.close",
        ]
    );

    // Re-entrant disconnect does nothing
    let before = harness.log.borrow().len();
    session.disconnect();
    assert_eq!(harness.log.borrow().len(), before);
    assert_eq!(
        harness
            .statuses
            .borrow()
            .iter()
            .filter(|s| **s == Status::Disconnected)
            .count(),
        1
    );
}

#[test]
fn test_teardown_continues_past_failures() {
    let (mut session, harness) = build(Faults {
        track_stop_fails: true,
        input_close_fails: true,
        ..Default::default()
    });
    session.connect(harness.events.clone()).unwrap();
    session.handle_channel_event(ChannelEvent::Open);

    session.disconnect();

    let log = harness.teardown_log();
    assert!(log.contains(&"channel.close".to_string()));
    assert!(log.contains(&"sink.close".to_string()));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn test_two_tool_calls_get_two_correlated_responses() {
    let (mut session, harness) = connected();
    let message: ServerMessage = serde_json::from_value(json!({
        "toolCall": { "functionCalls": [
            { "id": "call-a", "name": "display_document", "args": { "title": "A" } },
            { "id": "call-b", "name": "broken", "args": {} }
        ] }
    }))
    .unwrap();

    session.handle_channel_event(ChannelEvent::Message(message));

    assert_eq!(*harness.tool_calls.borrow(), vec!["call-a", "call-b"]);
    let mut responses = tool_responses(&harness.sent.borrow());
    responses.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        responses,
        vec![
            ("call-a".to_string(), "display_document".to_string(), json!({ "result": "ok" })),
            ("call-b".to_string(), "broken".to_string(), json!({ "error": "renderer crashed" })),
        ]
    );
}

#[test]
fn test_message_with_audio_and_tool_call() {
    let (mut session, harness) = connected();
    let message: ServerMessage = serde_json::from_value(json!({
        "serverContent": { "modelTurn": { "parts": [
            { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": audio_chunk(240) } },
            { "text": "here you go" }
        ] } },
        "toolCall": { "functionCalls": [ { "id": "x", "name": "display_document" } ] }
    }))
    .unwrap();

    session.handle_channel_event(ChannelEvent::Message(message));

    assert_eq!(session.active_playback_units(), 1);
    assert_eq!(tool_responses(&harness.sent.borrow()).len(), 1);
}

#[test]
fn test_bad_chunk_does_not_abort_stream() {
    let (mut session, harness) = connected();
    session.handle_channel_event(ChannelEvent::Message(audio_message(&[
        audio_chunk(240),
        "%%% not audio".to_string(),
        audio_chunk(240),
    ])));

    assert_eq!(session.state(), SessionState::Connected);
    let scheduled = harness.scheduled.borrow();
    assert_eq!(scheduled.len(), 2);
    assert!((scheduled[1].1 - 0.01).abs() < 1e-12);
}

#[test]
fn test_watermark_resyncs_after_idle() {
    let (mut session, harness) = connected();
    session.handle_channel_event(ChannelEvent::Message(audio_message(&[audio_chunk(2400)])));
    assert!((session.watermark() - 0.1).abs() < 1e-12);

    harness.now.set(4.0);
    session.handle_channel_event(ChannelEvent::Message(audio_message(&[audio_chunk(2400)])));

    assert_eq!(harness.scheduled.borrow()[1].1, 4.0);
    assert!((session.watermark() - 4.1).abs() < 1e-12);
}

#[test]
fn test_recording_keeps_both_directions() {
    let (session, harness) = build(Faults::default());
    let mut session = session.with_recording();
    session.connect(harness.events.clone()).unwrap();
    session.handle_channel_event(ChannelEvent::Open);

    session.handle_frame(CapturedFrame {
        sequence: 0,
        samples: vec![0.25; 4096],
    });
    session.handle_channel_event(ChannelEvent::Message(audio_message(&[audio_chunk(480)])));

    let recording = session.take_recording().unwrap();
    assert_eq!(recording.captured.len(), 4096);
    assert_eq!(recording.received.len(), 480);
}
