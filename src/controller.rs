//! Session controller
//!
//! Wires the PipeWire devices, the WebSocket connector and the terminal
//! tool handler into a `Session`, then runs the single event loop that
//! feeds it captured frames, channel events and playback completions.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::pcm::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::audio::{
    CaptureConfig, CapturedFrame, PipeWireInput, PipeWireOutput, PlaybackConfig, UnitId,
    WavRecorder,
};
use crate::session::channel::{ChannelEvent, WebSocketConnector};
use crate::session::{Collaborators, Session, SessionEvents, SessionState, Status};
use crate::settings::Settings;
use crate::tools::DisplayToolHandler;

const APP_NAME: &str = "voicelink";

/// How long to wait for sockets to finish their close handshake
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay before retrying messages the channel had no room for
const BACKLOG_RETRY: Duration = Duration::from_millis(5);

/// Receiving halves of the session's event sources
pub struct EventReceivers {
    pub frames: mpsc::UnboundedReceiver<CapturedFrame>,
    pub channel: mpsc::UnboundedReceiver<ChannelEvent>,
    pub ended: mpsc::UnboundedReceiver<UnitId>,
}

/// Run one session from the command line until it ends or Ctrl+C
pub fn run(settings: Settings) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    runtime.block_on(run_session(settings))
}

async fn run_session(settings: Settings) -> Result<()> {
    let api_key = settings.api_key();
    if api_key.is_none() {
        warn!(
            "{} is not set; connecting without an API key",
            settings.api_key_env
        );
    }

    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (channel_tx, channel_rx) = mpsc::unbounded_channel();
    let (ended_tx, ended_rx) = mpsc::unbounded_channel();

    let output = PipeWireOutput::open(PlaybackConfig::default(), APP_NAME, ended_tx)
        .context("Failed to open speaker output")?;

    let connector =
        WebSocketConnector::new(settings.endpoint.clone(), api_key, settings.outbound_queue);
    let sockets = connector.tasks();

    let parts = Collaborators {
        input: Box::new(PipeWireInput::new(APP_NAME)),
        output: Box::new(output),
        connector: Box::new(connector),
        tools: Box::new(DisplayToolHandler::new(io::stdout(), &settings.tools)),
        status: Box::new(|status: Status| eprintln!("[{}]", status)),
    };

    let capture_config = CaptureConfig {
        block_size: settings.block_size,
        ..Default::default()
    };
    let mut session = Session::new(settings.setup_config(), capture_config, parts);
    if settings.record_dir.is_some() {
        session = session.with_recording();
    }

    session
        .connect(SessionEvents {
            frames: frames_tx,
            channel: channel_tx,
        })
        .context("Failed to start session")?;

    let receivers = EventReceivers {
        frames: frames_rx,
        channel: channel_rx,
        ended: ended_rx,
    };
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    drive(&mut session, receivers, shutdown).await;
    sockets.finish(CLOSE_TIMEOUT).await;

    if let Some(dir) = &settings.record_dir {
        if let Some(recording) = session.take_recording() {
            if !recording.is_empty() {
                let recorder = WavRecorder::new(dir);
                info!("Saving session audio to {}", recorder.recordings_dir().display());
                let saved = recorder
                    .save_session(&recording)
                    .map_err(anyhow::Error::msg)
                    .context("Failed to save session recording")?;
                if let Some(path) = &saved.captured {
                    let secs =
                        WavRecorder::duration_seconds(recording.captured.len(), INPUT_SAMPLE_RATE);
                    eprintln!("Saved {} ({:.1}s)", path.display(), secs);
                }
                if let Some(path) = &saved.received {
                    let secs =
                        WavRecorder::duration_seconds(recording.received.len(), OUTPUT_SAMPLE_RATE);
                    eprintln!("Saved {} ({:.1}s)", path.display(), secs);
                }
            }
        }
    }

    match session.state() {
        SessionState::Errored => bail!("Session ended with an error"),
        state => {
            info!("Session finished in state {}", state);
            Ok(())
        }
    }
}

/// Feed events into `session` until it reaches a terminal state.
///
/// `shutdown` resolving counts as a user disconnect.
pub async fn drive<F>(session: &mut Session, mut receivers: EventReceivers, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut shutdown_done = false;

    while !session.state().is_terminal() {
        tokio::select! {
            Some(event) = receivers.channel.recv() => session.handle_channel_event(event),
            Some(frame) = receivers.frames.recv() => session.handle_frame(frame),
            Some(id) = receivers.ended.recv() => session.handle_playback_ended(id),
            _ = tokio::time::sleep(BACKLOG_RETRY), if session.has_backlog() => {
                session.flush_pending();
            }
            _ = &mut shutdown, if !shutdown_done => {
                shutdown_done = true;
                info!("Disconnect requested");
                session.disconnect();
            }
            else => {
                debug!("All event sources closed");
                session.disconnect();
                break;
            }
        }
    }
}
