//! Duplex channel to the speech endpoint
//!
//! The session sees the channel as an opaque message stream: it sends
//! `ClientMessage`s and receives lifecycle and message events. The
//! WebSocket implementation runs its socket on a tokio task and talks to
//! the session loop only through channels.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{ClientMessage, ServerMessage, SetupConfig};
use crate::errors::SessionError;

/// Lifecycle and message events emitted by a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The endpoint accepted the session configuration
    Open,
    Message(ServerMessage),
    /// The endpoint closed the channel, with its reason if any
    Close(Option<String>),
    Error(String),
}

pub type ChannelEventSender = mpsc::UnboundedSender<ChannelEvent>;

/// An open duplex channel
pub trait DuplexChannel {
    /// Queue a message for transmission without waiting for it to be sent
    fn send(&mut self, message: &ClientMessage) -> Result<(), SessionError>;

    /// Close the channel. Idempotent.
    fn close(&mut self);
}

/// Opens duplex channels
pub trait Connector {
    /// Begin opening a channel configured with `setup`. Completion is
    /// reported asynchronously as `ChannelEvent::Open` or
    /// `ChannelEvent::Error` on `events`.
    fn open(
        &mut self,
        setup: &SetupConfig,
        events: ChannelEventSender,
    ) -> Result<Box<dyn DuplexChannel>, SessionError>;
}

/// Socket tasks that may still be finishing their close handshake after
/// the channel handle is gone
#[derive(Clone, Default)]
pub struct SocketTasks {
    tasks: Rc<RefCell<JoinSet<()>>>,
}

impl SocketTasks {
    /// Wait up to `limit` for every socket task to exit, aborting the rest.
    /// Returns the number of tasks that had to be aborted.
    pub async fn finish(&self, limit: Duration) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks.borrow_mut());
        let drained = tokio::time::timeout(limit, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_ok() {
            return 0;
        }
        let aborted = tasks.len();
        warn!("Aborting {} socket tasks still closing", aborted);
        tasks.shutdown().await;
        aborted
    }
}

/// Opens WebSocket channels to a live speech endpoint
pub struct WebSocketConnector {
    endpoint: String,
    api_key: Option<String>,
    outbound_capacity: usize,
    tasks: SocketTasks,
}

impl WebSocketConnector {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            outbound_capacity: outbound_capacity.max(1),
            tasks: SocketTasks::default(),
        }
    }

    /// Handle for waiting on sockets of channels opened by this connector
    pub fn tasks(&self) -> SocketTasks {
        self.tasks.clone()
    }

    /// Endpoint URL with the API key attached
    pub fn url(&self) -> Result<String, SessionError> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(SessionError::ChannelOpenFailure(format!(
                "endpoint must be a ws:// or wss:// URL, got {}",
                self.endpoint
            )));
        }

        Ok(match &self.api_key {
            Some(key) => {
                let separator = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{}key={}", self.endpoint, separator, key)
            }
            None => self.endpoint.clone(),
        })
    }
}

impl Connector for WebSocketConnector {
    fn open(
        &mut self,
        setup: &SetupConfig,
        events: ChannelEventSender,
    ) -> Result<Box<dyn DuplexChannel>, SessionError> {
        let url = self.url()?;
        let setup_text = serde_json::to_string(&ClientMessage::Setup(setup.clone()))
            .map_err(|e| SessionError::ChannelOpenFailure(format!("invalid setup: {}", e)))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::ChannelOpenFailure(format!("no async runtime: {}", e)))?;

        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(self.outbound_capacity);
        let connected = Arc::new(AtomicBool::new(false));

        info!("Opening duplex channel to {}", self.endpoint);
        let task = self.tasks.tasks.borrow_mut().spawn_on(
            run_socket(url, setup_text, outbound_rx, events, connected.clone()),
            &runtime,
        );

        Ok(Box::new(WebSocketChannel {
            outbound: Some(outbound_tx),
            task: Some(task),
            connected,
        }))
    }
}

/// Handle to a WebSocket channel task
pub struct WebSocketChannel {
    outbound: Option<mpsc::Sender<String>>,
    task: Option<AbortHandle>,
    connected: Arc<AtomicBool>,
}

impl DuplexChannel for WebSocketChannel {
    fn send(&mut self, message: &ClientMessage) -> Result<(), SessionError> {
        let Some(outbound) = &self.outbound else {
            return Err(SessionError::SendFailure("channel closed".into()));
        };

        let text = serde_json::to_string(message).map_err(|e| {
            SessionError::SendFailure(format!("serialize {}: {}", message.kind(), e))
        })?;

        outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                SessionError::SendFailure("channel closed".into())
            }
        })
    }

    fn close(&mut self) {
        // Dropping the sender lets a connected socket send its close frame
        let had_sender = self.outbound.take().is_some();

        if let Some(task) = self.task.take() {
            if !self.connected.load(Ordering::SeqCst) {
                task.abort();
            }
        }

        if had_sender {
            info!("Duplex channel closed");
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Turn one inbound text frame into a channel event
fn route_text(text: &str, opened: &mut bool) -> Option<ChannelEvent> {
    let message = match ServerMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                "Ignoring malformed server message ({}): {}",
                e,
                &text[..text.len().min(100)]
            );
            return None;
        }
    };

    if message.is_setup_complete() {
        if *opened {
            debug!("Duplicate setupComplete ignored");
            return None;
        }
        *opened = true;
        return Some(ChannelEvent::Open);
    }

    Some(ChannelEvent::Message(message))
}

async fn run_socket(
    url: String,
    setup_text: String,
    mut outbound: mpsc::Receiver<String>,
    events: ChannelEventSender,
    connected: Arc<AtomicBool>,
) {
    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            let _ = events.send(ChannelEvent::Error(format!("connect failed: {}", e)));
            return;
        }
    };
    connected.store(true, Ordering::SeqCst);
    debug!("WebSocket connected, sending setup");

    let (mut write, mut read) = stream.split();
    if let Err(e) = write.send(Message::Text(setup_text)).await {
        let _ = events.send(ChannelEvent::Error(format!("setup send failed: {}", e)));
        return;
    }

    let mut opened = false;
    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!("Dropping outbound message: {}", e);
                    }
                }
                None => {
                    debug!("Outbound side closed, sending close frame");
                    if write.send(Message::Close(None)).await.is_ok() {
                        // Wait for the endpoint to acknowledge
                        while let Some(Ok(frame)) = read.next().await {
                            if frame.is_close() {
                                break;
                            }
                        }
                    }
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = route_text(&text, &mut opened) {
                        let _ = events.send(event);
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if let Some(event) = route_text(&text, &mut opened) {
                            let _ = events.send(event);
                        }
                    }
                    Err(_) => warn!("Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    let _ = events.send(ChannelEvent::Close(reason));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(ChannelEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    let _ = events.send(ChannelEvent::Close(None));
                    break;
                }
            },
        }
    }
}
