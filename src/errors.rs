//! Error types for the voice session core.

use thiserror::Error;

/// Errors raised at the session's device and channel boundaries.
///
/// Only `DeviceUnavailable`, `ChannelOpenFailure` and `ChannelError` are
/// fatal to a session. Decode and send failures are recovered locally by
/// dropping the affected chunk or message. `QueueFull` is backpressure:
/// the message may be retried once the channel drains.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to open duplex channel: {0}")]
    ChannelOpenFailure(String),

    #[error("Duplex channel error: {0}")]
    ChannelError(String),

    #[error("Failed to decode inbound audio: {0}")]
    DecodeFailure(String),

    #[error("Failed to send outbound message: {0}")]
    SendFailure(String),

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Audio output device error: {0}")]
    OutputDevice(String),

    #[error("Session cannot connect from state {0}")]
    InvalidState(String),
}
