//! Error types shared by the channel, sender, and multiplexer.

use std::time::Duration;

use tether_wire::WireError;
use thiserror::Error;

/// Errors raised while operating a tether connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Every stream slot is in use
    #[error("no stream is currently available")]
    NoFreeStream,

    /// The stream sender was closed before the call
    #[error("stream sender already closed")]
    StreamClosed,

    /// The connection or reader chain was closed
    #[error("connection closed: {0}")]
    Closed(String),

    /// Frame or envelope could not be encoded or decoded
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The remote referenced a stream slot that is not active
    #[error("remote sent {action} for stream {id} which is not running")]
    InactiveStream {
        /// Stream slot id
        id: u8,
        /// Frame kind that referenced the slot
        action: &'static str,
    },

    /// A frame arrived that the stream cannot accept in its current state
    #[error("stream {id} cannot accept {action} while {state}")]
    InvalidTransition {
        /// Stream slot id
        id: u8,
        /// Frame kind that was received
        action: &'static str,
        /// State the slot was in
        state: &'static str,
    },

    /// WebSocket transport failure
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Dial did not complete in time
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    /// The shared secret could not be fetched
    #[error("unable to fetch secret: {0}")]
    Secret(String),

    /// The outbound sender has shut down
    #[error("sender has been closed")]
    SenderClosed,

    /// A byte chunk was read past its end
    #[error("reader has been depleted")]
    Depleted,

    /// A limited reader was read past its budget
    #[error("reader already completed")]
    ReaderCompleted,

    /// `serve` was called twice on one multiplexer
    #[error("multiplexer is already serving")]
    AlreadyServing,

    /// A command handler failed
    #[error("command failed: {0}")]
    Command(String),

    /// Connection settings are unusable
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LinkError {
    /// Whether the caller may retry without tearing down the connection
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::NoFreeStream | LinkError::StreamClosed)
    }

    /// Shorthand for [`LinkError::Closed`]
    pub fn closed(reason: impl Into<String>) -> Self {
        LinkError::Closed(reason.into())
    }
}
