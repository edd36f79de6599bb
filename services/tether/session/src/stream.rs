//! Stream slots and the interface offered to command handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tether_wire::{
    build_initial, build_stream, split_stream_payload, InitialStreamHeader, StreamHeader,
    INITIAL_MAX_DATA,
};

use crate::error::LinkError;
use crate::multiplexer::Shared;
use crate::reader::Limited;
use crate::sender::{SendReceipt, Sender};

/// Lifecycle of one stream slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Free for `request`
    Idle,
    /// Request sent, waiting for the remote's initial reply
    Initializing,
    /// Exchanging data
    Running,
    /// CLOSE sent or received, waiting for COMPLETED
    ShuttingDown,
}

impl StreamState {
    /// Lowercase name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Initializing => "initializing",
            StreamState::Running => "running",
            StreamState::ShuttingDown => "shutting down",
        }
    }
}

/// Command running on top of one stream.
///
/// `tick` must consume the whole limited reader; whatever it leaves unread is
/// discarded.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Start the command by sending its initial request
    async fn run(&self, initial: InitialSender) -> Result<(), LinkError>;

    /// Handle the remote's reply to the initial request
    async fn initialize(&self, header: InitialStreamHeader) -> Result<(), LinkError>;

    /// Handle one STREAM frame
    async fn tick(&self, header: StreamHeader, reader: &mut Limited<'_>) -> Result<(), LinkError>;

    /// The stream is shutting down
    async fn close(&self);

    /// The stream is gone and its slot released
    async fn completed(&self);
}

pub(crate) struct ActiveStream {
    pub handler: Arc<dyn CommandHandler>,
    pub sender_closed: Arc<AtomicBool>,
    pub initializing: bool,
    pub shutting_down: bool,
    pub remote_closed: bool,
    pub close_invoked: bool,
}

impl ActiveStream {
    pub fn new(handler: Arc<dyn CommandHandler>, sender_closed: Arc<AtomicBool>) -> Self {
        Self {
            handler,
            sender_closed,
            initializing: true,
            shutting_down: false,
            remote_closed: false,
            close_invoked: false,
        }
    }

    pub fn state(&self) -> StreamState {
        if self.shutting_down {
            StreamState::ShuttingDown
        } else if self.initializing {
            StreamState::Initializing
        } else {
            StreamState::Running
        }
    }

    pub fn owns(&self, sender_closed: &Arc<AtomicBool>) -> bool {
        Arc::ptr_eq(&self.sender_closed, sender_closed)
    }
}

/// Sends the initial request of a stream
#[derive(Debug)]
pub struct InitialSender {
    id: u8,
    command: u8,
    sender: Sender,
}

impl InitialSender {
    pub(crate) fn new(id: u8, command: u8, sender: Sender) -> Self {
        Self { id, command, sender }
    }

    /// Stream slot id
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Command id carried by the request
    pub fn command(&self) -> u8 {
        self.command
    }

    /// Largest payload the initial request can carry
    pub const fn max_data_len() -> usize {
        INITIAL_MAX_DATA as usize
    }

    /// Queue the initial request with `payload`
    pub fn send(&self, payload: &[u8]) -> Result<SendReceipt, LinkError> {
        let frame = build_initial(self.id, self.command, payload)?;
        Ok(self.sender.queue(frame))
    }
}

/// Outbound half of a stream handed to its command
#[derive(Clone)]
pub struct StreamSender {
    id: u8,
    sender: Sender,
    closed: Arc<AtomicBool>,
    mux: Weak<Shared>,
}

impl std::fmt::Debug for StreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSender")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamSender {
    pub(crate) fn new(id: u8, sender: Sender, closed: Arc<AtomicBool>, mux: Weak<Shared>) -> Self {
        Self {
            id,
            sender,
            closed,
            mux,
        }
    }

    /// Stream slot id
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Whether no more data may be sent
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue one STREAM frame; `data` must fit a single frame
    pub fn send(&self, marker: u8, data: &[u8]) -> Result<SendReceipt, LinkError> {
        if self.is_closed() {
            return Err(LinkError::StreamClosed);
        }

        let frame = build_stream(self.id, marker, data)?;
        Ok(self.sender.queue(frame))
    }

    /// Send `data` of any length as consecutive STREAM frames
    pub async fn send_data(&self, marker: u8, data: Bytes) -> Result<(), LinkError> {
        for piece in split_stream_payload(data) {
            self.send(marker, &piece)?.wait().await?;
        }
        Ok(())
    }

    /// Send CLOSE for this stream; later calls do nothing
    pub async fn close(&self) -> Result<(), LinkError> {
        let Some(mux) = self.mux.upgrade() else {
            self.closed.store(true, Ordering::SeqCst);
            return Ok(());
        };

        match mux.close_local(self.id, &self.closed)? {
            Some(receipt) => receipt.wait().await,
            None => Ok(()),
        }
    }
}

/// Stream claimed by a successful `request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requested {
    /// Slot the command runs on
    pub stream_id: u8,
}
