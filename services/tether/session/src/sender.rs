//! Coalescing outbound sender.
//!
//! Small writes are gathered into one buffer and flushed as a single message
//! when the buffer fills, when too many writes are waiting, or when the flush
//! delay elapses. Every write settles together with the flush that carries its
//! last byte.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::LinkError;

/// Default flush buffer size: the server's 4096 byte receive buffer minus headroom
pub const DEFAULT_CAPACITY: usize = 4096 - 64;

/// Default flush delay
pub const DEFAULT_DELAY: Duration = Duration::from_millis(30);

/// Default number of pending writes that forces a flush
pub const DEFAULT_BURST_LIMIT: usize = 10;

/// Destination of flushed buffers
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Deliver one flushed buffer
    async fn write(&mut self, data: Bytes) -> Result<(), LinkError>;

    /// Release the destination
    async fn close(&mut self) {}
}

/// Sender tuning
#[derive(Clone, Debug)]
pub struct SenderConfig {
    /// Flush buffer size in bytes
    pub capacity: usize,
    /// Time a non-empty buffer may wait before it is flushed
    pub delay: Duration,
    /// Pending writes that force an immediate flush
    pub burst_limit: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            delay: DEFAULT_DELAY,
            burst_limit: DEFAULT_BURST_LIMIT,
        }
    }
}

type Done = oneshot::Sender<Result<(), LinkError>>;

enum Command {
    Send { data: Bytes, done: Done },
    SetDelay(Duration),
    Close,
}

/// Completion of one queued write
#[derive(Debug)]
#[must_use = "a receipt does nothing unless waited on"]
pub struct SendReceipt {
    rx: oneshot::Receiver<Result<(), LinkError>>,
}

impl SendReceipt {
    /// Wait until the flush carrying this write has been delivered
    pub async fn wait(self) -> Result<(), LinkError> {
        self.rx.await.map_err(|_| LinkError::SenderClosed)?
    }
}

/// Handle to the sender task
#[derive(Clone, Debug)]
pub struct Sender {
    tx: mpsc::UnboundedSender<Command>,
}

impl Sender {
    /// Start a sender task writing into `sink`.
    ///
    /// `on_failure` runs once if a write fails; every pending and later write
    /// is rejected after that.
    pub fn spawn<S, F>(sink: S, config: SenderConfig, on_failure: F) -> (Self, JoinHandle<()>)
    where
        S: FrameSink,
        F: FnOnce(LinkError) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = SenderTask {
            sink,
            capacity: config.capacity.max(1),
            delay: config.delay,
            burst_limit: config.burst_limit.max(1),
            buffer: BytesMut::with_capacity(config.capacity),
            waiters: Vec::new(),
            deadline: None,
        };

        let handle = tokio::spawn(task.run(rx, on_failure));
        (Self { tx }, handle)
    }

    /// Queue `data` for the next flush
    pub fn queue(&self, data: Bytes) -> SendReceipt {
        let (done, rx) = oneshot::channel();
        // A closed task drops `done`, which fails the receipt.
        let _ = self.tx.send(Command::Send { data, done });
        SendReceipt { rx }
    }

    /// Queue `data` and wait for its flush
    pub async fn send(&self, data: Bytes) -> Result<(), LinkError> {
        self.queue(data).wait().await
    }

    /// Change the flush delay
    pub fn set_delay(&self, delay: Duration) {
        let _ = self.tx.send(Command::SetDelay(delay));
    }

    /// Flush what is buffered and stop the task
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    /// Whether the task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct SenderTask<S> {
    sink: S,
    capacity: usize,
    delay: Duration,
    burst_limit: usize,
    buffer: BytesMut,
    waiters: Vec<Done>,
    deadline: Option<Instant>,
}

impl<S: FrameSink> SenderTask<S> {
    async fn run<F>(mut self, mut rx: mpsc::UnboundedReceiver<Command>, on_failure: F)
    where
        F: FnOnce(LinkError) + Send + 'static,
    {
        let failure = loop {
            let deadline = self.deadline;

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Send { data, done }) => {
                        if let Err(e) = self.append(data, done).await {
                            break Some(e);
                        }
                    }
                    Some(Command::SetDelay(delay)) => {
                        trace!("Sender delay set to {:?}", delay);
                        self.delay = delay;
                    }
                    Some(Command::Close) | None => {
                        break self.flush().await.err();
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Err(e) = self.flush().await {
                        break Some(e);
                    }
                }
            }
        };

        rx.close();
        let rejection = failure.clone().unwrap_or(LinkError::SenderClosed);
        while let Ok(command) = rx.try_recv() {
            if let Command::Send { done, .. } = command {
                let _ = done.send(Err(rejection.clone()));
            }
        }

        match failure {
            Some(e) => {
                warn!("Sender stopped after write failure: {}", e);
                on_failure(e);
            }
            None => debug!("Sender closed"),
        }

        self.sink.close().await;
    }

    async fn append(&mut self, mut data: Bytes, done: Done) -> Result<(), LinkError> {
        if data.is_empty() {
            let _ = done.send(Ok(()));
            return Ok(());
        }

        let mut done = Some(done);
        while !data.is_empty() {
            let room = self.capacity - self.buffer.len();
            let piece = data.split_to(std::cmp::min(room, data.len()));
            self.buffer.extend_from_slice(&piece);

            if data.is_empty() {
                if let Some(done) = done.take() {
                    self.waiters.push(done);
                }
            }

            if self.buffer.len() >= self.capacity {
                self.flush().await?;
            }
        }

        if self.waiters.len() >= self.burst_limit {
            self.flush().await?;
        } else if !self.buffer.is_empty() && self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.delay);
        }

        Ok(())
    }

    async fn flush(&mut self) -> Result<(), LinkError> {
        self.deadline = None;
        let waiters = std::mem::take(&mut self.waiters);

        if self.buffer.is_empty() {
            for done in waiters {
                let _ = done.send(Ok(()));
            }
            return Ok(());
        }

        let data = self.buffer.split().freeze();
        trace!("Flushing {} bytes for {} writes", data.len(), waiters.len());

        match self.sink.write(data).await {
            Ok(()) => {
                for done in waiters {
                    let _ = done.send(Ok(()));
                }
                Ok(())
            }
            Err(e) => {
                for done in waiters {
                    let _ = done.send(Err(e.clone()));
                }
                Err(e)
            }
        }
    }
}
