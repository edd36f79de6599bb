//! Pull-based byte readers.
//!
//! Data is pushed in as whole buffers and pulled out in arbitrary amounts.
//! A [`ChunkQueue`] holds at most one buffer being consumed and asks its
//! [`Refill`] strategy for more when it runs dry, which is how the decrypting
//! reader pulls exactly one envelope at a time from the raw transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::LinkError;
use crate::rendezvous::Rendezvous;

/// Anything frames can be read from
#[async_trait]
pub trait ByteSource: Send {
    /// Return between 1 and `n` bytes, waiting until at least one is available
    async fn export(&mut self, n: usize) -> Result<Bytes, LinkError>;

    /// Wait until at least one byte is buffered without consuming it, and
    /// return how many are
    async fn fill(&mut self) -> Result<usize, LinkError>;

    /// Bytes that can be exported without waiting
    fn buffered(&self) -> usize;

    /// Offset of `byte` within the next `max_len` buffered bytes
    fn search(&self, byte: u8, max_len: usize) -> Option<usize>;

    /// Permanently fail all pending and future reads
    fn close_with_reason(&mut self, _reason: LinkError) {}
}

type DepletedFn = Box<dyn FnOnce() + Send>;

/// One immutable buffer plus a read cursor
pub struct Chunk {
    data: Bytes,
    on_depleted: Option<DepletedFn>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("remains", &self.data.len())
            .finish()
    }
}

impl Chunk {
    /// Wrap a buffer
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            on_depleted: None,
        }
    }

    /// Wrap a buffer and run `f` once it has been fully exported
    pub fn with_depleted(data: Bytes, f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            data,
            on_depleted: Some(Box::new(f)),
        }
    }

    /// Unread byte count
    pub fn remains(&self) -> usize {
        self.data.len()
    }

    /// Offset of `byte` within the next `max_len` unread bytes
    pub fn search(&self, byte: u8, max_len: usize) -> Option<usize> {
        let len = std::cmp::min(self.data.len(), max_len);
        self.data[..len].iter().position(|b| *b == byte)
    }

    /// Take up to `n` unread bytes
    pub fn export(&mut self, n: usize) -> Result<Bytes, LinkError> {
        if self.data.is_empty() {
            return Err(LinkError::Depleted);
        }

        let take = std::cmp::min(n, self.data.len());
        let out = self.data.split_to(take);

        if self.data.is_empty() {
            if let Some(f) = self.on_depleted.take() {
                f();
            }
        }

        Ok(out)
    }
}

/// Producer handle of a [`ChunkQueue`]
#[derive(Clone)]
pub struct ChunkFeed {
    incoming: Arc<Rendezvous<Chunk>>,
}

impl ChunkFeed {
    /// Queue a chunk; empty chunks are dropped
    pub fn feed(&self, chunk: Chunk) -> Result<(), LinkError> {
        if self.incoming.is_disabled() {
            return Err(LinkError::closed("reader is closed"));
        }
        if chunk.remains() > 0 {
            self.incoming.resolve(chunk);
        }
        Ok(())
    }

    /// Fail all pending and future reads with `reason`
    pub fn close_with_reason(&self, reason: LinkError) {
        if self.incoming.is_disabled() {
            return;
        }
        self.incoming.reject(reason.clone());
        self.incoming.disable(reason);
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.incoming.is_disabled()
    }
}

/// Called each time a [`ChunkQueue`] runs dry, before it waits for input
#[async_trait]
pub trait Refill: Send {
    /// Produce more input through `feed`, or close it
    async fn refill(&mut self, feed: &ChunkFeed);
}

#[async_trait]
impl Refill for () {
    async fn refill(&mut self, _feed: &ChunkFeed) {}
}

/// Queue of chunks consumed one at a time
pub struct ChunkQueue<R = ()> {
    current: Option<Chunk>,
    incoming: Arc<Rendezvous<Chunk>>,
    feed: ChunkFeed,
    refill: R,
}

impl ChunkQueue<()> {
    /// Create a queue fed only from the outside
    pub fn new() -> (ChunkFeed, Self) {
        let queue = Self::with_refill(());
        (queue.feeder(), queue)
    }
}

impl<R: Refill> ChunkQueue<R> {
    /// Create a queue that calls `refill` whenever it is starved
    pub fn with_refill(refill: R) -> Self {
        let incoming = Arc::new(Rendezvous::new());
        Self {
            current: None,
            feed: ChunkFeed {
                incoming: incoming.clone(),
            },
            incoming,
            refill,
        }
    }

    /// Producer handle for this queue
    pub fn feeder(&self) -> ChunkFeed {
        self.feed.clone()
    }

    /// Refill strategy
    pub fn refill_mut(&mut self) -> &mut R {
        &mut self.refill
    }
}

#[async_trait]
impl<R: Refill> ByteSource for ChunkQueue<R> {
    async fn export(&mut self, n: usize) -> Result<Bytes, LinkError> {
        self.fill().await?;

        let Some(chunk) = self.current.as_mut() else {
            return Err(LinkError::Depleted);
        };
        let out = chunk.export(n)?;
        if chunk.remains() == 0 {
            self.current = None;
        }
        Ok(out)
    }

    async fn fill(&mut self) -> Result<usize, LinkError> {
        loop {
            match self.current.as_ref().map(Chunk::remains) {
                Some(remains) if remains > 0 => return Ok(remains),
                Some(_) => self.current = None,
                None => {}
            }

            if self.incoming.pendings() == 0 && !self.feed.is_closed() {
                trace!("Chunk queue starved");
                self.refill.refill(&self.feed).await;
            }

            self.current = Some(self.incoming.subscribe().await?);
        }
    }

    fn buffered(&self) -> usize {
        self.current.as_ref().map(Chunk::remains).unwrap_or(0)
    }

    fn search(&self, byte: u8, max_len: usize) -> Option<usize> {
        self.current.as_ref()?.search(byte, max_len)
    }

    fn close_with_reason(&mut self, reason: LinkError) {
        self.current = None;
        self.feed.close_with_reason(reason);
    }
}

type TransformFn = Box<dyn FnMut(Bytes) -> Bytes + Send>;

/// Pulls raw buffers pushed through a [`ReaderFeed`]
pub struct Pull {
    source: Arc<Rendezvous<Bytes>>,
    transform: Option<TransformFn>,
}

#[async_trait]
impl Refill for Pull {
    async fn refill(&mut self, feed: &ChunkFeed) {
        loop {
            match self.source.subscribe().await {
                Ok(raw) => {
                    let data = match self.transform.as_mut() {
                        Some(transform) => transform(raw),
                        None => raw,
                    };
                    if data.is_empty() {
                        continue;
                    }
                    let _ = feed.feed(Chunk::new(data));
                    return;
                }
                Err(reason) => {
                    feed.close_with_reason(reason);
                    return;
                }
            }
        }
    }
}

/// Producer handle of a [`Reader`]
#[derive(Clone)]
pub struct ReaderFeed {
    source: Arc<Rendezvous<Bytes>>,
}

impl ReaderFeed {
    /// Push one buffer to the reader
    pub fn feed(&self, data: Bytes) -> Result<(), LinkError> {
        if self.source.is_disabled() {
            return Err(LinkError::closed("reader is closed, new data has been denied"));
        }
        self.source.resolve(data);
        Ok(())
    }

    /// Fail reads once every already pushed buffer has been consumed
    pub fn close_with_reason(&self, reason: LinkError) {
        if self.source.is_disabled() {
            return;
        }
        self.source.reject(reason.clone());
        self.source.disable(reason);
    }

    /// Whether the reader has been closed
    pub fn is_closed(&self) -> bool {
        self.source.is_disabled()
    }
}

/// Adapts pushed buffers into a [`ByteSource`]
pub struct Reader {
    queue: ChunkQueue<Pull>,
    feed: ReaderFeed,
}

impl Reader {
    /// Create a reader and its producer handle
    pub fn new() -> (ReaderFeed, Self) {
        Self::build(None)
    }

    /// Create a reader that passes each buffer through `transform` when it
    /// is pulled
    pub fn with_transform(transform: impl FnMut(Bytes) -> Bytes + Send + 'static) -> (ReaderFeed, Self) {
        Self::build(Some(Box::new(transform)))
    }

    fn build(transform: Option<TransformFn>) -> (ReaderFeed, Self) {
        let source = Arc::new(Rendezvous::new());
        let feed = ReaderFeed {
            source: source.clone(),
        };
        let queue = ChunkQueue::with_refill(Pull { source, transform });

        (feed.clone(), Self { queue, feed })
    }
}

#[async_trait]
impl ByteSource for Reader {
    async fn export(&mut self, n: usize) -> Result<Bytes, LinkError> {
        self.queue.export(n).await
    }

    async fn fill(&mut self) -> Result<usize, LinkError> {
        self.queue.fill().await
    }

    fn buffered(&self) -> usize {
        self.queue.buffered()
    }

    fn search(&self, byte: u8, max_len: usize) -> Option<usize> {
        self.queue.search(byte, max_len)
    }

    fn close_with_reason(&mut self, reason: LinkError) {
        self.feed.close_with_reason(reason.clone());
        self.queue.close_with_reason(reason);
    }
}

/// Reader restricted to a fixed number of bytes
pub struct Limited<'a> {
    source: &'a mut dyn ByteSource,
    remain: usize,
}

impl<'a> Limited<'a> {
    /// Allow at most `max` bytes to be read from `source`
    pub fn new(source: &'a mut dyn ByteSource, max: usize) -> Self {
        Self {
            source,
            remain: max,
        }
    }

    /// Bytes left in the budget
    pub fn remains(&self) -> usize {
        self.remain
    }

    /// Whether the budget is used up
    pub fn completed(&self) -> bool {
        self.remain == 0
    }
}

#[async_trait]
impl<'a> ByteSource for Limited<'a> {
    async fn export(&mut self, n: usize) -> Result<Bytes, LinkError> {
        if self.completed() {
            return Err(LinkError::ReaderCompleted);
        }

        let out = self.source.export(std::cmp::min(n, self.remain)).await?;
        self.remain -= out.len();
        Ok(out)
    }

    async fn fill(&mut self) -> Result<usize, LinkError> {
        if self.completed() {
            return Err(LinkError::ReaderCompleted);
        }

        let buffered = self.source.fill().await?;
        Ok(std::cmp::min(buffered, self.remain))
    }

    fn buffered(&self) -> usize {
        std::cmp::min(self.source.buffered(), self.remain)
    }

    fn search(&self, byte: u8, max_len: usize) -> Option<usize> {
        self.source.search(byte, std::cmp::min(max_len, self.remain))
    }
}

/// Read exactly one byte
pub async fn read_one<S: ByteSource + ?Sized>(source: &mut S) -> Result<u8, LinkError> {
    loop {
        let out = source.export(1).await?;
        if let Some(byte) = out.first() {
            return Ok(*byte);
        }
    }
}

/// Read exactly `n` bytes
pub async fn read_n<S: ByteSource + ?Sized>(source: &mut S, n: usize) -> Result<Bytes, LinkError> {
    if n == 0 {
        return Ok(Bytes::new());
    }

    let first = source.export(n).await?;
    if first.len() == n {
        return Ok(first);
    }

    let mut buf = BytesMut::with_capacity(n);
    buf.extend_from_slice(&first);
    while buf.len() < n {
        let out = source.export(n - buf.len()).await?;
        buf.extend_from_slice(&out);
    }

    Ok(buf.freeze())
}

/// Read whatever budget is left in `limited`
pub async fn read_completely(limited: &mut Limited<'_>) -> Result<Bytes, LinkError> {
    let remain = limited.remains();
    read_n(limited, remain).await
}

/// Result of [`read_until`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadUntil {
    /// Bytes consumed by the call
    pub data: Bytes,
    /// Whether `data` ends with the delimiter
    pub found: bool,
}

/// Read up to and including `byte` within the next buffered chunk, or the
/// whole chunk if it does not contain `byte`
pub async fn read_until<S: ByteSource + ?Sized>(
    source: &mut S,
    byte: u8,
) -> Result<ReadUntil, LinkError> {
    let buffered = source.fill().await?;

    match source.search(byte, buffered) {
        Some(pos) => Ok(ReadUntil {
            data: read_n(source, pos + 1).await?,
            found: true,
        }),
        None => Ok(ReadUntil {
            data: read_n(source, buffered).await?,
            found: false,
        }),
    }
}
