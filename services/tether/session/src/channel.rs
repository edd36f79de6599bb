//! Encrypted channel over one WebSocket.
//!
//! Outbound buffers are sealed into length-prefixed AES-GCM envelopes, one
//! per WebSocket message. Inbound envelopes are pulled from the raw reader one
//! at a time, only when the plaintext reader above runs dry. Any decode or
//! authentication failure closes both readers for good since the receive
//! nonce can no longer be trusted.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt};
use tether_wire::{envelope_len, EnvelopeCipher, NonceCounter, ENVELOPE_PREFIX_SIZE};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::error::LinkError;
use crate::handshake::{negotiate, SecretFetcher};
use crate::reader::{read_n, ByteSource, Chunk, ChunkFeed, ChunkQueue, Reader, ReaderFeed, Refill};
use crate::sender::FrameSink;
use crate::transport::{connect_ws, pump_messages, ChannelHooks, WsSink};

/// Pulls and opens one envelope per refill
pub struct Decrypt {
    raw: Reader,
    cipher: EnvelopeCipher,
    nonce: NonceCounter,
}

impl Decrypt {
    async fn next_envelope(&mut self) -> Result<Bytes, LinkError> {
        let prefix = read_n(&mut self.raw, ENVELOPE_PREFIX_SIZE).await?;
        let len = envelope_len([prefix[0], prefix[1]])?;
        let body = read_n(&mut self.raw, len).await?;
        Ok(self.cipher.open(&mut self.nonce, &body)?)
    }
}

#[async_trait]
impl Refill for Decrypt {
    async fn refill(&mut self, feed: &ChunkFeed) {
        loop {
            match self.next_envelope().await {
                Ok(plain) if plain.is_empty() => continue,
                Ok(plain) => {
                    trace!("Opened {} byte envelope", plain.len());
                    let _ = feed.feed(Chunk::new(plain));
                    return;
                }
                Err(e) => {
                    if !matches!(e, LinkError::Closed(_)) {
                        warn!("Inbound envelope rejected: {}", e);
                    }
                    self.raw.close_with_reason(e.clone());
                    feed.close_with_reason(e);
                    return;
                }
            }
        }
    }
}

/// Plaintext reader of an encrypted channel
pub struct CipherReader {
    queue: ChunkQueue<Decrypt>,
}

impl CipherReader {
    /// Decrypt envelopes read from `raw`
    pub fn new(raw: Reader, cipher: EnvelopeCipher, nonce: NonceCounter) -> Self {
        Self {
            queue: ChunkQueue::with_refill(Decrypt { raw, cipher, nonce }),
        }
    }

    /// Nonce the next inbound envelope must be opened with
    pub fn nonce(&mut self) -> NonceCounter {
        self.queue.refill_mut().nonce
    }
}

#[async_trait]
impl ByteSource for CipherReader {
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
        self.queue.refill_mut().raw.close_with_reason(reason.clone());
        self.queue.close_with_reason(reason);
    }
}

/// Sealing writer of an encrypted channel
pub struct CipherWriter<W> {
    ws: W,
    cipher: EnvelopeCipher,
    nonce: NonceCounter,
    hooks: ChannelHooks,
}

impl<W> CipherWriter<W> {
    /// Seal outbound buffers with `cipher` starting at `nonce`
    pub fn new(ws: W, cipher: EnvelopeCipher, nonce: NonceCounter, hooks: ChannelHooks) -> Self {
        Self {
            ws,
            cipher,
            nonce,
            hooks,
        }
    }
}

#[async_trait]
impl<W> FrameSink for CipherWriter<W>
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: std::fmt::Display,
{
    async fn write(&mut self, data: Bytes) -> Result<(), LinkError> {
        let envelope = self.cipher.seal(&mut self.nonce, &data)?;
        let len = envelope.len();

        self.ws
            .send(Message::Binary(envelope.to_vec()))
            .await
            .map_err(|e| LinkError::WebSocket(e.to_string()))?;
        self.hooks.outbound(len);
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close().await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}

/// An established encrypted channel
pub struct Channel {
    /// Plaintext inbound bytes
    pub reader: CipherReader,
    /// Outbound envelope writer
    pub writer: CipherWriter<WsSink>,
    /// Producer side of the raw reader, used to tear it down
    pub raw: ReaderFeed,
    /// Task pushing inbound messages into the raw reader
    pub pump: JoinHandle<()>,
}

/// Dial `url` and complete the nonce exchange within `timeout`
pub async fn dial(
    url: &str,
    timeout: Duration,
    fetcher: &dyn SecretFetcher,
    hooks: ChannelHooks,
) -> Result<Channel, LinkError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let (mut sink, source) = connect_ws(url, timeout).await?;

    let unpacked = hooks.clone();
    let (raw_feed, mut raw) = Reader::with_transform(move |data: Bytes| {
        unpacked.unpacked(data.len());
        data
    });
    let pump = tokio::spawn(pump_messages(source, raw_feed.clone(), hooks.clone()));

    let negotiated = match tokio::time::timeout_at(deadline, negotiate(&mut sink, &mut raw, fetcher)).await {
        Ok(Ok(negotiated)) => negotiated,
        Ok(Err(e)) => {
            pump.abort();
            return Err(e);
        }
        Err(_) => {
            pump.abort();
            let _ = sink.close().await;
            return Err(LinkError::Timeout(timeout));
        }
    };

    info!("Encrypted channel established to {}", url);

    Ok(Channel {
        reader: CipherReader::new(raw, negotiated.cipher.clone(), negotiated.recv_nonce),
        writer: CipherWriter::new(sink, negotiated.cipher, negotiated.send_nonce, hooks),
        raw: raw_feed,
        pump,
    })
}
