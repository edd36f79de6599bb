//! Nonce exchange and key setup for tether channels.
//!
//! Right after the WebSocket opens, each side sends the 12 byte nonce it will
//! encrypt with as a raw binary message. The channel key is derived from the
//! shared secret and the current 100 second time bucket.

use std::time::SystemTime;

use async_trait::async_trait;
use futures::{Sink, SinkExt};
use tether_wire::{derive_key, time_bucket, EnvelopeCipher, NonceCounter, NONCE_SIZE};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::LinkError;
use crate::reader::{read_n, ByteSource};

/// Source of the shared secret the channel key is derived from
#[async_trait]
pub trait SecretFetcher: Send + Sync {
    /// Fetch the current secret
    async fn fetch(&self) -> Result<String, LinkError>;
}

/// A secret known up front
#[derive(Clone)]
pub struct StaticSecret(String);

impl StaticSecret {
    /// Wrap a fixed secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }
}

impl std::fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticSecret(..)")
    }
}

#[async_trait]
impl SecretFetcher for StaticSecret {
    async fn fetch(&self) -> Result<String, LinkError> {
        Ok(self.0.clone())
    }
}

/// Key material agreed during the handshake
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Cipher shared by both directions
    pub cipher: EnvelopeCipher,
    /// Nonce for outbound envelopes
    pub send_nonce: NonceCounter,
    /// Nonce for inbound envelopes
    pub recv_nonce: NonceCounter,
}

/// Send our nonce as the first raw message
pub async fn send_nonce<W>(ws: &mut W, nonce: &NonceCounter) -> Result<(), LinkError>
where
    W: Sink<Message> + Unpin + Send,
    W::Error: std::fmt::Display,
{
    ws.send(Message::Binary(nonce.as_bytes().to_vec()))
        .await
        .map_err(|e| LinkError::WebSocket(e.to_string()))?;
    debug!("Sent channel nonce");
    Ok(())
}

/// Read the remote nonce from the first raw inbound bytes
pub async fn recv_nonce<S: ByteSource + ?Sized>(raw: &mut S) -> Result<NonceCounter, LinkError> {
    let bytes = read_n(raw, NONCE_SIZE).await?;
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&bytes);
    debug!("Received channel nonce");
    Ok(NonceCounter::new(nonce))
}

/// Derive the channel cipher for `now` from the fetched secret
pub async fn build_cipher(
    fetcher: &dyn SecretFetcher,
    now: SystemTime,
) -> Result<EnvelopeCipher, LinkError> {
    let secret = fetcher.fetch().await?;
    let key = derive_key(secret.as_bytes(), time_bucket(now))?;
    Ok(EnvelopeCipher::new(&key))
}

/// Exchange nonces over a fresh connection and set up the cipher
pub async fn negotiate<W, S>(
    ws: &mut W,
    raw: &mut S,
    fetcher: &dyn SecretFetcher,
) -> Result<Negotiated, LinkError>
where
    W: Sink<Message> + Unpin + Send,
    W::Error: std::fmt::Display,
    S: ByteSource + ?Sized,
{
    send_nonce_and_wait(ws, raw, fetcher, NonceCounter::generate()).await
}

async fn send_nonce_and_wait<W, S>(
    ws: &mut W,
    raw: &mut S,
    fetcher: &dyn SecretFetcher,
    ours: NonceCounter,
) -> Result<Negotiated, LinkError>
where
    W: Sink<Message> + Unpin + Send,
    W::Error: std::fmt::Display,
    S: ByteSource + ?Sized,
{
    send_nonce(ws, &ours).await?;
    let theirs = recv_nonce(raw).await?;
    let cipher = build_cipher(fetcher, SystemTime::now()).await?;

    Ok(Negotiated {
        cipher,
        send_nonce: ours,
        recv_nonce: theirs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Reader;
    use bytes::Bytes;
    use futures::StreamExt;

    struct FailingSecret;

    #[async_trait]
    impl SecretFetcher for FailingSecret {
        async fn fetch(&self) -> Result<String, LinkError> {
            Err(LinkError::Secret("expired".to_string()))
        }
    }

    #[tokio::test]
    async fn test_negotiate_exchanges_raw_nonces() {
        let (mut ws, mut sent) = futures::channel::mpsc::unbounded::<Message>();
        let (feed, mut raw) = Reader::new();
        feed.feed(Bytes::from(vec![5u8; 8])).unwrap();
        feed.feed(Bytes::from(vec![6u8; 4])).unwrap();

        let fixed = NonceCounter::new([9u8; NONCE_SIZE]);
        let negotiated = send_nonce_and_wait(&mut ws, &mut raw, &StaticSecret::new("pw"), fixed)
            .await
            .unwrap();

        assert_eq!(
            sent.next().await,
            Some(Message::Binary(vec![9u8; NONCE_SIZE]))
        );
        assert_eq!(negotiated.send_nonce, fixed);
        assert_eq!(
            negotiated.recv_nonce.as_bytes(),
            &[5, 5, 5, 5, 5, 5, 5, 5, 6, 6, 6, 6]
        );
    }

    #[tokio::test]
    async fn test_secret_failure_aborts() {
        let (mut ws, _sent) = futures::channel::mpsc::unbounded::<Message>();
        let (feed, mut raw) = Reader::new();
        feed.feed(Bytes::from(vec![0u8; NONCE_SIZE])).unwrap();

        let result = negotiate(&mut ws, &mut raw, &FailingSecret).await;
        assert!(matches!(result, Err(LinkError::Secret(_))));
    }
}
