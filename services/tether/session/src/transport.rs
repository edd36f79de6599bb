//! WebSocket transport for tether channels.
//!
//! The transport only moves opaque binary messages. Inbound messages are
//! pushed into a raw [`Reader`](crate::reader::Reader); outbound messages go
//! through a split sink owned by the channel writer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::error::LinkError;
use crate::reader::ReaderFeed;

/// Client WebSocket connection
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of a client WebSocket
pub type WsSink = SplitSink<WsStream, Message>;

/// Inbound half of a client WebSocket
pub type WsSource = SplitStream<WsStream>;

/// Byte counter callback
pub type TrafficHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Traffic callbacks invoked by the channel
#[derive(Clone, Default)]
pub struct ChannelHooks {
    /// Raw bytes received from the WebSocket
    pub inbound: Option<TrafficHook>,
    /// Raw bytes pulled by the decrypting reader
    pub unpacked: Option<TrafficHook>,
    /// Raw bytes written to the WebSocket
    pub outbound: Option<TrafficHook>,
}

impl std::fmt::Debug for ChannelHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHooks")
            .field("inbound", &self.inbound.is_some())
            .field("unpacked", &self.unpacked.is_some())
            .field("outbound", &self.outbound.is_some())
            .finish()
    }
}

impl ChannelHooks {
    pub(crate) fn inbound(&self, n: usize) {
        if let Some(hook) = &self.inbound {
            hook(n);
        }
    }

    pub(crate) fn unpacked(&self, n: usize) {
        if let Some(hook) = &self.unpacked {
            hook(n);
        }
    }

    pub(crate) fn outbound(&self, n: usize) {
        if let Some(hook) = &self.outbound {
            hook(n);
        }
    }
}

/// Open a WebSocket to `url`, giving up after `timeout`
pub async fn connect_ws(url: &str, timeout: Duration) -> Result<(WsSink, WsSource), LinkError> {
    info!("Connecting to {}", url);

    let (ws, response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| LinkError::Timeout(timeout))?
        .map_err(|e| LinkError::WebSocket(e.to_string()))?;

    debug!("WebSocket established to {} (status {})", url, response.status());
    Ok(ws.split())
}

/// Push inbound binary messages into `feed` until the socket closes
pub async fn pump_messages<S>(mut source: S, feed: ReaderFeed, hooks: ChannelHooks)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin + Send,
{
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                trace!("Received {} byte message", data.len());
                hooks.inbound(data.len());
                if feed.feed(Bytes::from(data)).is_err() {
                    debug!("Reader closed; stopping inbound pump");
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                let reason = match frame {
                    Some(frame) => format!("connection is closed ({})", u16::from(frame.code)),
                    None => "connection is closed".to_string(),
                };
                info!("Remote closed the WebSocket: {}", reason);
                feed.close_with_reason(LinkError::Closed(reason));
                return;
            }
            Ok(other) => {
                trace!("Ignoring non-binary message ({} bytes)", other.len());
            }
            Err(e) => {
                warn!("WebSocket error: {}", e);
                feed.close_with_reason(LinkError::WebSocket(e.to_string()));
                return;
            }
        }
    }

    feed.close_with_reason(LinkError::closed("connection is closed"));
}
