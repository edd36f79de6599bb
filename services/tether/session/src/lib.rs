//! Encrypted WebSocket channel, coalescing sender, and stream multiplexer for tether.
//!
//! This crate runs the client side of the tether transport: one WebSocket
//! carrying AES-GCM sealed envelopes, inside which up to 64 ordered byte
//! streams are multiplexed for remote shell commands.
//!
//! ## Features
//!
//! - **Rendezvous and readers**: pull-based byte sources with chunk queues and
//!   frame-bounded sub-readers
//! - **Encrypted channel**: nonce exchange, time-bucketed key derivation, and
//!   length-prefixed envelopes
//! - **Sender**: outbound coalescing with delay and burst flush triggers
//! - **Multiplexer**: stream slot lifecycle, frame dispatch, echo RTT probes
//! - **Socket**: lazy dial, advisory flow control, traffic and echo telemetry
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_session::{Socket, SocketConfig, SocketEvent, StaticSecret};
//!
//! # async fn example() -> Result<(), tether_session::LinkError> {
//! let config = SocketConfig {
//!     url: "ws://127.0.0.1:8182/sshwifty/socket".to_string(),
//!     ..Default::default()
//! };
//!
//! let socket = Socket::new(config, Arc::new(StaticSecret::new("secret")));
//! let mut events = socket.subscribe();
//! let mux = socket.get().await?;
//! println!("{} streams active", mux.active_streams());
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SocketEvent::Echo(update) => println!("Echo: {:?}", update),
//!         SocketEvent::Closed(reason) => {
//!             println!("Closed: {:?}", reason);
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod flow;
pub mod handshake;
pub mod keepalive;
pub mod multiplexer;
pub mod reader;
pub mod rendezvous;
pub mod sender;
pub mod socket;
pub mod stream;
pub mod transport;

// Re-export main types
pub use channel::{dial, Channel, CipherReader, CipherWriter};
pub use error::LinkError;
pub use flow::{FlowControl, FlowSignal};
pub use handshake::{negotiate, Negotiated, SecretFetcher, StaticSecret};
pub use keepalive::{send_delay_for, EchoTracker, EchoUpdate};
pub use multiplexer::{MuxConfig, MuxObserver, Multiplexer};
pub use reader::{
    read_completely, read_n, read_one, read_until, ByteSource, Chunk, ChunkFeed, ChunkQueue,
    Limited, ReadUntil, Reader, ReaderFeed, Refill,
};
pub use rendezvous::Rendezvous;
pub use sender::{FrameSink, SendReceipt, Sender, SenderConfig};
pub use socket::{Socket, SocketConfig, SocketEvent, SocketStats, MAX_SEGMENT_SIZE};
pub use stream::{CommandHandler, InitialSender, Requested, StreamSender, StreamState};
pub use transport::{connect_ws, ChannelHooks};
