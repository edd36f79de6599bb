//! Socket facade.
//!
//! Dials the encrypted channel on demand and wires the sender, multiplexer,
//! flow gate and telemetry together. At most one connection is live at a
//! time; once it is torn down the next `get` dials again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tether_wire::{MAX_CIPHERTEXT, TAG_SIZE};
use tracing::{debug, info, warn};

use crate::channel::{dial, Channel};
use crate::error::LinkError;
use crate::flow::{FlowControl, FlowSignal};
use crate::handshake::SecretFetcher;
use crate::keepalive::{send_delay_for, EchoUpdate, MIN_SEND_DELAY};
use crate::multiplexer::{MuxConfig, MuxObserver, Multiplexer, DEFAULT_ECHO_INTERVAL};
use crate::reader::ReaderFeed;
use crate::sender::{Sender, SenderConfig, DEFAULT_BURST_LIMIT, DEFAULT_CAPACITY, DEFAULT_DELAY};
use crate::transport::{ChannelHooks, TrafficHook};

/// Default dial timeout
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest plaintext one envelope can seal
pub const MAX_SEGMENT_SIZE: usize = MAX_CIPHERTEXT - TAG_SIZE;

/// Connection settings
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// WebSocket endpoint
    pub url: String,
    /// Time allowed for the WebSocket and the nonce exchange
    pub dial_timeout: Duration,
    /// Interval between echo probes
    pub echo_interval: Duration,
    /// Largest plaintext sealed into one envelope
    pub max_segment_size: usize,
    /// Initial sender flush delay
    pub send_delay: Duration,
    /// Pending sends that force a flush
    pub burst_limit: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            echo_interval: DEFAULT_ECHO_INTERVAL,
            max_segment_size: DEFAULT_CAPACITY,
            send_delay: DEFAULT_DELAY,
            burst_limit: DEFAULT_BURST_LIMIT,
        }
    }
}

impl SocketConfig {
    /// Check the settings before anything is dialed
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.max_segment_size == 0 || self.max_segment_size > MAX_SEGMENT_SIZE {
            return Err(LinkError::Config(format!(
                "max_segment_size must be between 1 and {}, got {}",
                MAX_SEGMENT_SIZE, self.max_segment_size
            )));
        }
        if self.burst_limit == 0 {
            return Err(LinkError::Config("burst_limit must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Connection lifecycle and telemetry events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Dialing started
    Connecting,
    /// Channel established and multiplexer serving
    Connected,
    /// Raw bytes moved over the WebSocket
    Traffic {
        /// Bytes received
        inbound: usize,
        /// Bytes sent
        outbound: usize,
    },
    /// Echo probe result
    Echo(EchoUpdate),
    /// Connection torn down; the error is set when it failed
    Closed(Option<LinkError>),
    /// Dialing failed
    Failed(LinkError),
}

/// Counters accumulated over the lifetime of a socket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Raw bytes received
    pub bytes_in: u64,
    /// Raw bytes sent
    pub bytes_out: u64,
    /// WebSocket messages received
    pub messages_in: u64,
    /// WebSocket messages sent
    pub messages_out: u64,
    /// Most recent echo round-trip time
    pub last_rtt: Option<Duration>,
    /// When the most recent echo result arrived
    pub last_echo: Option<SystemTime>,
    /// Echo probes lost or answered wrongly
    pub echo_failures: u64,
}

struct SocketInner {
    config: SocketConfig,
    fetcher: Arc<dyn SecretFetcher>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SocketEvent>>>,
    stats: Mutex<SocketStats>,
    active: Mutex<Option<(u64, Multiplexer)>>,
    generation: AtomicU64,
    dial_lock: tokio::sync::Mutex<()>,
}

impl SocketInner {
    fn emit(&self, event: SocketEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn current(&self) -> Option<Multiplexer> {
        let active = self.active.lock();
        active
            .as_ref()
            .filter(|(_, mux)| !mux.is_stopped())
            .map(|(_, mux)| mux.clone())
    }

    fn release(&self, generation: u64) {
        let mut active = self.active.lock();
        if matches!(active.as_ref(), Some((current, _)) if *current == generation) {
            *active = None;
        }
    }

    fn record_inbound(&self, n: usize) {
        {
            let mut stats = self.stats.lock();
            stats.bytes_in += n as u64;
            stats.messages_in += 1;
        }
        self.emit(SocketEvent::Traffic {
            inbound: n,
            outbound: 0,
        });
    }

    fn record_outbound(&self, n: usize) {
        {
            let mut stats = self.stats.lock();
            stats.bytes_out += n as u64;
            stats.messages_out += 1;
        }
        self.emit(SocketEvent::Traffic {
            inbound: 0,
            outbound: n,
        });
    }

    fn record_echo(&self, update: EchoUpdate) {
        {
            let mut stats = self.stats.lock();
            stats.last_echo = Some(SystemTime::now());
            match update {
                EchoUpdate::Delay(rtt) => stats.last_rtt = Some(rtt),
                EchoUpdate::Failed => stats.echo_failures += 1,
            }
        }
        self.emit(SocketEvent::Echo(update));
    }
}

/// Sends PAUSE/RESUME as the inbound backlog grows and shrinks
#[derive(Default)]
struct FlowGate {
    flow: Mutex<FlowControl>,
    mux: OnceLock<Multiplexer>,
}

impl FlowGate {
    fn attach(&self, mux: Multiplexer) {
        let _ = self.mux.set(mux);
    }

    fn received(&self, n: usize) {
        self.flow.lock().record_received(n);
        self.apply();
    }

    fn delivered(&self, n: usize) {
        self.flow.lock().record_delivered(n);
        self.apply();
    }

    fn apply(&self) {
        let Some(mux) = self.mux.get() else {
            return;
        };

        let signal = self.flow.lock().evaluate();
        match signal {
            Some(FlowSignal::Pause) => {
                let _ = mux.pause();
            }
            Some(FlowSignal::Resume) => {
                let _ = mux.resume();
            }
            None => {}
        }
    }
}

struct ConnectionObserver {
    inner: Weak<SocketInner>,
    generation: u64,
    sender: Sender,
    raw: ReaderFeed,
    pump: JoinHandle<()>,
}

impl MuxObserver for ConnectionObserver {
    fn echo(&self, update: EchoUpdate) {
        let delay = match update {
            EchoUpdate::Delay(rtt) => send_delay_for(rtt),
            EchoUpdate::Failed => MIN_SEND_DELAY,
        };
        self.sender.set_delay(delay);

        if let Some(inner) = self.inner.upgrade() {
            inner.record_echo(update);
        }
    }

    fn cleared(&self, error: Option<&LinkError>) {
        self.pump.abort();
        self.raw.close_with_reason(
            error
                .cloned()
                .unwrap_or_else(|| LinkError::closed("socket has been closed")),
        );

        if let Some(inner) = self.inner.upgrade() {
            inner.release(self.generation);
            inner.emit(SocketEvent::Closed(error.cloned()));
        }
    }
}

/// Lazily connected, encrypted, multiplexed socket
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("url", &self.inner.config.url)
            .field("connected", &self.inner.current().is_some())
            .finish()
    }
}

impl Socket {
    /// Create a socket; nothing is dialed until [`Socket::get`]
    pub fn new(config: SocketConfig, fetcher: Arc<dyn SecretFetcher>) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                config,
                fetcher,
                subscribers: Mutex::new(Vec::new()),
                stats: Mutex::new(SocketStats::default()),
                active: Mutex::new(None),
                generation: AtomicU64::new(0),
                dial_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Snapshot of the traffic and echo counters
    pub fn stats(&self) -> SocketStats {
        self.inner.stats.lock().clone()
    }

    /// Return the live multiplexer, dialing first if there is none.
    ///
    /// Concurrent callers share one dial.
    pub async fn get(&self) -> Result<Multiplexer, LinkError> {
        let _dialing = self.inner.dial_lock.lock().await;

        if let Some(mux) = self.inner.current() {
            return Ok(mux);
        }

        self.inner.emit(SocketEvent::Connecting);

        match self.connect().await {
            Ok(mux) => {
                self.inner.emit(SocketEvent::Connected);
                Ok(mux)
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", self.inner.config.url, e);
                self.inner.emit(SocketEvent::Failed(e.clone()));
                Err(e)
            }
        }
    }

    /// Tear down the live connection, if any
    pub async fn close(&self) {
        let current = self.inner.active.lock().take();

        if let Some((_, mux)) = current {
            info!("Closing connection to {}", self.inner.config.url);
            mux.shutdown().await;
        }
    }

    async fn connect(&self) -> Result<Multiplexer, LinkError> {
        let config = &self.inner.config;
        config.validate()?;
        let gate = Arc::new(FlowGate::default());

        let Channel {
            reader,
            writer,
            raw,
            pump,
        } = dial(
            &config.url,
            config.dial_timeout,
            self.inner.fetcher.as_ref(),
            self.hooks(&gate),
        )
        .await?;

        let failed_raw = raw.clone();
        let sender_config = SenderConfig {
            capacity: config.max_segment_size,
            delay: config.send_delay,
            burst_limit: config.burst_limit,
        };
        let (sender, _task) = Sender::spawn(writer, sender_config, move |e| {
            warn!("Outbound channel failed: {}", e);
            failed_raw.close_with_reason(e);
        });

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let observer = Arc::new(ConnectionObserver {
            inner: Arc::downgrade(&self.inner),
            generation,
            sender: sender.clone(),
            raw,
            pump,
        });

        let mux = Multiplexer::new(
            sender,
            MuxConfig {
                echo_interval: config.echo_interval,
            },
            observer,
        );
        gate.attach(mux.clone());
        *self.inner.active.lock() = Some((generation, mux.clone()));

        let serving = mux.clone();
        tokio::spawn(async move {
            if let Err(e) = serving.serve(reader).await {
                debug!("Connection ended: {}", e);
            }
        });

        Ok(mux)
    }

    fn hooks(&self, gate: &Arc<FlowGate>) -> ChannelHooks {
        let inbound: TrafficHook = {
            let inner = Arc::downgrade(&self.inner);
            let gate = gate.clone();
            Arc::new(move |n| {
                gate.received(n);
                if let Some(inner) = inner.upgrade() {
                    inner.record_inbound(n);
                }
            })
        };

        let unpacked: TrafficHook = {
            let gate = gate.clone();
            Arc::new(move |n| gate.delivered(n))
        };

        let outbound: TrafficHook = {
            let inner = Arc::downgrade(&self.inner);
            Arc::new(move |n| {
                if let Some(inner) = inner.upgrade() {
                    inner.record_outbound(n);
                }
            })
        };

        ChannelHooks {
            inbound: Some(inbound),
            unpacked: Some(unpacked),
            outbound: Some(outbound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::StaticSecret;
    use crate::reader::{read_completely, Limited, Reader};
    use crate::sender::tests::MemorySink;
    use crate::stream::{CommandHandler, InitialSender, StreamState};
    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use futures::{SinkExt, StreamExt};
    use std::collections::HashSet;
    use tether_wire::{
        derive_key, time_bucket, EnvelopeCipher, InitialStreamHeader, NonceCounter, StreamHeader,
        ENVELOPE_PREFIX_SIZE, NONCE_SIZE,
    };
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    const SECRET: &str = "hunter2";

    #[derive(Debug)]
    enum Inbound {
        Control(Vec<u8>),
        Initial { id: u8, command: u8, payload: Vec<u8> },
        Data { id: u8, marker: u8, data: Vec<u8> },
        Close(u8),
        Completed(u8),
    }

    /// Minimal server side of the protocol
    struct FakeServer {
        ws: WebSocketStream<TcpStream>,
        cipher: EnvelopeCipher,
        send: NonceCounter,
        recv: NonceCounter,
        plain: BytesMut,
        started: HashSet<u8>,
    }

    impl FakeServer {
        async fn accept(listener: &TcpListener) -> Self {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let theirs = match ws.next().await {
                Some(Ok(Message::Binary(data))) => data,
                other => panic!("expected client nonce, got {:?}", other),
            };
            let mut recv = [0u8; NONCE_SIZE];
            recv.copy_from_slice(&theirs);

            let ours = NonceCounter::new([3u8; NONCE_SIZE]);
            ws.send(Message::Binary(ours.as_bytes().to_vec())).await.unwrap();

            let key = derive_key(SECRET.as_bytes(), time_bucket(SystemTime::now())).unwrap();
            Self {
                ws,
                cipher: EnvelopeCipher::new(&key),
                send: ours,
                recv: NonceCounter::new(recv),
                plain: BytesMut::new(),
                started: HashSet::new(),
            }
        }

        async fn fill(&mut self, n: usize) {
            while self.plain.len() < n {
                match self.ws.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let plain = self
                            .cipher
                            .open(&mut self.recv, &data[ENVELOPE_PREFIX_SIZE..])
                            .unwrap();
                        self.plain.extend_from_slice(&plain);
                    }
                    other => panic!("unexpected message {:?}", other),
                }
            }
        }

        async fn next_frame(&mut self) -> Inbound {
            self.fill(1).await;
            let header = self.plain[0];
            let id = header & 0x3f;

            match header & 0xc0 {
                0x00 => {
                    self.fill(1 + id as usize).await;
                    let frame = self.plain.split_to(1 + id as usize);
                    Inbound::Control(frame[1..].to_vec())
                }
                0x40 => {
                    self.fill(3).await;
                    let sub = [self.plain[1], self.plain[2]];
                    if self.started.insert(id) {
                        let header = InitialStreamHeader::unpack(sub);
                        self.fill(3 + header.data as usize).await;
                        let frame = self.plain.split_to(3 + header.data as usize);
                        Inbound::Initial {
                            id,
                            command: header.command,
                            payload: frame[3..].to_vec(),
                        }
                    } else {
                        let header = StreamHeader::unpack(sub);
                        self.fill(3 + header.length as usize).await;
                        let frame = self.plain.split_to(3 + header.length as usize);
                        Inbound::Data {
                            id,
                            marker: header.marker,
                            data: frame[3..].to_vec(),
                        }
                    }
                }
                0x80 => {
                    let _ = self.plain.split_to(1);
                    Inbound::Close(id)
                }
                _ => {
                    let _ = self.plain.split_to(1);
                    Inbound::Completed(id)
                }
            }
        }

        async fn write(&mut self, frame: &[u8]) {
            let envelope = self.cipher.seal(&mut self.send, frame).unwrap();
            self.ws.send(Message::Binary(envelope.to_vec())).await.unwrap();
        }
    }

    struct CollectingHandler {
        seen: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl CommandHandler for CollectingHandler {
        async fn run(&self, initial: InitialSender) -> Result<(), LinkError> {
            initial.send(b"hi")?.wait().await
        }

        async fn initialize(&self, header: InitialStreamHeader) -> Result<(), LinkError> {
            let _ = self
                .seen
                .send(format!("init {} {}", header.command, header.success));
            Ok(())
        }

        async fn tick(&self, header: StreamHeader, reader: &mut Limited<'_>) -> Result<(), LinkError> {
            let data = read_completely(reader).await?;
            let _ = self.seen.send(format!(
                "tick {} {}",
                header.marker,
                String::from_utf8_lossy(&data)
            ));
            Ok(())
        }

        async fn close(&self) {
            let _ = self.seen.send("close".to_string());
        }

        async fn completed(&self) {
            let _ = self.seen.send("completed".to_string());
        }
    }

    async fn next_matching<T>(
        rx: &mut mpsc::UnboundedReceiver<T>,
        accept: impl Fn(&T) -> bool,
    ) -> T {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let item = rx.recv().await.expect("channel closed");
                if accept(&item) {
                    return item;
                }
            }
        })
        .await
        .expect("timed out waiting for item")
    }

    #[tokio::test]
    async fn test_socket_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let mut server = FakeServer::accept(&listener).await;
            loop {
                match server.next_frame().await {
                    Inbound::Control(body) if body.first() == Some(&0x00) => {
                        let mut reply = vec![body.len() as u8];
                        reply.extend_from_slice(&body);
                        server.write(&reply).await;
                    }
                    Inbound::Initial { id, command, payload } => {
                        assert_eq!(command, 3);
                        assert_eq!(payload, b"hi");
                        server.write(&[0x40 | id, 0x38, 0x00]).await;
                        server
                            .write(&[0x40 | id, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o'])
                            .await;
                    }
                    Inbound::Close(id) => {
                        server.write(&[0xc0 | id]).await;
                        return server;
                    }
                    other => panic!("unexpected frame {:?}", other),
                }
            }
        });

        let config = SocketConfig {
            url,
            echo_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let socket = Socket::new(config, Arc::new(StaticSecret::new(SECRET)));
        let mut events = socket.subscribe();

        let mux = socket.get().await.unwrap();
        assert!(socket.get().await.unwrap().ptr_eq(&mux));
        assert_eq!(events.recv().await, Some(SocketEvent::Connecting));
        next_matching(&mut events, |e| *e == SocketEvent::Connected).await;

        let (tx, mut seen) = mpsc::unbounded_channel();
        let slot = Arc::new(Mutex::new(None));
        let captured = slot.clone();
        let requested = mux
            .request(3, move |sender| {
                *captured.lock() = Some(sender);
                Arc::new(CollectingHandler { seen: tx }) as Arc<dyn CommandHandler>
            })
            .await
            .unwrap();

        assert_eq!(next_matching(&mut seen, |_| true).await, "init 3 true");
        assert_eq!(next_matching(&mut seen, |_| true).await, "tick 0 hello");

        let stream = slot.lock().take().unwrap();
        stream.close().await.unwrap();
        assert_eq!(next_matching(&mut seen, |_| true).await, "close");
        assert_eq!(next_matching(&mut seen, |_| true).await, "completed");
        assert_eq!(mux.stream_state(requested.stream_id), StreamState::Idle);

        next_matching(&mut events, |e| {
            matches!(e, SocketEvent::Echo(EchoUpdate::Delay(_)))
        })
        .await;
        let stats = socket.stats();
        assert!(stats.last_rtt.is_some());
        assert!(stats.last_echo.is_some());
        assert_eq!(stats.echo_failures, 0);
        assert!(stats.bytes_in > 0);
        assert!(stats.bytes_out > 0);

        socket.close().await;
        next_matching(&mut events, |e| *e == SocketEvent::Closed(None)).await;
        assert!(mux.is_stopped());

        let _server = server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_gate_pauses_and_resumes_on_the_wire() {
        let socket = Socket::new(SocketConfig::default(), Arc::new(StaticSecret::new(SECRET)));
        let sink = MemorySink::default();
        let config = SenderConfig {
            burst_limit: 1,
            ..Default::default()
        };
        let (sender, _task) = Sender::spawn(sink.clone(), config, |_| {});
        let mux = Multiplexer::new(sender, MuxConfig::default(), Arc::new(()));

        let gate = Arc::new(FlowGate::default());
        let hooks = socket.hooks(&gate);
        gate.attach(mux);

        hooks.inbound(10_000);
        hooks.inbound(7_000);
        hooks.inbound(4_000);
        hooks.unpacked(3_000);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.concat(), vec![0x01, 0x01]);

        hooks.unpacked(18_000);
        hooks.unpacked(100);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.concat(), vec![0x01, 0x01, 0x01, 0x02]);

        let stats = socket.stats();
        assert_eq!(stats.bytes_in, 21_000);
        assert_eq!(stats.messages_in, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_echo_resets_send_delay() {
        let sink = MemorySink::default();
        let config = SenderConfig {
            delay: Duration::from_millis(200),
            ..Default::default()
        };
        let (sender, _task) = Sender::spawn(sink.clone(), config, |_| {});
        let observer = ConnectionObserver {
            inner: Weak::new(),
            generation: 1,
            sender: sender.clone(),
            raw: Reader::new().0,
            pump: tokio::spawn(async {}),
        };

        observer.echo(EchoUpdate::Delay(Duration::from_millis(400)));
        observer.echo(EchoUpdate::Failed);

        let receipt = sender.queue(Bytes::from_static(b"x"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sink.written().is_empty());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(sink.written().len(), 1);
        receipt.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_segment_is_rejected_before_dial() {
        assert!(SocketConfig::default().validate().is_ok());

        let config = SocketConfig {
            url: "ws://127.0.0.1:1".to_string(),
            max_segment_size: MAX_SEGMENT_SIZE + 1,
            ..Default::default()
        };
        assert!(SocketConfig {
            max_segment_size: MAX_SEGMENT_SIZE,
            ..config.clone()
        }
        .validate()
        .is_ok());

        let socket = Socket::new(config, Arc::new(StaticSecret::new(SECRET)));
        let mut events = socket.subscribe();

        let err = socket.get().await.unwrap_err();
        assert!(matches!(err, LinkError::Config(_)));
        assert_eq!(events.recv().await, Some(SocketEvent::Connecting));
        assert_eq!(events.recv().await, Some(SocketEvent::Failed(err)));
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let config = SocketConfig {
            url,
            dial_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let socket = Socket::new(config, Arc::new(StaticSecret::new(SECRET)));
        let mut events = socket.subscribe();

        let err = socket.get().await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(events.recv().await, Some(SocketEvent::Connecting));
        assert_eq!(events.recv().await, Some(SocketEvent::Failed(err)));
    }
}
