//! Stream multiplexer.
//!
//! Owns the 64 stream slots of one connection, dispatches inbound frames to
//! the command handler of each slot, and runs the echo probe loop while
//! serving. Slot bookkeeping lives behind a synchronous lock that is never
//! held across an await; handler callbacks always run with the lock released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_wire::{
    build_close, build_completed, build_echo, build_pause, build_resume, ControlType, FrameType,
    Header, InitialStreamHeader, StreamHeader, WireError, ECHO_PAYLOAD_SIZE, INITIAL_MAX_COMMAND,
    MAX_STREAMS, STREAM_HEADER_SIZE,
};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::LinkError;
use crate::keepalive::{build_probe, EchoTracker, EchoUpdate};
use crate::reader::{read_completely, read_n, read_one, ByteSource, Limited};
use crate::sender::{SendReceipt, Sender};
use crate::stream::{
    ActiveStream, CommandHandler, InitialSender, Requested, StreamSender, StreamState,
};

/// Default interval between echo probes
pub const DEFAULT_ECHO_INTERVAL: Duration = Duration::from_secs(10);

/// Multiplexer settings
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Interval between echo probes while serving
    pub echo_interval: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            echo_interval: DEFAULT_ECHO_INTERVAL,
        }
    }
}

/// Receives multiplexer level notifications
pub trait MuxObserver: Send + Sync {
    /// An echo probe completed or failed
    fn echo(&self, _update: EchoUpdate) {}

    /// Every stream was torn down; `error` is set when serving failed
    fn cleared(&self, _error: Option<&LinkError>) {}
}

impl MuxObserver for () {}

struct MuxState {
    slots: Vec<Option<ActiveStream>>,
    echo: EchoTracker,
    serving: bool,
    stopped: bool,
}

pub(crate) struct Shared {
    state: Mutex<MuxState>,
    sender: Sender,
    config: MuxConfig,
    observer: Arc<dyn MuxObserver>,
    shutdown: Notify,
}

impl Shared {
    /// Mark the stream closed locally and queue its CLOSE frame once
    pub(crate) fn close_local(
        &self,
        id: u8,
        closed: &Arc<AtomicBool>,
    ) -> Result<Option<SendReceipt>, LinkError> {
        let mut state = self.state.lock();

        if closed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        let Some(active) = state.slots.get_mut(id as usize).and_then(Option::as_mut) else {
            return Ok(None);
        };
        if !active.owns(closed) {
            return Ok(None);
        }

        active.shutting_down = true;
        debug!("Closing stream {}", id);
        Ok(Some(self.sender.queue(build_close(id)?)))
    }
}

/// Multiplexes command streams over one sender and one inbound reader
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

impl Multiplexer {
    /// Create a multiplexer writing through `sender`
    pub fn new(sender: Sender, config: MuxConfig, observer: Arc<dyn MuxObserver>) -> Self {
        let slots = (0..MAX_STREAMS).map(|_| None).collect();

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MuxState {
                    slots,
                    echo: EchoTracker::default(),
                    serving: false,
                    stopped: false,
                }),
                sender,
                config,
                observer,
                shutdown: Notify::new(),
            }),
        }
    }

    /// Whether both handles refer to the same multiplexer
    pub fn ptr_eq(&self, other: &Multiplexer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// State of stream slot `id`
    pub fn stream_state(&self, id: u8) -> StreamState {
        let state = self.shared.state.lock();
        state
            .slots
            .get(id as usize)
            .and_then(Option::as_ref)
            .map_or(StreamState::Idle, ActiveStream::state)
    }

    /// Number of slots not idle
    pub fn active_streams(&self) -> usize {
        let state = self.shared.state.lock();
        state.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether the multiplexer has been cleared
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Claim a free slot for `command_id` and start the handler `builder`
    /// creates.
    ///
    /// `builder` runs while the slot table is locked, so it must not call back
    /// into the multiplexer. If the handler's `run` fails the slot is released
    /// again.
    pub async fn request<F>(&self, command_id: u8, builder: F) -> Result<Requested, LinkError>
    where
        F: FnOnce(StreamSender) -> Arc<dyn CommandHandler> + Send,
    {
        if command_id > INITIAL_MAX_COMMAND {
            return Err(WireError::FieldTooLarge {
                field: "command id",
                value: command_id as usize,
                max: INITIAL_MAX_COMMAND as usize,
            }
            .into());
        }

        let (id, handler, closed) = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return Err(LinkError::closed("multiplexer has been stopped"));
            }

            let Some(index) = state.slots.iter().position(Option::is_none) else {
                return Err(LinkError::NoFreeStream);
            };
            let id = index as u8;

            let closed = Arc::new(AtomicBool::new(false));
            let stream_sender = StreamSender::new(
                id,
                self.shared.sender.clone(),
                closed.clone(),
                Arc::downgrade(&self.shared),
            );
            let handler = builder(stream_sender);
            state.slots[index] = Some(ActiveStream::new(handler.clone(), closed.clone()));

            (id, handler, closed)
        };

        debug!("Stream {} requested for command {}", id, command_id);

        let initial = InitialSender::new(id, command_id, self.shared.sender.clone());
        if let Err(e) = handler.run(initial).await {
            warn!("Command {} failed to start on stream {}: {}", command_id, id, e);
            closed.store(true, Ordering::SeqCst);

            let mut state = self.shared.state.lock();
            let slot = &mut state.slots[id as usize];
            if slot.as_ref().is_some_and(|active| active.owns(&closed)) {
                *slot = None;
            }
            return Err(e);
        }

        Ok(Requested { stream_id: id })
    }

    /// Ask the remote to stop emitting stream data
    pub fn pause(&self) -> SendReceipt {
        debug!("Requesting remote to pause streams");
        self.shared.sender.queue(build_pause())
    }

    /// Ask the remote to continue emitting stream data
    pub fn resume(&self) -> SendReceipt {
        debug!("Requesting remote to resume streams");
        self.shared.sender.queue(build_resume())
    }

    /// Send an echo probe with random content
    pub async fn send_echo(&self) -> Result<(), LinkError> {
        let (payload, frame) = build_probe();
        self.send_probe(payload, frame).await
    }

    /// Send an echo probe with the given content
    pub async fn send_echo_with(&self, payload: [u8; ECHO_PAYLOAD_SIZE]) -> Result<(), LinkError> {
        self.send_probe(payload, build_echo(&payload)).await
    }

    async fn send_probe(
        &self,
        payload: [u8; ECHO_PAYLOAD_SIZE],
        frame: bytes::Bytes,
    ) -> Result<(), LinkError> {
        self.shared.sender.send(frame).await?;

        // Timed from the flush so sender coalescing does not inflate the RTT.
        let replaced = self
            .shared
            .state
            .lock()
            .echo
            .record_sent(payload, Instant::now());
        if let Some(update) = replaced {
            self.report_echo(update);
        }

        trace!("Echo probe sent");
        Ok(())
    }

    fn report_echo(&self, update: EchoUpdate) {
        match update {
            EchoUpdate::Delay(rtt) => debug!("Echo round trip took {:?}", rtt),
            EchoUpdate::Failed => warn!("Echo probe failed"),
        }
        self.shared.observer.echo(update);
    }

    /// Stop serving and tear down every stream
    pub async fn shutdown(&self) {
        let serving = self.shared.state.lock().serving;

        if serving {
            self.shared.shutdown.notify_one();
        } else {
            self.clear(None).await;
        }
    }

    /// Read and dispatch exactly one inbound frame
    pub async fn tick(&self, reader: &mut dyn ByteSource) -> Result<(), LinkError> {
        let header = Header::decode(read_one(reader).await?);

        match header.typ() {
            FrameType::Control => {
                let mut limited = Limited::new(reader, header.data() as usize);
                self.handle_control(&mut limited).await
            }
            FrameType::Stream => self.handle_stream(header.data(), reader).await,
            FrameType::Close => self.handle_close(header.data()).await,
            FrameType::Completed => self.handle_completed(header.data()).await,
        }
    }

    /// Dispatch inbound frames until the reader fails or `shutdown` is called.
    ///
    /// Transient errors are logged and skipped. Once the loop ends the echo
    /// loop is stopped, the reader closed and every stream cleared.
    pub async fn serve<R: ByteSource>(&self, mut reader: R) -> Result<(), LinkError> {
        {
            let mut state = self.shared.state.lock();
            if state.serving || state.stopped {
                return Err(LinkError::AlreadyServing);
            }
            state.serving = true;
        }

        info!("Multiplexer serving");
        let echo = tokio::spawn(run_echo(self.clone()));

        let outcome = loop {
            tokio::select! {
                _ = self.shared.shutdown.notified() => break None,
                result = self.tick(&mut reader) => match result {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => debug!("Skipping transient error: {}", e),
                    Err(e) => break Some(e),
                },
            }
        };

        echo.abort();
        reader.close_with_reason(
            outcome
                .clone()
                .unwrap_or_else(|| LinkError::closed("multiplexer has been shut down")),
        );
        self.clear(outcome.clone()).await;

        match outcome {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn handle_control(&self, limited: &mut Limited<'_>) -> Result<(), LinkError> {
        let subtype = read_one(limited).await?;

        match ControlType::try_from(subtype) {
            Ok(ControlType::Echo) => {
                let reply = read_completely(limited).await?;
                let update = self
                    .shared
                    .state
                    .lock()
                    .echo
                    .process_reply(&reply, Instant::now());

                match update {
                    Some(update) => self.report_echo(update),
                    None => trace!("Ignoring unsolicited echo reply"),
                }
                Ok(())
            }
            Ok(other) => {
                read_completely(limited).await?;
                debug!("Ignoring inbound {:?}", other);
                Ok(())
            }
            Err(e) => {
                read_completely(limited).await?;
                Err(e.into())
            }
        }
    }

    async fn handle_stream(&self, id: u8, reader: &mut dyn ByteSource) -> Result<(), LinkError> {
        let (handler, initializing) = {
            let state = self.shared.state.lock();
            match state.slots.get(id as usize).and_then(Option::as_ref) {
                Some(active) => (active.handler.clone(), active.initializing),
                None => {
                    return Err(LinkError::InactiveStream {
                        id,
                        action: "STREAM",
                    })
                }
            }
        };

        let sub = read_n(reader, STREAM_HEADER_SIZE).await?;
        let raw = [sub[0], sub[1]];

        if initializing {
            return self.handle_initial(id, InitialStreamHeader::unpack(raw), handler).await;
        }

        let header = StreamHeader::unpack(raw);
        let mut limited = Limited::new(reader, header.length as usize);
        let result = handler.tick(header, &mut limited).await;

        let leftover = read_completely(&mut limited).await?;
        if !leftover.is_empty() {
            trace!("Discarded {} unread bytes on stream {}", leftover.len(), id);
        }

        result
    }

    async fn handle_initial(
        &self,
        id: u8,
        header: InitialStreamHeader,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), LinkError> {
        handler.initialize(header).await?;

        let mut state = self.shared.state.lock();
        let slot = &mut state.slots[id as usize];

        if header.success {
            if let Some(active) = slot.as_mut() {
                active.initializing = false;
            }
            debug!("Stream {} running command {}", id, header.command);
        } else {
            if let Some(active) = slot.take() {
                active.sender_closed.store(true, Ordering::SeqCst);
            }
            info!("Stream {} rejected by remote with code {}", id, header.data);
        }

        Ok(())
    }

    async fn handle_close(&self, id: u8) -> Result<(), LinkError> {
        let (handler, invoke_close, closed) = {
            let mut state = self.shared.state.lock();
            let Some(active) = state.slots.get_mut(id as usize).and_then(Option::as_mut) else {
                return Err(LinkError::InactiveStream { id, action: "CLOSE" });
            };

            if active.remote_closed {
                return Err(LinkError::InvalidTransition {
                    id,
                    action: "CLOSE",
                    state: active.state().as_str(),
                });
            }

            active.remote_closed = true;
            active.shutting_down = true;
            let invoke_close = !active.close_invoked;
            active.close_invoked = true;

            (active.handler.clone(), invoke_close, active.sender_closed.clone())
        };

        debug!("Stream {} closed by remote", id);

        if invoke_close {
            handler.close().await;
        }

        // The remote only releases the slot once it has seen our CLOSE too.
        if !closed.swap(true, Ordering::SeqCst) {
            let _ = self.shared.sender.queue(build_close(id)?);
        }
        let _ = self.shared.sender.queue(build_completed(id)?);

        Ok(())
    }

    async fn handle_completed(&self, id: u8) -> Result<(), LinkError> {
        let (handler, invoke_close) = {
            let mut state = self.shared.state.lock();
            let slot = &mut state.slots[id as usize];

            let Some(active) = slot.as_mut() else {
                return Err(LinkError::InactiveStream {
                    id,
                    action: "COMPLETED",
                });
            };

            if !active.shutting_down {
                return Err(LinkError::InvalidTransition {
                    id,
                    action: "COMPLETED",
                    state: active.state().as_str(),
                });
            }

            let invoke_close = !active.close_invoked;
            active.sender_closed.store(true, Ordering::SeqCst);
            let handler = active.handler.clone();
            *slot = None;

            (handler, invoke_close)
        };

        if invoke_close {
            handler.close().await;
        }
        handler.completed().await;

        debug!("Stream {} completed", id);
        Ok(())
    }

    async fn clear(&self, error: Option<LinkError>) {
        let streams: Vec<(u8, ActiveStream)> = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.echo = EchoTracker::default();

            state
                .slots
                .iter_mut()
                .enumerate()
                .filter_map(|(id, slot)| slot.take().map(|active| (id as u8, active)))
                .collect()
        };

        for (id, stream) in streams {
            stream.sender_closed.store(true, Ordering::SeqCst);
            if !stream.close_invoked {
                stream.handler.close().await;
            }
            stream.handler.completed().await;
            trace!("Stream {} cleared", id);
        }

        self.shared.sender.close();

        match &error {
            Some(e) => warn!("Multiplexer stopped: {}", e),
            None => info!("Multiplexer stopped"),
        }
        self.shared.observer.cleared(error.as_ref());
    }
}

async fn run_echo(mux: Multiplexer) {
    let period = mux.shared.config.echo_interval.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        if let Err(e) = mux.send_echo().await {
            debug!("Echo loop stopped: {}", e);
            return;
        }
    }
}
