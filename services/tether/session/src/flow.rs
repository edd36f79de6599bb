//! Advisory receive-side flow control.
//!
//! Compares raw bytes received from the transport with bytes actually pulled
//! by the reader chain, and asks the remote to pause stream output while the
//! backlog is too large.

/// Received bytes must exceed this many before pausing is considered
pub const MIN_RECEIVED_TO_PAUSE: u64 = 16 * 1024;

/// Pause once received bytes exceed this multiple of delivered bytes
pub const RECEIVE_TO_PAUSE_FACTOR: u64 = 6;

/// Control signal to send to the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    /// Send PAUSESTREAM
    Pause,
    /// Send RESUMESTREAM
    Resume,
}

/// Backlog counters
#[derive(Debug, Default, Clone)]
pub struct FlowControl {
    received: u64,
    delivered: u64,
    paused: bool,
}

impl FlowControl {
    /// Count bytes arriving from the transport
    pub fn record_received(&mut self, n: usize) {
        self.received += n as u64;
    }

    /// Count bytes pulled by the reader chain
    pub fn record_delivered(&mut self, n: usize) {
        self.delivered += n as u64;

        if self.delivered >= self.received {
            self.delivered = 0;
            self.received = 0;
        }
    }

    /// Signal to send, if the paused state has to change
    pub fn evaluate(&mut self) -> Option<FlowSignal> {
        let backlogged = self.backlogged();

        if self.paused && !backlogged {
            self.paused = false;
            return Some(FlowSignal::Resume);
        }

        if !self.paused && backlogged {
            self.paused = true;
            return Some(FlowSignal::Pause);
        }

        None
    }

    /// Whether a pause has been requested and not yet lifted
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn backlogged(&self) -> bool {
        self.received > MIN_RECEIVED_TO_PAUSE
            && self.received > self.delivered * RECEIVE_TO_PAUSE_FACTOR
    }
}
