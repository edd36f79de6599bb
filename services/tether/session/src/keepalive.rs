//! Echo probes with RTT measurement.
//!
//! One probe may be outstanding at a time. Sending a new probe while the
//! previous one is unanswered reports the previous one as failed.

use std::time::Duration;

use bytes::Bytes;
use tether_wire::{build_echo, ECHO_PAYLOAD_SIZE};
use tokio::time::Instant;

/// Lower bound of the sender flush delay derived from echo RTT
pub const MIN_SEND_DELAY: Duration = Duration::from_millis(30);

/// Upper bound of the sender flush delay derived from echo RTT
pub const MAX_SEND_DELAY: Duration = Duration::from_millis(200);

/// Result of an echo probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoUpdate {
    /// The probe came back after this round-trip time
    Delay(Duration),
    /// The probe was lost or answered with the wrong bytes
    Failed,
}

/// Build an ECHO frame carrying fresh random bytes
pub fn build_probe() -> ([u8; ECHO_PAYLOAD_SIZE], Bytes) {
    let payload: [u8; ECHO_PAYLOAD_SIZE] = rand::random();
    (payload, build_echo(&payload))
}

/// Flush delay to use for a measured round-trip time: half the RTT, clamped
pub fn send_delay_for(rtt: Duration) -> Duration {
    (rtt / 2).clamp(MIN_SEND_DELAY, MAX_SEND_DELAY)
}

/// Tracks the outstanding echo probe
#[derive(Debug, Default)]
pub struct EchoTracker {
    outstanding: Option<(Instant, [u8; ECHO_PAYLOAD_SIZE])>,
}

impl EchoTracker {
    /// Record a probe whose frame was flushed at `at`
    pub fn record_sent(&mut self, payload: [u8; ECHO_PAYLOAD_SIZE], at: Instant) -> Option<EchoUpdate> {
        let previous = self.outstanding.replace((at, payload));
        previous.map(|_| EchoUpdate::Failed)
    }

    /// Match an inbound echo body against the outstanding probe
    pub fn process_reply(&mut self, reply: &[u8], now: Instant) -> Option<EchoUpdate> {
        let (sent_at, payload) = self.outstanding?;

        if reply.len() != payload.len() {
            return None;
        }

        self.outstanding = None;

        if reply != payload {
            return Some(EchoUpdate::Failed);
        }

        Some(EchoUpdate::Delay(now.saturating_duration_since(sent_at)))
    }

    /// Whether a probe is waiting for its reply
    pub fn is_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_frame() {
        let (payload, frame) = build_probe();
        assert_eq!(frame.len(), 2 + ECHO_PAYLOAD_SIZE);
        assert_eq!(frame[0], 0x07);
        assert_eq!(frame[1], 0x00);
        assert_eq!(&frame[2..], &payload);
    }

    #[test]
    fn test_send_delay_clamp() {
        assert_eq!(send_delay_for(Duration::from_millis(10)), MIN_SEND_DELAY);
        assert_eq!(send_delay_for(Duration::from_millis(100)), Duration::from_millis(50));
        assert_eq!(send_delay_for(Duration::from_secs(2)), MAX_SEND_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_reply_reports_delay() {
        let mut tracker = EchoTracker::default();
        let start = Instant::now();
        assert_eq!(tracker.record_sent([1, 2, 3, 4, 5, 6], start), None);

        tokio::time::advance(Duration::from_millis(42)).await;
        assert_eq!(
            tracker.process_reply(&[1, 2, 3, 4, 5, 6], Instant::now()),
            Some(EchoUpdate::Delay(Duration::from_millis(42)))
        );
        assert!(!tracker.is_outstanding());
        assert_eq!(tracker.process_reply(&[1, 2, 3, 4, 5, 6], Instant::now()), None);
    }

    #[test]
    fn test_mismatch_and_overlap_fail() {
        let now = Instant::now();
        let mut tracker = EchoTracker::default();

        tracker.record_sent([1, 2, 3, 4, 5, 6], now);
        assert_eq!(tracker.process_reply(&[1, 2, 3], now), None);
        assert!(tracker.is_outstanding());
        assert_eq!(
            tracker.process_reply(&[1, 2, 3, 4, 5, 7], now),
            Some(EchoUpdate::Failed)
        );

        tracker.record_sent([1; 6], now);
        assert_eq!(tracker.record_sent([2; 6], now), Some(EchoUpdate::Failed));
        assert_eq!(
            tracker.process_reply(&[2; 6], now),
            Some(EchoUpdate::Delay(Duration::ZERO))
        );
    }
}
