//! Single-consumer async hand-off between producers and one waiting reader.
//!
//! Values and errors are queued in FIFO order so producers may run ahead of
//! the consumer. Once disabled, queued items are still delivered and every
//! later `subscribe` fails with the disable reason.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::LinkError;

struct State<T> {
    pending: VecDeque<Result<T, LinkError>>,
    disabled: Option<LinkError>,
}

/// FIFO rendezvous point for one consumer
pub struct Rendezvous<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Rendezvous<T> {
    /// Create an empty rendezvous
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                disabled: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Hand a value to the waiting (or next) subscriber
    pub fn resolve(&self, value: T) {
        self.state.lock().pending.push_back(Ok(value));
        self.notify.notify_one();
    }

    /// Hand an error to the waiting (or next) subscriber
    pub fn reject(&self, error: LinkError) {
        self.state.lock().pending.push_back(Err(error));
        self.notify.notify_one();
    }

    /// Fail every subscription after the queue has drained
    pub fn disable(&self, reason: LinkError) {
        {
            let mut state = self.state.lock();
            if state.disabled.is_none() {
                state.disabled = Some(reason);
            }
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether `disable` has been called
    pub fn is_disabled(&self) -> bool {
        self.state.lock().disabled.is_some()
    }

    /// Number of queued values and errors
    pub fn pendings(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Wait for the next value
    pub async fn subscribe(&self) -> Result<T, LinkError> {
        loop {
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.pending.pop_front() {
                    return item;
                }
                if let Some(reason) = &state.disabled {
                    return Err(reason.clone());
                }
            }

            notified.await;
        }
    }
}
