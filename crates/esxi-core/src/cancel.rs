//! Cooperative cancellation for long-running downloads.
//!
//! A [`CancelHandle`] owns the only sender of a zero-capacity channel; every
//! [`CancelToken`] holds a receiver. Cancelling drops the sender, which
//! disconnects the channel and wakes every waiting token at once.

use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

/// Triggers cancellation. Dropping the handle also cancels.
pub struct CancelHandle {
    sender: Mutex<Option<Sender<()>>>,
}

/// Observes cancellation; cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    receiver: Receiver<()>,
}

/// Create a linked handle and token.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (sender, receiver) = crossbeam_channel::bounded(0);
    (
        CancelHandle {
            sender: Mutex::new(Some(sender)),
        },
        CancelToken { receiver },
    )
}

impl CancelHandle {
    /// Cancel every linked token.
    pub fn cancel(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self {
            receiver: crossbeam_channel::never(),
        }
    }

    /// True once the linked handle cancelled or was dropped.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `duration` unless cancelled first. Returns true if cancelled.
    pub fn wait(&self, duration: Duration) -> bool {
        matches!(
            self.receiver.recv_timeout(duration),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}
