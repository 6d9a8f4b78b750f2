//! Outbound half of a WebSocket connection
//!
//! Each socket gets one writer task draining a bounded queue. The registries
//! hold a [`PeerHandle`] to that queue instead of the socket itself, so frames
//! can be queued from anywhere without touching the socket.
//!
//! Two queue slots are reserved when the handle is created: one for a final
//! notice and one for the close command. Closing therefore never depends on
//! the queue having room, and the last frame a peer sees is never dropped
//! because earlier traffic filled the queue.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use tr_protocol::Frame;

/// Commands consumed by a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send a text message
    Text(String),
    /// Flush everything queued before this, send a close frame and stop
    Close,
}

/// Result of a non-waiting send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrySend {
    Queued,
    /// The writer is behind and the queue has no room
    Full,
    /// The connection is closing or gone
    Closed,
}

/// Queue slots held back for the final notice and the close command
const FINAL_SLOTS: usize = 2;

#[derive(Debug)]
struct FinalSlots {
    notice: mpsc::OwnedPermit<Outbound>,
    close: mpsc::OwnedPermit<Outbound>,
}

/// Handle to a connection's outbound queue and lifetime
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    final_slots: Arc<Mutex<Option<FinalSlots>>>,
}

impl PeerHandle {
    /// Create a handle whose lifetime is bound to `parent`.
    ///
    /// `capacity` frames can be queued on top of the reserved final slots.
    /// Returns the receiver the writer task must drain.
    pub fn new(capacity: usize, parent: &CancellationToken) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity + FINAL_SLOTS);
        let final_slots = match (tx.clone().try_reserve_owned(), tx.clone().try_reserve_owned()) {
            (Ok(notice), Ok(close)) => Some(FinalSlots { notice, close }),
            _ => None,
        };
        let handle = Self {
            tx,
            cancel: parent.child_token(),
            final_slots: Arc::new(Mutex::new(final_slots)),
        };
        (handle, rx)
    }

    /// Whether the connection is still accepting frames
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    /// Queue a frame, waiting for queue space
    pub async fn send(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.send_text(text).await,
            Err(e) => {
                tracing::error!("Failed to encode {} frame: {}", frame.frame_type().as_str(), e);
                false
            }
        }
    }

    /// Queue raw text, waiting for queue space until the connection closes
    pub async fn send_text(&self, text: String) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Outbound::Text(text)) => sent.is_ok(),
        }
    }

    /// Queue a frame without waiting. Returns false if the queue is full or
    /// the connection is gone.
    pub fn try_send(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.try_send_text(text) == TrySend::Queued,
            Err(e) => {
                tracing::error!("Failed to encode {} frame: {}", frame.frame_type().as_str(), e);
                false
            }
        }
    }

    /// Queue raw text without waiting
    pub fn try_send_text(&self, text: String) -> TrySend {
        if self.cancel.is_cancelled() {
            return TrySend::Closed;
        }
        match self.tx.try_send(Outbound::Text(text)) {
            Ok(()) => TrySend::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => TrySend::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => TrySend::Closed,
        }
    }

    /// Claim one ordinary queue slot, so several peers can be sent to
    /// all-or-nothing
    pub fn try_reserve(&self) -> Option<mpsc::Permit<'_, Outbound>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.tx.try_reserve().ok()
    }

    /// Close after everything already queued has been written.
    ///
    /// Returns false if the connection was already closing or gone.
    pub fn close(&self) -> bool {
        self.finish(None)
    }

    /// Queue `frame` as the last message, then close.
    ///
    /// Uses the reserved slots, so it succeeds even when the queue is full.
    /// Returns false if the connection was already closing or gone.
    pub fn close_with(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.close_with_text(text),
            Err(e) => {
                tracing::error!("Failed to encode {} frame: {}", frame.frame_type().as_str(), e);
                self.finish(None);
                false
            }
        }
    }

    /// Queue raw text as the last message, then close
    pub fn close_with_text(&self, text: String) -> bool {
        self.finish(Some(text))
    }

    /// Tear the connection down immediately, dropping queued frames
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the connection has been closed or aborted
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Cancellation token shared with the socket tasks
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn finish(&self, notice: Option<String>) -> bool {
        if !self.is_open() {
            return false;
        }
        let slots = match self.final_slots.lock() {
            Ok(mut slots) => slots.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(FinalSlots {
            notice: notice_slot,
            close,
        }) = slots
        else {
            return false;
        };

        if let Some(text) = notice {
            notice_slot.send(Outbound::Text(text));
        }
        close.send(Outbound::Close);
        true
    }
}
