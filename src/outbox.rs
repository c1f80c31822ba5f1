//! Per-connection outbound queue.
//!
//! An [`Outbox`] is the cloneable handle through which the relay writes to a
//! socket. The socket's writer task owns the receiving end.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::nostr::RelayMessage;

pub type ConnectionId = u64;

/// Items consumed by a socket writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close,
}

#[derive(Clone)]
pub struct Outbox {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    log_frames: bool,
}

impl Outbox {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<Outbound>, log_frames: bool) -> Self {
        Self {
            connection_id,
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            log_frames,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a frame, waiting for room if the queue is full.
    ///
    /// Returns `false` once the outbox is closed or the writer has gone away.
    pub async fn send(&self, message: &RelayMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        let frame = message.as_json();
        if self.log_frames {
            tracing::info!(connection = self.connection_id, frame = %frame, "relay send");
        }
        if self.tx.send(Outbound::Frame(frame)).await.is_ok() {
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue a frame without waiting. A full queue drops the frame and
    /// counts it, so one slow socket never holds up another.
    pub fn try_send(&self, message: &RelayMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        let frame = message.as_json();
        if self.log_frames {
            tracing::info!(connection = self.connection_id, frame = %frame, "relay send");
        }
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    connection = self.connection_id,
                    dropped = self.drop_count(),
                    "outbound queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Mark closed and ask the writer to close the socket. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // a full queue means the writer is already backed up; the socket
            // closes when the reader side ends
            let _ = self.tx.try_send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Frames that could not be queued, because the writer was gone or its
    /// queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_outbox() -> (Outbox, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (Outbox::new(1, tx, false), rx)
    }

    #[tokio::test]
    async fn test_send_message_success() {
        let (outbox, mut rx) = make_outbox();
        assert!(outbox.send(&RelayMessage::eose("s1")).await);
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Frame(r#"["EOSE","s1"]"#.to_string()))
        );
    }

    #[tokio::test]
    async fn test_send_after_close_is_refused() {
        let (outbox, mut rx) = make_outbox();
        outbox.close();
        outbox.close();

        assert!(outbox.is_closed());
        assert!(!outbox.send(&RelayMessage::notice("late")).await);
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_dropped_writer_returns_false() {
        let (outbox, rx) = make_outbox();
        drop(rx);
        assert!(!outbox.send(&RelayMessage::eose("s1")).await);
        assert!(outbox.is_closed());
    }

    #[tokio::test]
    async fn test_clones_share_closed_state() {
        let (outbox, _rx) = make_outbox();
        let clone = outbox.clone();
        outbox.close();
        assert!(clone.is_closed());
        assert_eq!(clone.connection_id(), 1);
    }

    #[tokio::test]
    async fn test_try_send_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let outbox = Outbox::new(1, tx, false);

        assert!(outbox.try_send(&RelayMessage::eose("s1")));
        assert!(!outbox.try_send(&RelayMessage::eose("s2")));
        assert!(!outbox.try_send(&RelayMessage::eose("s3")));
        assert_eq!(outbox.drop_count(), 2);
        assert!(!outbox.is_closed());

        assert_eq!(
            rx.recv().await,
            Some(Outbound::Frame(r#"["EOSE","s1"]"#.to_string()))
        );
        assert!(outbox.try_send(&RelayMessage::eose("s4")));
        assert_eq!(outbox.drop_count(), 2);
    }
}
