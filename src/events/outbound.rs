//! Per-connection outbound queues.
//!
//! Every connection gets two bounded lanes. The droppable lane carries
//! ephemeral traffic (cursor positions, presence, typing); when it fills,
//! the oldest intent is simply lost because a newer one is always on the
//! way. The guaranteed lane carries state events and lock notifications;
//! it must never silently drop, so saturation there marks the subscriber
//! as too slow to keep and the connection is torn down.
//!
//! Frames are pre-serialized JSON shared across the fanout, so a broadcast
//! serializes once no matter how many subscribers it reaches.

use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A serialized wire frame, shared across subscribers.
pub type Frame = Arc<str>;

/// Result of offering a frame to a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Droppable lane full; the frame was discarded.
    Dropped,
    /// Guaranteed lane full; the subscriber must be disconnected.
    Saturated,
    /// The receiving half is gone.
    Closed,
}

/// Sending half, held by the broadcast side.
#[derive(Clone)]
pub struct OutboundQueue {
    droppable: mpsc::Sender<Frame>,
    guaranteed: mpsc::Sender<Frame>,
    dropped: Arc<AtomicU64>,
}

/// Receiving half, owned by the connection's writer task.
#[derive(Debug)]
pub struct OutboundReceiver {
    droppable: mpsc::Receiver<Frame>,
    guaranteed: mpsc::Receiver<Frame>,
    droppable_closed: bool,
}

pub fn channel(guaranteed_capacity: usize, droppable_capacity: usize) -> (OutboundQueue, OutboundReceiver) {
    let (g_tx, g_rx) = mpsc::channel(guaranteed_capacity);
    let (d_tx, d_rx) = mpsc::channel(droppable_capacity);
    (
        OutboundQueue {
            droppable: d_tx,
            guaranteed: g_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        OutboundReceiver {
            droppable: d_rx,
            guaranteed: g_rx,
            droppable_closed: false,
        },
    )
}

impl OutboundQueue {
    /// Offer an ephemeral frame. Full is not an error.
    pub fn send_droppable(&self, frame: Frame) -> SendOutcome {
        match self.droppable.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("huddle_outbound_dropped_total").increment(1);
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Offer a state frame. Full means the subscriber cannot keep up.
    pub fn send_guaranteed(&self, frame: Frame) -> SendOutcome {
        match self.guaranteed.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!("huddle_outbound_saturated_total").increment(1);
                SendOutcome::Saturated
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Frames discarded from the droppable lane so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.guaranteed.is_closed()
    }
}

impl OutboundReceiver {
    /// Next frame for the socket. Guaranteed frames are preferred when both
    /// lanes are ready, so state events are never starved by cursor spam.
    /// Returns `None` once both senders are gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            if self.droppable_closed {
                return self.guaranteed.recv().await;
            }
            tokio::select! {
                biased;
                frame = self.guaranteed.recv() => {
                    match frame {
                        Some(f) => return Some(f),
                        None => return self.droppable.recv().await,
                    }
                }
                frame = self.droppable.recv() => {
                    match frame {
                        Some(f) => return Some(f),
                        None => self.droppable_closed = true,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Frame {
        Arc::from(s)
    }

    #[tokio::test]
    async fn test_droppable_overflow_drops() {
        let (tx, _rx) = channel(4, 2);
        assert_eq!(tx.send_droppable(frame("a")), SendOutcome::Sent);
        assert_eq!(tx.send_droppable(frame("b")), SendOutcome::Sent);
        assert_eq!(tx.send_droppable(frame("c")), SendOutcome::Dropped);
        assert_eq!(tx.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_guaranteed_overflow_saturates() {
        let (tx, _rx) = channel(1, 4);
        assert_eq!(tx.send_guaranteed(frame("a")), SendOutcome::Sent);
        assert_eq!(tx.send_guaranteed(frame("b")), SendOutcome::Saturated);
    }

    #[tokio::test]
    async fn test_guaranteed_preferred_over_droppable() {
        let (tx, mut rx) = channel(4, 4);
        tx.send_droppable(frame("cursor"));
        tx.send_guaranteed(frame("state"));

        assert_eq!(rx.recv().await.as_deref(), Some("state"));
        assert_eq!(rx.recv().await.as_deref(), Some("cursor"));
    }

    #[tokio::test]
    async fn test_recv_none_after_close() {
        let (tx, mut rx) = channel(2, 2);
        tx.send_guaranteed(frame("last"));
        drop(tx);
        assert_eq!(rx.recv().await.as_deref(), Some("last"));
        assert!(rx.recv().await.is_none());
    }
}
