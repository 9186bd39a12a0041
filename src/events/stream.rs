//! Per-resource event streams.
//!
//! Each resource carries its own monotonically increasing sequence,
//! starting at 1 with no gaps. Sequence assignment and fanout happen under
//! one mutex, so every subscriber observes events for a resource in
//! identical order. A bounded replay buffer lets reconnecting sessions
//! catch up without a full refetch.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::events::outbound::OutboundQueue;
use crate::workspace::models::{ResourceRef, SessionId, UserId};

/// A state event after sequencing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SequencedEvent {
    pub resource: ResourceRef,
    /// Position in the resource's stream, starting at 1.
    pub sequence: u64,
    pub event_type: String,
    pub actor: UserId,
    pub session: SessionId,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

/// Mutable state for one resource's stream. Lives inside a mutex in the
/// broadcaster's stream table.
pub struct ResourceStream {
    next_sequence: u64,
    replay: VecDeque<Arc<SequencedEvent>>,
    replay_capacity: usize,
    subscribers: HashMap<SessionId, OutboundQueue>,
}

impl ResourceStream {
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            next_sequence: 1,
            replay: VecDeque::new(),
            replay_capacity,
            subscribers: HashMap::new(),
        }
    }

    /// The last sequence assigned, 0 if none yet.
    pub fn high_water(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Assign the next sequence number and retain the event for replay.
    pub fn sequence(&mut self, mut event: SequencedEvent) -> Arc<SequencedEvent> {
        event.sequence = self.next_sequence;
        self.next_sequence += 1;
        let event = Arc::new(event);
        if self.replay.len() >= self.replay_capacity {
            self.replay.pop_front();
        }
        self.replay.push_back(event.clone());
        event
    }

    /// Events with a sequence strictly greater than `since`, oldest first.
    /// Returns `None` when `since` has already slid out of the buffer and
    /// the caller needs a full resync instead.
    pub fn events_since(&self, since: u64) -> Option<Vec<Arc<SequencedEvent>>> {
        if since >= self.high_water() {
            return Some(Vec::new());
        }
        let oldest = self.replay.front().map(|e| e.sequence)?;
        if since + 1 < oldest {
            return None;
        }
        Some(
            self.replay
                .iter()
                .filter(|e| e.sequence > since)
                .cloned()
                .collect(),
        )
    }

    pub fn subscribe(&mut self, session: SessionId, queue: OutboundQueue) {
        self.subscribers.insert(session, queue);
    }

    pub fn unsubscribe(&mut self, session: &SessionId) -> bool {
        self.subscribers.remove(session).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = (&SessionId, &OutboundQueue)> {
        self.subscribers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::models::ResourceKind;

    fn event() -> SequencedEvent {
        SequencedEvent {
            resource: ResourceRef::new(ResourceKind::Request, "r1"),
            sequence: 0,
            event_type: "request.updated".into(),
            actor: UserId::new("alice"),
            session: SessionId::new(),
            payload: serde_json::json!({"field": "url"}),
            published_at: Utc::now(),
        }
    }

    #[test]
    fn test_sequences_start_at_one_without_gaps() {
        let mut stream = ResourceStream::new(8);
        assert_eq!(stream.high_water(), 0);
        for expected in 1..=5 {
            let e = stream.sequence(event());
            assert_eq!(e.sequence, expected);
        }
        assert_eq!(stream.high_water(), 5);
    }

    #[test]
    fn test_events_since_returns_tail() {
        let mut stream = ResourceStream::new(8);
        for _ in 0..5 {
            stream.sequence(event());
        }
        let tail = stream.events_since(3).unwrap();
        assert_eq!(
            tail.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert!(stream.events_since(5).unwrap().is_empty());
    }

    #[test]
    fn test_events_since_past_buffer_needs_resync() {
        let mut stream = ResourceStream::new(3);
        for _ in 0..6 {
            stream.sequence(event());
        }
        // Buffer holds 4..=6; asking from 1 would skip 2 and 3.
        assert!(stream.events_since(1).is_none());
        assert!(stream.events_since(3).is_some());
    }
}
