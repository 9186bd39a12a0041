//! Event fanout across resource streams.
//!
//! The broadcaster owns the stream table and the per-session outbound
//! queues. Publishing a state event is durable-or-fail: the activity
//! record is appended before any sequence is assigned, so a failed append
//! leaves no gap and no subscriber ever saw the event.

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::activity::{ActivityAction, ActivityRecord, ActivitySink};
use crate::error::{CollabError, ErrorCode, Result};
use crate::events::outbound::{Frame, OutboundQueue, SendOutcome};
use crate::events::stream::{ResourceStream, SequencedEvent};
use crate::workspace::models::{ResourceRef, SessionId, WorkspaceId};

/// Result of a subscribe call.
#[derive(Debug)]
pub struct Subscription {
    /// Last sequence the stream has assigned.
    pub high_water: u64,
    /// Missed events to hand the subscriber, oldest first.
    pub replay: Vec<Arc<SequencedEvent>>,
    /// The requested catch-up point has left the replay buffer; the
    /// client must refetch the resource instead of patching.
    pub resync_required: bool,
}

/// Result of a publish.
#[derive(Debug)]
pub struct Published {
    pub event: Arc<SequencedEvent>,
    pub delivered: usize,
    /// Subscribers whose guaranteed lane was full. The caller disconnects
    /// them; a subscriber that cannot take state events is already broken.
    pub saturated: Vec<SessionId>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BroadcastStats {
    pub events_published: u64,
    pub frames_delivered: u64,
    pub slow_disconnects: u64,
}

pub struct EventBroadcaster {
    streams: DashMap<ResourceRef, Mutex<ResourceStream>>,
    queues: DashMap<SessionId, OutboundQueue>,
    subscriptions: DashMap<SessionId, HashSet<ResourceRef>>,
    activity: Arc<dyn ActivitySink>,
    replay_capacity: usize,
    events_published: AtomicU64,
    frames_delivered: AtomicU64,
    slow_disconnects: AtomicU64,
}

impl EventBroadcaster {
    pub fn new(activity: Arc<dyn ActivitySink>, replay_capacity: usize) -> Self {
        Self {
            streams: DashMap::new(),
            queues: DashMap::new(),
            subscriptions: DashMap::new(),
            activity,
            replay_capacity,
            events_published: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            slow_disconnects: AtomicU64::new(0),
        }
    }

    /// Attach a session's outbound queue. Must precede any subscribe.
    pub fn register(&self, session: SessionId, queue: OutboundQueue) {
        self.queues.insert(session, queue);
        self.subscriptions.insert(session, HashSet::new());
    }

    /// Detach a session everywhere. Safe to call twice.
    pub fn deregister(&self, session: SessionId) {
        if let Some((_, resources)) = self.subscriptions.remove(&session) {
            for resource in resources {
                if let Some(stream) = self.streams.get(&resource) {
                    stream.lock().unsubscribe(&session);
                }
            }
        }
        self.queues.remove(&session);
    }

    /// Subscribe a registered session to a resource stream, replaying from
    /// `since` when given.
    pub fn subscribe(
        &self,
        session: SessionId,
        resource: &ResourceRef,
        since: Option<u64>,
    ) -> Result<Subscription> {
        let queue = self
            .queues
            .get(&session)
            .map(|q| q.clone())
            .ok_or_else(|| CollabError::not_found(ErrorCode::SessionNotFound, session))?;

        let stream = self
            .streams
            .entry(resource.clone())
            .or_insert_with(|| Mutex::new(ResourceStream::new(self.replay_capacity)));
        let mut stream = stream.lock();
        stream.subscribe(session, queue);
        let high_water = stream.high_water();

        let (replay, resync_required) = match since {
            Some(since) => match stream.events_since(since) {
                Some(events) => (events, false),
                None => (Vec::new(), true),
            },
            None => (Vec::new(), false),
        };
        drop(stream);

        if let Some(mut subs) = self.subscriptions.get_mut(&session) {
            subs.insert(resource.clone());
        }
        debug!(session = %session, resource = %resource, high_water, "Subscribed");
        Ok(Subscription {
            high_water,
            replay,
            resync_required,
        })
    }

    pub fn unsubscribe(&self, session: SessionId, resource: &ResourceRef) {
        if let Some(stream) = self.streams.get(resource) {
            stream.lock().unsubscribe(&session);
        }
        if let Some(mut subs) = self.subscriptions.get_mut(&session) {
            subs.remove(resource);
        }
    }

    /// Publish a state event: audit it, assign its sequence, and fan it
    /// out on the guaranteed lane. The frame builder runs after sequencing
    /// so the wire frame carries the assigned number.
    pub async fn publish(
        &self,
        workspace: &WorkspaceId,
        event: SequencedEvent,
        build_frame: impl FnOnce(&SequencedEvent) -> Result<Frame>,
    ) -> Result<Published> {
        let record = ActivityRecord::new(
            workspace.clone(),
            event.actor.clone(),
            ActivityAction::EventPublished,
        )
        .with_session(event.session)
        .with_resource(event.resource.clone())
        .with_detail(serde_json::json!({ "event_type": event.event_type }));
        self.activity.append(record).await?;

        let resource = event.resource.clone();
        let stream = self
            .streams
            .entry(resource.clone())
            .or_insert_with(|| Mutex::new(ResourceStream::new(self.replay_capacity)));
        // Sequencing and fanout stay under one lock so every subscriber
        // sees the stream in the same order.
        let mut stream = stream.lock();
        let event = stream.sequence(event);
        let frame = build_frame(&event)?;

        let mut delivered = 0;
        let mut saturated = Vec::new();
        for (subscriber, queue) in stream.subscribers() {
            match queue.send_guaranteed(frame.clone()) {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::Saturated => saturated.push(*subscriber),
                SendOutcome::Dropped | SendOutcome::Closed => {}
            }
        }
        drop(stream);

        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        counter!("huddle_events_published_total").increment(1);
        if !saturated.is_empty() {
            self.slow_disconnects
                .fetch_add(saturated.len() as u64, Ordering::Relaxed);
            warn!(resource = %resource, count = saturated.len(),
                "Subscribers saturated on guaranteed lane");
        }
        Ok(Published {
            event,
            delivered,
            saturated,
        })
    }

    /// Fan an ephemeral frame out to a resource's subscribers on the
    /// droppable lane, skipping the originator.
    pub fn broadcast_ephemeral(
        &self,
        resource: &ResourceRef,
        frame: Frame,
        exclude: Option<SessionId>,
    ) -> usize {
        let Some(stream) = self.streams.get(resource) else {
            return 0;
        };
        let stream = stream.lock();
        let mut delivered = 0;
        for (subscriber, queue) in stream.subscribers() {
            if Some(*subscriber) == exclude {
                continue;
            }
            if queue.send_droppable(frame.clone()) == SendOutcome::Sent {
                delivered += 1;
            }
        }
        delivered
    }

    /// Direct frame to one session's guaranteed lane.
    pub fn send_to(&self, session: SessionId, frame: Frame) -> SendOutcome {
        match self.queues.get(&session) {
            Some(queue) => queue.send_guaranteed(frame),
            None => SendOutcome::Closed,
        }
    }

    /// Direct frame to one session's droppable lane.
    pub fn send_to_droppable(&self, session: SessionId, frame: Frame) -> SendOutcome {
        match self.queues.get(&session) {
            Some(queue) => queue.send_droppable(frame),
            None => SendOutcome::Closed,
        }
    }

    /// Last assigned sequence for a resource, 0 if it has no stream yet.
    pub fn high_water(&self, resource: &ResourceRef) -> u64 {
        self.streams
            .get(resource)
            .map(|s| s.lock().high_water())
            .unwrap_or(0)
    }

    /// Resources the session is currently subscribed to.
    pub fn subscriptions_of(&self, session: SessionId) -> Vec<ResourceRef> {
        self.subscriptions
            .get(&session)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            slow_disconnects: self.slow_disconnects.load(Ordering::Relaxed),
        }
    }
}
