//! Shared real-time state and the message dispatch core.
//!
//! `CollabState` wires the permission resolver, presence tracker, lock
//! manager, and event broadcaster together. The connection handler owns
//! the socket; everything that touches shared state goes through here, so
//! the dispatch logic is testable without a socket.
//!
//! Every client action is permission-checked when it arrives. Nothing is
//! authorized "for the lifetime of the connection": a member demoted
//! mid-session loses write access on their very next message.

use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityAction, ActivityRecord, ActivitySink};
use crate::authz::{PermissionCache, PermissionResolver};
use crate::config::RealtimeConfig;
use crate::error::{CollabError, ErrorCode, Result};
use crate::events::{channel, EventBroadcaster, OutboundReceiver, SendOutcome, SequencedEvent};
use crate::locks::{Lease, LockManager};
use crate::presence::{Coalescer, Offer, PresenceInfo, PresenceThresholds, PresenceTracker};
use crate::realtime::auth::{AuthContext, TokenValidator};
use crate::realtime::message::{ClientMessage, ServerMessage};
use crate::workspace::grants::ResourceGrantStore;
use crate::workspace::membership::MembershipStore;
use crate::workspace::models::{Capability, ResourceRef, SessionId, UserId, WorkspaceId};

/// Operational snapshot served from `/stats`.
#[derive(Debug, serde::Serialize)]
pub struct CollabStats {
    pub sessions: usize,
    pub locks: crate::locks::LockStats,
    pub broadcast: crate::events::BroadcastStats,
    pub permission_cache: crate::authz::CacheStats,
}

/// Everything a live connection needs to dispatch messages.
pub struct CollabState {
    pub config: RealtimeConfig,
    pub membership: Arc<MembershipStore>,
    pub grants: Arc<ResourceGrantStore>,
    pub cache: Arc<PermissionCache>,
    pub resolver: PermissionResolver,
    pub presence: PresenceTracker,
    pub locks: LockManager,
    pub broadcaster: EventBroadcaster,
    pub activity: Arc<dyn ActivitySink>,
    pub validator: Arc<dyn TokenValidator>,
    cursors: Coalescer<(SessionId, String), ServerMessage>,
}

impl CollabState {
    pub fn new(
        config: RealtimeConfig,
        membership: Arc<MembershipStore>,
        grants: Arc<ResourceGrantStore>,
        cache: Arc<PermissionCache>,
        activity: Arc<dyn ActivitySink>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        let resolver =
            PermissionResolver::new(membership.clone(), grants.clone(), cache.clone());
        let presence = PresenceTracker::new(PresenceThresholds {
            idle_after: config.idle_threshold,
            away_after: config.away_threshold,
            heartbeat_interval: config.heartbeat_interval,
            max_missed_heartbeats: config.max_missed_heartbeats,
        });
        let locks = LockManager::new(config.lock_lease);
        let broadcaster = EventBroadcaster::new(activity.clone(), config.replay_buffer_size);
        let cursors = Coalescer::new(config.coalesce_window);
        Self {
            config,
            membership,
            grants,
            cache,
            resolver,
            presence,
            locks,
            broadcaster,
            activity,
            validator,
            cursors,
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ───────────────────────────────────────────────────────────────────────────

    /// Authenticate a token and bring up a session. The returned receiver
    /// feeds the connection's writer task; `initial_data` is already
    /// queued on it.
    pub async fn connect(&self, token: &str) -> Result<(SessionId, AuthContext, OutboundReceiver)> {
        let ctx = self.validator.validate(token).await?;

        let member = self
            .membership
            .member(&ctx.workspace, &ctx.user)
            .ok_or_else(|| {
                CollabError::permission_denied(format!(
                    "User {} is not a member of workspace {}",
                    ctx.user, ctx.workspace
                ))
            })?;
        if !member.is_active() {
            return Err(CollabError::access_revoked(&ctx.workspace));
        }

        let session = SessionId::new();
        self.activity
            .append(
                ActivityRecord::new(
                    ctx.workspace.clone(),
                    ctx.user.clone(),
                    ActivityAction::SessionConnected,
                )
                .with_session(session),
            )
            .await?;

        let (queue, receiver) = channel(
            self.config.event_queue_capacity,
            self.config.presence_queue_capacity,
        );
        self.broadcaster.register(session, queue);
        self.presence
            .connect(session, ctx.user.clone(), ctx.workspace.clone());
        let info = self.presence.mark_ready(session)?;

        let snapshot = self.initial_data(session, &ctx).await?;
        self.broadcaster.send_to(session, snapshot.to_frame()?);
        self.broadcast_presence(&ctx.workspace, &ctx.user, info, Some(session));

        info!(session = %session, user = %ctx.user, workspace = %ctx.workspace,
            "Realtime session established");
        Ok((session, ctx, receiver))
    }

    /// Tear a session down: force-release its locks, notify collaborators,
    /// and drop it from every registry.
    pub async fn disconnect(&self, session: SessionId) {
        let Some(record) = self.presence.disconnect(session) else {
            return;
        };

        for lease in self.locks.release_session(session) {
            self.broadcast_unlock(&lease).await;
        }
        for resource in self.broadcaster.subscriptions_of(session) {
            self.cursors.forget(&(session, resource.id.clone()));
        }
        self.broadcaster.deregister(session);

        let left = ServerMessage::PresenceLeft {
            user_id: record.user.clone(),
            session_id: session,
        };
        self.broadcast_to_workspace(&record.workspace, &left, None);

        // Nothing to roll back once the socket is gone; a failed append
        // here is logged, not surfaced.
        let audit = ActivityRecord::new(
            record.workspace.clone(),
            record.user.clone(),
            ActivityAction::SessionDisconnected,
        )
        .with_session(session);
        if let Err(err) = self.activity.append(audit).await {
            error!(session = %session, error = %err, "Failed to audit disconnect");
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ───────────────────────────────────────────────────────────────────────────

    /// Handle one client message. Errors are surfaced to the sender as an
    /// `error` frame by the connection handler; they never tear down the
    /// connection except for `AccessRevoked`.
    pub async fn handle_message(
        &self,
        session: SessionId,
        ctx: &AuthContext,
        message: ClientMessage,
    ) -> Result<()> {
        // A frame can race the heartbeat sweep; once the session is reaped
        // the connection must re-establish rather than limp along.
        if self.presence.session(session).is_none() {
            return Err(CollabError::session_expired(session));
        }
        match message {
            ClientMessage::Heartbeat => {
                self.presence.heartbeat(session)?;
                self.broadcaster
                    .send_to_droppable(session, ServerMessage::Pong.to_frame()?);
                Ok(())
            }
            ClientMessage::PresenceUpdate {
                status,
                current_resource,
                resource_type,
                since_sequence,
            } => {
                self.presence.heartbeat(session)?;
                let info = self.presence.set_state(session, status)?;
                if let (Some(id), Some(kind)) = (current_resource, resource_type) {
                    self.focus_resource(session, ctx, ResourceRef::new(kind, id), since_sequence)
                        .await?;
                } else {
                    self.presence.set_focus(session, None)?;
                }
                let info = self.presence.session(session).map(|s| PresenceInfo::from(&s)).unwrap_or(info);
                self.broadcast_presence(&ctx.workspace, &ctx.user, info, Some(session));
                Ok(())
            }
            ClientMessage::CursorUpdate {
                resource_id,
                position,
                selection,
            } => {
                self.touch(session)?;
                let resource = self.resolve_resource(ctx, &resource_id)?;
                self.resolver
                    .enforce(&ctx.user, &ctx.workspace, &resource, Capability::Read)?;

                let update = ServerMessage::CursorUpdate {
                    resource_id: resource_id.clone(),
                    user_id: ctx.user.clone(),
                    position,
                    selection,
                };
                match self.cursors.offer((session, resource_id), update) {
                    Offer::Emit(msg) => {
                        self.broadcaster.broadcast_ephemeral(
                            &resource,
                            msg.to_frame()?,
                            Some(session),
                        );
                    }
                    Offer::Held => {}
                }
                Ok(())
            }
            ClientMessage::TypingIndicator {
                resource_id,
                is_typing,
            } => {
                self.touch(session)?;
                let resource = self.resolve_resource(ctx, &resource_id)?;
                self.resolver
                    .enforce(&ctx.user, &ctx.workspace, &resource, Capability::Read)?;
                let msg = ServerMessage::TypingIndicator {
                    resource_id,
                    user_id: ctx.user.clone(),
                    is_typing,
                };
                self.broadcaster
                    .broadcast_ephemeral(&resource, msg.to_frame()?, Some(session));
                Ok(())
            }
            ClientMessage::ResourceLock { resource_id } => {
                self.touch(session)?;
                self.lock_resource(session, ctx, &resource_id).await
            }
            ClientMessage::ResourceUnlock { resource_id } => {
                self.touch(session)?;
                self.unlock_resource(session, ctx, &resource_id).await
            }
            ClientMessage::CollaborationEvent {
                event_type,
                resource_type,
                resource_id,
                event_data,
            } => {
                self.touch(session)?;
                self.publish_event(
                    session,
                    ctx,
                    ResourceRef::new(resource_type, resource_id),
                    event_type,
                    event_data,
                )
                .await
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Operations
    // ───────────────────────────────────────────────────────────────────────────

    async fn focus_resource(
        &self,
        session: SessionId,
        ctx: &AuthContext,
        resource: ResourceRef,
        since: Option<u64>,
    ) -> Result<()> {
        self.resolver
            .enforce(&ctx.user, &ctx.workspace, &resource, Capability::Read)?;
        self.presence.set_focus(session, Some(resource.clone()))?;

        let sub = self.broadcaster.subscribe(session, &resource, since)?;
        if sub.resync_required {
            let notice = CollabError::validation(format!(
                "Replay window exceeded for {}; refetch the resource",
                resource
            ));
            self.broadcaster
                .send_to(session, ServerMessage::error(&notice).to_frame()?);
        }
        for event in sub.replay {
            self.broadcaster
                .send_to(session, event_frame(&event)?);
        }
        Ok(())
    }

    async fn lock_resource(
        &self,
        session: SessionId,
        ctx: &AuthContext,
        resource_id: &str,
    ) -> Result<()> {
        let resource = self.resolve_resource(ctx, resource_id)?;
        self.resolver
            .enforce(&ctx.user, &ctx.workspace, &resource, Capability::Write)?;

        let lease = match self.locks.acquire(&resource, session, &ctx.user) {
            Ok(lease) => lease,
            Err(err) if err.code() == ErrorCode::LockConflict => {
                let holder = self
                    .locks
                    .holder(&resource)
                    .map(|l| l.holder_user)
                    .unwrap_or_else(|| UserId::new("unknown"));
                let denied = ServerMessage::ResourceLockDenied {
                    resource_id: resource_id.to_string(),
                    holder,
                };
                self.broadcaster.send_to(session, denied.to_frame()?);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // Audit after the grant; if the append fails the lock is rolled
        // back and the caller sees the failure.
        let audit = ActivityRecord::new(
            ctx.workspace.clone(),
            ctx.user.clone(),
            ActivityAction::LockAcquired,
        )
        .with_session(session)
        .with_resource(resource.clone());
        if let Err(err) = self.activity.append(audit).await {
            self.locks.release(&resource, session);
            return Err(err);
        }

        // Direct reply carries the token; the broadcast does not.
        let granted = ServerMessage::ResourceLocked {
            resource_id: resource_id.to_string(),
            locked_by: ctx.user.clone(),
            user_name: ctx.user.to_string(),
            lease_token: Some(lease.token),
            lease_seconds: Some(lease.lease.as_secs()),
        };
        self.broadcaster.send_to(session, granted.to_frame()?);

        let notice = ServerMessage::ResourceLocked {
            resource_id: resource_id.to_string(),
            locked_by: ctx.user.clone(),
            user_name: ctx.user.to_string(),
            lease_token: None,
            lease_seconds: None,
        };
        self.broadcast_guaranteed(&ctx.workspace, &notice, Some(session))
            .await;
        Ok(())
    }

    async fn unlock_resource(
        &self,
        session: SessionId,
        ctx: &AuthContext,
        resource_id: &str,
    ) -> Result<()> {
        let resource = self.resolve_resource(ctx, resource_id)?;

        // Only audit a release that will actually happen.
        let holds = self
            .locks
            .holder(&resource)
            .map(|l| l.holder_session == session)
            .unwrap_or(false);
        if !holds {
            debug!(session = %session, resource = %resource, "Unlock of unheld lock ignored");
            return Ok(());
        }

        let audit = ActivityRecord::new(
            ctx.workspace.clone(),
            ctx.user.clone(),
            ActivityAction::LockReleased,
        )
        .with_session(session)
        .with_resource(resource.clone());
        self.activity.append(audit).await?;

        if self.locks.release(&resource, session) {
            let msg = ServerMessage::ResourceUnlocked {
                resource_id: resource_id.to_string(),
            };
            self.broadcast_guaranteed(&ctx.workspace, &msg, None).await;
        }
        Ok(())
    }

    async fn publish_event(
        &self,
        session: SessionId,
        ctx: &AuthContext,
        resource: ResourceRef,
        event_type: String,
        event_data: serde_json::Value,
    ) -> Result<()> {
        self.resolver
            .enforce(&ctx.user, &ctx.workspace, &resource, Capability::Write)?;

        let draft = SequencedEvent {
            resource,
            sequence: 0,
            event_type,
            actor: ctx.user.clone(),
            session,
            payload: event_data,
            published_at: chrono::Utc::now(),
        };
        let published = self
            .broadcaster
            .publish(&ctx.workspace, draft, event_frame)
            .await?;

        // A subscriber that cannot absorb state events is torn down; it
        // would otherwise silently diverge from the stream.
        self.disconnect_saturated(published.saturated).await;
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ───────────────────────────────────────────────────────────────────────────

    /// One pass of the presence clock and lease reaper. The server runs
    /// this on the heartbeat interval.
    pub async fn sweep(&self) {
        let outcome = self.presence.sweep();
        for info in outcome.demoted {
            if let Some(session) = self.presence.session(info.session_id) {
                self.broadcast_presence(&session.workspace, &session.user, info, None);
            }
        }
        for session in outcome.timed_out {
            debug!(session = %session.id, "Reaping timed-out session");
            self.finish_reap(session).await;
        }

        for lease in self.locks.reclaim_expired() {
            // No originator to fail, so the reclaim audit is best-effort,
            // like the disconnect audit.
            if let Some(meta) = self.grants.resource(&lease.resource) {
                let audit = ActivityRecord::new(
                    meta.workspace.clone(),
                    lease.holder_user.clone(),
                    ActivityAction::LockReclaimed,
                )
                .with_session(lease.holder_session)
                .with_resource(lease.resource.clone());
                if let Err(err) = self.activity.append(audit).await {
                    error!(resource = %lease.resource, error = %err, "Failed to audit reclaimed lock");
                }
            }
            self.broadcast_unlock(&lease).await;
        }
    }

    /// Emit trailing coalesced cursor updates whose window has closed.
    pub fn flush_cursors(&self) {
        for ((session, resource_id), msg) in self.cursors.drain_due() {
            let Some(record) = self.presence.session(session) else {
                continue;
            };
            let Ok(resource) = self.resolve_resource(
                &AuthContext {
                    user: record.user,
                    workspace: record.workspace,
                },
                &resource_id,
            ) else {
                continue;
            };
            if let Ok(frame) = msg.to_frame() {
                self.broadcaster
                    .broadcast_ephemeral(&resource, frame, Some(session));
            }
        }
    }

    async fn finish_reap(&self, session: crate::presence::Session) {
        for lease in self.locks.release_session(session.id) {
            self.broadcast_unlock(&lease).await;
        }
        self.broadcaster.deregister(session.id);
        let left = ServerMessage::PresenceLeft {
            user_id: session.user.clone(),
            session_id: session.id,
        };
        self.broadcast_to_workspace(&session.workspace, &left, None);

        let audit = ActivityRecord::new(
            session.workspace.clone(),
            session.user.clone(),
            ActivityAction::SessionDisconnected,
        )
        .with_session(session.id)
        .with_detail(serde_json::json!({ "reason": "heartbeat_timeout" }));
        if let Err(err) = self.activity.append(audit).await {
            error!(session = %session.id, error = %err, "Failed to audit reaped session");
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Helpers
    // ───────────────────────────────────────────────────────────────────────────

    /// Best-effort error frame to one session's guaranteed lane.
    pub fn send_error(&self, session: SessionId, err: &CollabError) {
        if let Ok(frame) = ServerMessage::error(err).to_frame() {
            self.broadcaster.send_to(session, frame);
        }
    }

    pub fn stats(&self) -> CollabStats {
        CollabStats {
            sessions: self.presence.session_count(),
            locks: self.locks.stats(),
            broadcast: self.broadcaster.stats(),
            permission_cache: self.cache.stats(),
        }
    }

    /// Map a bare resource id from the wire to a registered resource in
    /// the caller's workspace.
    fn resolve_resource(&self, ctx: &AuthContext, resource_id: &str) -> Result<ResourceRef> {
        self.grants
            .resources_in(&ctx.workspace)
            .into_iter()
            .map(|meta| meta.resource)
            .find(|r| r.id == resource_id)
            .ok_or_else(|| CollabError::not_found(ErrorCode::ResourceNotFound, resource_id))
    }

    fn touch(&self, session: SessionId) -> Result<()> {
        if let Some(info) = self.presence.record_activity(session)? {
            if let Some(record) = self.presence.session(session) {
                self.broadcast_presence(&record.workspace, &record.user, info, Some(session));
            }
        }
        Ok(())
    }

    async fn initial_data(&self, session: SessionId, ctx: &AuthContext) -> Result<ServerMessage> {
        let presence = self.presence.snapshot(&ctx.workspace);
        let active_collaborators: Vec<UserId> = presence
            .iter()
            .map(|p| p.user_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let recent_activity = self.activity.recent(&ctx.workspace, 50).await?;

        // High-water marks are captured after registration, so any event
        // sequenced from here on reaches this session's queue and replay
        // from these marks is gap-free.
        let mut high_water_sequence = HashMap::new();
        for meta in self.grants.resources_in(&ctx.workspace) {
            let hw = self.broadcaster.high_water(&meta.resource);
            if hw > 0 {
                high_water_sequence.insert(meta.resource.to_string(), hw);
            }
        }

        Ok(ServerMessage::InitialData {
            your_session: session,
            presence,
            recent_activity,
            active_collaborators,
            high_water_sequence,
        })
    }

    fn broadcast_presence(
        &self,
        workspace: &WorkspaceId,
        user: &UserId,
        info: PresenceInfo,
        exclude: Option<SessionId>,
    ) {
        let msg = ServerMessage::PresenceUpdate {
            user_id: user.clone(),
            presence: info,
        };
        self.broadcast_to_workspace(workspace, &msg, exclude);
    }

    /// Presence notices go to every session in the workspace on the
    /// droppable lane.
    fn broadcast_to_workspace(
        &self,
        workspace: &WorkspaceId,
        msg: &ServerMessage,
        exclude: Option<SessionId>,
    ) {
        let Ok(frame) = msg.to_frame() else {
            return;
        };
        for session in self.presence.sessions_in(workspace) {
            if Some(session) == exclude {
                continue;
            }
            if self.broadcaster.send_to_droppable(session, frame.clone()) == SendOutcome::Closed {
                debug!(session = %session, "Skipping frame for closed queue");
            }
        }
    }

    /// Lock notices ride the guaranteed lane. A subscriber whose lane is
    /// full has permanently missed a state change and is torn down, same
    /// as a saturated event subscriber.
    async fn broadcast_guaranteed(
        &self,
        workspace: &WorkspaceId,
        msg: &ServerMessage,
        exclude: Option<SessionId>,
    ) {
        let Ok(frame) = msg.to_frame() else {
            return;
        };
        let mut saturated = Vec::new();
        for session in self.presence.sessions_in(workspace) {
            if Some(session) == exclude {
                continue;
            }
            match self.broadcaster.send_to(session, frame.clone()) {
                SendOutcome::Saturated => saturated.push(session),
                SendOutcome::Closed => {
                    debug!(session = %session, "Skipping frame for closed queue");
                }
                _ => {}
            }
        }
        self.disconnect_saturated(saturated).await;
    }

    /// Tear down sessions whose guaranteed lane overflowed. Boxed because
    /// teardown itself broadcasts unlocks, which can saturate further
    /// subscribers.
    fn disconnect_saturated(&self, sessions: Vec<SessionId>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for slow in sessions {
                warn!(session = %slow, "Disconnecting saturated subscriber");
                let err = CollabError::new(
                    ErrorCode::Disconnected,
                    "Disconnected: outbound queue overflowed",
                );
                if let Ok(frame) = ServerMessage::error(&err).to_frame() {
                    self.broadcaster.send_to_droppable(slow, frame);
                }
                self.disconnect(slow).await;
            }
        })
    }

    async fn broadcast_unlock(&self, lease: &Lease) {
        // Locks live inside one workspace; resolve it via the resource.
        if let Some(meta) = self.grants.resource(&lease.resource) {
            let msg = ServerMessage::ResourceUnlocked {
                resource_id: lease.resource.id.clone(),
            };
            self.broadcast_guaranteed(&meta.workspace, &msg, None).await;
        }
    }
}

fn event_frame(event: &SequencedEvent) -> Result<crate::events::Frame> {
    ServerMessage::CollaborationEvent {
        event_type: event.event_type.clone(),
        resource_id: event.resource.id.clone(),
        user_id: event.actor.clone(),
        event_data: event.payload.clone(),
        sequence: event.sequence,
    }
    .to_frame()
}
