//! Session registry and presence state machine.
//!
//! Every connection owns exactly one session. The state machine is
//!
//! ```text
//! connecting -> active <-> idle -> away -> disconnected
//! ```
//!
//! Client activity promotes back to active from idle or away; the periodic
//! sweep demotes on inactivity and declares a session dead once it has
//! missed enough heartbeats. Heartbeats keep the connection alive but do
//! not count as user activity, so a tab left open drifts to idle and away
//! while still heartbeating.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::gauge;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{CollabError, ErrorCode, Result};
use crate::workspace::models::{ResourceRef, SessionId, UserId, WorkspaceId};

// ═══════════════════════════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Connecting,
    Active,
    Idle,
    Away,
    Disconnected,
}

impl std::fmt::Display for PresenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Away => "away",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// One live session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user: UserId,
    pub workspace: WorkspaceId,
    pub state: PresenceState,
    /// The resource the user currently has open, if any.
    pub focus: Option<ResourceRef>,
    pub connected_at: DateTime<Utc>,
    last_heartbeat: Instant,
    last_activity: Instant,
}

/// Wire-facing view of a session, used in snapshots and broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PresenceInfo {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub state: PresenceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<ResourceRef>,
}

impl From<&Session> for PresenceInfo {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id,
            user_id: s.user.clone(),
            state: s.state,
            focus: s.focus.clone(),
        }
    }
}

/// Output of a sweep pass.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Sessions whose state changed, for broadcast.
    pub demoted: Vec<PresenceInfo>,
    /// Sessions that missed too many heartbeats. The caller tears down
    /// their connections; the tracker has already dropped them.
    pub timed_out: Vec<Session>,
}

/// Inactivity thresholds, taken from the realtime config.
#[derive(Debug, Clone, Copy)]
pub struct PresenceThresholds {
    pub idle_after: Duration,
    pub away_after: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
}

impl PresenceThresholds {
    fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval * self.max_missed_heartbeats
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tracker
// ═══════════════════════════════════════════════════════════════════════════════

/// Registry of live sessions, keyed by session id with a per-workspace view.
pub struct PresenceTracker {
    sessions: DashMap<SessionId, Session>,
    thresholds: PresenceThresholds,
}

impl PresenceTracker {
    pub fn new(thresholds: PresenceThresholds) -> Self {
        Self {
            sessions: DashMap::new(),
            thresholds,
        }
    }

    /// Register a new session in `connecting` state. It stays there until
    /// the handshake completes and [`mark_ready`] runs.
    pub fn connect(&self, id: SessionId, user: UserId, workspace: WorkspaceId) -> Session {
        let now = Instant::now();
        let session = Session {
            id,
            user,
            workspace,
            state: PresenceState::Connecting,
            focus: None,
            connected_at: Utc::now(),
            last_heartbeat: now,
            last_activity: now,
        };
        self.sessions.insert(id, session.clone());
        self.publish_gauge();
        info!(session = %id, user = %session.user, workspace = %session.workspace,
            "Session connected");
        session
    }

    /// Handshake complete: connecting becomes active.
    pub fn mark_ready(&self, id: SessionId) -> Result<PresenceInfo> {
        self.with_session(id, |s| {
            if s.state == PresenceState::Connecting {
                s.state = PresenceState::Active;
            }
            PresenceInfo::from(&*s)
        })
    }

    /// Record a heartbeat. Keeps the session alive without promoting it.
    pub fn heartbeat(&self, id: SessionId) -> Result<()> {
        self.with_session(id, |s| {
            s.last_heartbeat = Instant::now();
        })
    }

    /// Record user activity. Idle and away sessions come back to active;
    /// returns the new info when the state changed so the caller can
    /// broadcast it.
    pub fn record_activity(&self, id: SessionId) -> Result<Option<PresenceInfo>> {
        self.with_session(id, |s| {
            let now = Instant::now();
            s.last_activity = now;
            s.last_heartbeat = now;
            match s.state {
                PresenceState::Idle | PresenceState::Away => {
                    s.state = PresenceState::Active;
                    Some(PresenceInfo::from(&*s))
                }
                _ => None,
            }
        })
    }

    /// Explicit state from the client (e.g. the tab reporting `away`).
    /// Counts as activity only when the client reports itself active.
    pub fn set_state(&self, id: SessionId, state: PresenceState) -> Result<PresenceInfo> {
        if state == PresenceState::Connecting || state == PresenceState::Disconnected {
            return Err(CollabError::validation(format!(
                "Client may not set presence state '{}'",
                state
            )));
        }
        self.with_session(id, |s| {
            s.state = state;
            if state == PresenceState::Active {
                s.last_activity = Instant::now();
            }
            PresenceInfo::from(&*s)
        })
    }

    /// Update which resource the session has open.
    pub fn set_focus(&self, id: SessionId, focus: Option<ResourceRef>) -> Result<PresenceInfo> {
        self.with_session(id, |s| {
            s.focus = focus;
            PresenceInfo::from(&*s)
        })
    }

    /// Remove the session. Returns it so the caller can release its locks
    /// and broadcast the departure.
    pub fn disconnect(&self, id: SessionId) -> Option<Session> {
        let removed = self.sessions.remove(&id).map(|(_, mut s)| {
            s.state = PresenceState::Disconnected;
            s
        });
        if removed.is_some() {
            self.publish_gauge();
            info!(session = %id, "Session disconnected");
        }
        removed
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Presence of every live session in a workspace, for `initial_data`
    /// and presence broadcasts.
    pub fn snapshot(&self, workspace: &WorkspaceId) -> Vec<PresenceInfo> {
        let mut infos: Vec<PresenceInfo> = self
            .sessions
            .iter()
            .filter(|s| s.workspace == *workspace)
            .map(|s| PresenceInfo::from(s.value()))
            .collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    /// Sessions in a workspace, for fanout.
    pub fn sessions_in(&self, workspace: &WorkspaceId) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|s| s.workspace == *workspace)
            .map(|s| s.id)
            .collect()
    }

    /// One pass of the demotion clock. Active sessions idle out, idle
    /// sessions drift away, and sessions past the heartbeat deadline are
    /// dropped entirely.
    pub fn sweep(&self) -> SweepOutcome {
        let now = Instant::now();
        let mut outcome = SweepOutcome::default();
        let mut dead = Vec::new();

        for mut entry in self.sessions.iter_mut() {
            let s = entry.value_mut();
            if now.duration_since(s.last_heartbeat) >= self.thresholds.heartbeat_deadline() {
                dead.push(s.id);
                continue;
            }
            let inactive = now.duration_since(s.last_activity);
            let next = match s.state {
                PresenceState::Active if inactive >= self.thresholds.idle_after => {
                    Some(PresenceState::Idle)
                }
                PresenceState::Idle if inactive >= self.thresholds.away_after => {
                    Some(PresenceState::Away)
                }
                _ => None,
            };
            if let Some(next) = next {
                debug!(session = %s.id, from = %s.state, to = %next, "Presence demoted");
                s.state = next;
                outcome.demoted.push(PresenceInfo::from(&*s));
            }
        }

        for id in dead {
            if let Some(session) = self.disconnect(id) {
                outcome.timed_out.push(session);
            }
        }
        outcome
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn with_session<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Result<T> {
        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| CollabError::not_found(ErrorCode::SessionNotFound, id))?;
        Ok(f(entry.value_mut()))
    }

    fn publish_gauge(&self) {
        gauge!("huddle_sessions_active").set(self.sessions.len() as f64);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
