//! Durable activity log.
//!
//! State-changing operations append here before they take effect; if the
//! append fails the operation fails with `StorageFailure` and is rolled
//! back. Ephemeral traffic (cursor, presence, typing) is never logged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use uuid::Uuid;

use crate::error::Result;
use crate::workspace::models::{ResourceRef, SessionId, UserId, WorkspaceId};

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    SessionConnected,
    SessionDisconnected,
    LockAcquired,
    LockReleased,
    LockReclaimed,
    EventPublished,
}

impl std::fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SessionConnected => "session_connected",
            Self::SessionDisconnected => "session_disconnected",
            Self::LockAcquired => "lock_acquired",
            Self::LockReleased => "lock_released",
            Self::LockReclaimed => "lock_reclaimed",
            Self::EventPublished => "event_published",
        };
        f.write_str(s)
    }
}

/// One audit entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub workspace: WorkspaceId,
    pub actor: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    pub action: ActivityAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(workspace: WorkspaceId, actor: UserId, action: ActivityAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace,
            actor,
            session: None,
            action,
            resource: None,
            detail: serde_json::Value::Null,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_resource(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sink
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination for audit entries. The in-memory implementation backs tests
/// and single-node deployments; a database-backed one slots in behind the
/// same trait.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Persist one record. An `Err` here must abort the operation being
    /// audited.
    async fn append(&self, record: ActivityRecord) -> Result<()>;

    /// Most recent records for a workspace, newest first.
    async fn recent(&self, workspace: &WorkspaceId, limit: usize) -> Result<Vec<ActivityRecord>>;
}

/// In-memory sink, bounded per workspace.
pub struct MemoryActivityLog {
    entries: DashMap<WorkspaceId, Vec<ActivityRecord>>,
    capacity: usize,
}

impl MemoryActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }
}

impl Default for MemoryActivityLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl ActivitySink for MemoryActivityLog {
    async fn append(&self, record: ActivityRecord) -> Result<()> {
        counter!("huddle_activity_appends_total", "action" => record.action.to_string())
            .increment(1);
        let mut log = self.entries.entry(record.workspace.clone()).or_default();
        if log.len() >= self.capacity {
            log.remove(0);
        }
        log.push(record);
        Ok(())
    }

    async fn recent(&self, workspace: &WorkspaceId, limit: usize) -> Result<Vec<ActivityRecord>> {
        Ok(self
            .entries
            .get(workspace)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::error::CollabError;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Sink that can be flipped into a failure mode, for exercising the
    /// durable-or-fail path.
    #[derive(Default)]
    pub struct FlakySink {
        pub inner: MemoryActivityLog,
        pub failing: AtomicBool,
    }

    impl FlakySink {
        pub fn fail(&self, on: bool) {
            self.failing.store(on, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ActivitySink for FlakySink {
        async fn append(&self, record: ActivityRecord) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CollabError::storage_failure("activity log unavailable"));
            }
            self.inner.append(record).await
        }

        async fn recent(
            &self,
            workspace: &WorkspaceId,
            limit: usize,
        ) -> Result<Vec<ActivityRecord>> {
            self.inner.recent(workspace, limit).await
        }
    }
}
