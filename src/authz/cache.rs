//! Explicit permission cache keyed by (user, workspace).
//!
//! Caches the resolved role + override snapshot so repeated checks on a hot
//! connection don't re-walk the membership tables. The cache is an injected
//! collaborator: every membership or role write calls back into it
//! synchronously, before the write returns. Stale-allow after a revoke is a
//! correctness bug, so invalidation always wins over hit rate.
//!
//! Publication is generation-checked. A loader captures a [`LoadToken`]
//! before reading the member row; `put_if_current` discards the snapshot if
//! any invalidation for that key or workspace landed in between. Without
//! this, a write racing a cache miss could invalidate an entry that is not
//! there yet and the miss would then publish the pre-write snapshot.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::workspace::models::{Member, Role, UserId, WorkspaceId};

/// The resolved membership snapshot for one (user, workspace) pair.
#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub member: Member,
    pub role: Role,
}

/// Invalidation generations observed at the start of a snapshot load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadToken {
    key_generation: u64,
    workspace_generation: u64,
}

#[derive(Debug)]
struct CacheEntry {
    snapshot: Arc<MemberSnapshot>,
    loaded_at: LoadToken,
}

/// Thread-safe cache of member snapshots.
#[derive(Debug, Default)]
pub struct PermissionCache {
    entries: DashMap<(UserId, WorkspaceId), CacheEntry>,
    /// Bumped by `invalidate`, per member.
    key_generations: DashMap<(UserId, WorkspaceId), u64>,
    /// Bumped by `invalidate_workspace`, which cannot know which member
    /// loads are in flight.
    workspace_generations: DashMap<WorkspaceId, u64>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user: &UserId, workspace: &WorkspaceId) -> Option<Arc<MemberSnapshot>> {
        let key = (user.clone(), workspace.clone());
        match self.entries.get(&key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.snapshot.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Capture the current invalidation generations for a key. Must be
    /// called before the membership read whose result will be published.
    pub fn load_token(&self, user: &UserId, workspace: &WorkspaceId) -> LoadToken {
        let key = (user.clone(), workspace.clone());
        LoadToken {
            key_generation: self.key_generations.get(&key).map(|g| *g).unwrap_or(0),
            workspace_generation: self
                .workspace_generations
                .get(workspace)
                .map(|g| *g)
                .unwrap_or(0),
        }
    }

    /// Publish a snapshot loaded under `token`. Returns `false` and leaves
    /// nothing behind if an invalidation landed since the token was taken.
    pub fn put_if_current(&self, token: LoadToken, snapshot: Arc<MemberSnapshot>) -> bool {
        let key = (
            snapshot.member.user.clone(),
            snapshot.member.workspace.clone(),
        );
        self.entries.insert(
            key.clone(),
            CacheEntry {
                snapshot,
                loaded_at: token,
            },
        );

        // Invalidation bumps the generation before removing, so whichever
        // way the race went, one of the two removals below observes the
        // conflict: either the invalidator removed our entry, or this
        // re-check does.
        if self.load_token(&key.0, &key.1) != token {
            self.entries.remove_if(&key, |_, entry| entry.loaded_at == token);
            return false;
        }
        true
    }

    /// Drop the cached snapshot for one member. Called synchronously by
    /// every membership write for that user.
    pub fn invalidate(&self, user: &UserId, workspace: &WorkspaceId) {
        let key = (user.clone(), workspace.clone());
        self.key_generations
            .entry(key.clone())
            .and_modify(|g| *g += 1)
            .or_insert(1);
        if self.entries.remove(&key).is_some() {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(user = %user, workspace = %workspace, "Permission cache entry invalidated");
        }
    }

    /// Drop every snapshot in a workspace. Called by role writes, which can
    /// affect any member holding that role.
    pub fn invalidate_workspace(&self, workspace: &WorkspaceId) {
        self.workspace_generations
            .entry(workspace.clone())
            .and_modify(|g| *g += 1)
            .or_insert(1);

        let mut dropped: u64 = 0;
        self.entries.retain(|(_, ws), _| {
            if ws == workspace {
                dropped += 1;
                false
            } else {
                true
            }
        });
        if dropped > 0 {
            self.invalidations.fetch_add(dropped, Ordering::Relaxed);
            debug!(workspace = %workspace, dropped, "Permission cache workspace invalidated");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache health.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::models::SystemRole;

    fn snapshot(user: &str, ws: &str) -> Arc<MemberSnapshot> {
        Arc::new(MemberSnapshot {
            member: Member::new(WorkspaceId::new(ws), UserId::new(user), "viewer"),
            role: SystemRole::Viewer.to_role(),
        })
    }

    fn put(cache: &PermissionCache, user: &str, ws: &str) {
        let token = cache.load_token(&UserId::new(user), &WorkspaceId::new(ws));
        assert!(cache.put_if_current(token, snapshot(user, ws)));
    }

    #[test]
    fn test_put_get_invalidate() {
        let cache = PermissionCache::new();
        put(&cache, "alice", "w1");

        let user = UserId::new("alice");
        let ws = WorkspaceId::new("w1");
        assert!(cache.get(&user, &ws).is_some());

        cache.invalidate(&user, &ws);
        assert!(cache.get(&user, &ws).is_none());
    }

    #[test]
    fn test_workspace_invalidation_is_scoped() {
        let cache = PermissionCache::new();
        put(&cache, "alice", "w1");
        put(&cache, "bob", "w1");
        put(&cache, "alice", "w2");

        cache.invalidate_workspace(&WorkspaceId::new("w1"));

        assert!(cache.get(&UserId::new("alice"), &WorkspaceId::new("w1")).is_none());
        assert!(cache.get(&UserId::new("bob"), &WorkspaceId::new("w1")).is_none());
        assert!(cache.get(&UserId::new("alice"), &WorkspaceId::new("w2")).is_some());
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = PermissionCache::new();
        put(&cache, "alice", "w1");

        let user = UserId::new("alice");
        let ws = WorkspaceId::new("w1");
        cache.get(&user, &ws);
        cache.get(&UserId::new("nobody"), &ws);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_invalidation_beats_late_publish() {
        let cache = PermissionCache::new();
        let user = UserId::new("alice");
        let ws = WorkspaceId::new("w1");

        // Write lands between the member read and the publish.
        let token = cache.load_token(&user, &ws);
        cache.invalidate(&user, &ws);

        assert!(!cache.put_if_current(token, snapshot("alice", "w1")));
        assert!(cache.get(&user, &ws).is_none());
    }

    #[test]
    fn test_workspace_invalidation_beats_late_publish() {
        let cache = PermissionCache::new();
        let user = UserId::new("alice");
        let ws = WorkspaceId::new("w1");

        let token = cache.load_token(&user, &ws);
        cache.invalidate_workspace(&ws);

        assert!(!cache.put_if_current(token, snapshot("alice", "w1")));
        assert!(cache.get(&user, &ws).is_none());
    }

    #[test]
    fn test_token_taken_after_invalidation_publishes() {
        let cache = PermissionCache::new();
        let user = UserId::new("alice");
        let ws = WorkspaceId::new("w1");

        cache.invalidate(&user, &ws);
        let token = cache.load_token(&user, &ws);

        assert!(cache.put_if_current(token, snapshot("alice", "w1")));
        assert!(cache.get(&user, &ws).is_some());
    }
}
