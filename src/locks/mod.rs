//! Lease-based exclusive resource locks.
//!
//! A lock is a short, renewable lease rather than an indefinite hold, so a
//! crashed or partitioned editor can never wedge a resource for longer than
//! one lease period. Callers renew while actively editing; anyone else may
//! reclaim the moment the lease lapses.
//!
//! Authorization is the caller's job: this module only arbitrates who holds
//! what, it never consults permissions.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::workspace::models::{ResourceRef, SessionId, UserId};

// ═══════════════════════════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque proof of lock ownership. Renew and release must present it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A granted lease, as returned to the acquiring session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource: ResourceRef,
    pub token: LeaseToken,
    pub holder_session: SessionId,
    pub holder_user: UserId,
    pub acquired_at: DateTime<Utc>,
    pub lease: Duration,
}

#[derive(Debug)]
struct LockEntry {
    token: LeaseToken,
    holder_session: SessionId,
    holder_user: UserId,
    acquired_at: DateTime<Utc>,
    lease: Duration,
    deadline: Instant,
}

impl LockEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    fn to_lease(&self, resource: &ResourceRef) -> Lease {
        Lease {
            resource: resource.clone(),
            token: self.token,
            holder_session: self.holder_session,
            holder_user: self.holder_user.clone(),
            acquired_at: self.acquired_at,
            lease: self.lease,
        }
    }
}

/// Counters for the lock table.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LockStats {
    pub acquired: u64,
    pub released: u64,
    pub conflicts: u64,
    pub expired_reclaimed: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Manager
// ═══════════════════════════════════════════════════════════════════════════════

/// Exclusive lock table keyed by resource.
pub struct LockManager {
    locks: DashMap<ResourceRef, LockEntry>,
    default_lease: Duration,
    acquired: AtomicU64,
    released: AtomicU64,
    conflicts: AtomicU64,
    expired_reclaimed: AtomicU64,
}

impl LockManager {
    pub fn new(default_lease: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            default_lease,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            expired_reclaimed: AtomicU64::new(0),
        }
    }

    pub fn default_lease(&self) -> Duration {
        self.default_lease
    }

    /// Try to take the lock. Exactly one contender wins a race; losers get
    /// a `LockConflict` naming the current holder.
    ///
    /// Re-acquiring a lock the session already holds renews it in place and
    /// returns the existing token.
    pub fn acquire(
        &self,
        resource: &ResourceRef,
        session: SessionId,
        user: &UserId,
    ) -> Result<Lease> {
        let now = Instant::now();

        // The entry API holds the shard lock across the check-then-set, so
        // two concurrent acquires serialize here.
        match self.locks.entry(resource.clone()) {
            Entry::Vacant(slot) => {
                let entry = self.fresh_entry(session, user, now);
                let lease = entry.to_lease(resource);
                slot.insert(entry);
                self.acquired.fetch_add(1, Ordering::Relaxed);
                counter!("huddle_locks_total", "outcome" => "acquired").increment(1);
                info!(resource = %resource, session = %session, "Lock acquired");
                Ok(lease)
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.holder_session == session {
                    // Idempotent re-acquire renews the lease.
                    let entry = slot.get_mut();
                    entry.deadline = now + entry.lease;
                    return Ok(entry.to_lease(resource));
                }
                if current.is_expired(now) {
                    self.expired_reclaimed.fetch_add(1, Ordering::Relaxed);
                    counter!("huddle_locks_total", "outcome" => "reclaimed").increment(1);
                    debug!(resource = %resource, previous = %current.holder_session,
                        "Expired lock reclaimed");
                    let entry = self.fresh_entry(session, user, now);
                    let lease = entry.to_lease(resource);
                    slot.insert(entry);
                    self.acquired.fetch_add(1, Ordering::Relaxed);
                    return Ok(lease);
                }
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                counter!("huddle_locks_total", "outcome" => "conflict").increment(1);
                Err(CollabError::lock_conflict(resource, &current.holder_user))
            }
        }
    }

    /// Extend a held lease. The presented token must match the live lock
    /// and the caller must be the holding session; a lapsed or superseded
    /// token gets `StaleLock`.
    pub fn renew(
        &self,
        resource: &ResourceRef,
        session: SessionId,
        token: LeaseToken,
    ) -> Result<Lease> {
        let now = Instant::now();
        let mut entry = self
            .locks
            .get_mut(resource)
            .ok_or_else(|| CollabError::stale_lock(resource))?;

        if entry.holder_session != session || entry.token != token || entry.is_expired(now) {
            return Err(CollabError::stale_lock(resource));
        }

        entry.deadline = now + entry.lease;
        Ok(entry.to_lease(resource))
    }

    /// Release a lock held by this session. Releasing a lock the session
    /// does not hold (already released, expired and reclaimed, never held)
    /// is a no-op rather than an error.
    pub fn release(&self, resource: &ResourceRef, session: SessionId) -> bool {
        let removed = self
            .locks
            .remove_if(resource, |_, entry| entry.holder_session == session)
            .is_some();
        if removed {
            self.released.fetch_add(1, Ordering::Relaxed);
            counter!("huddle_locks_total", "outcome" => "released").increment(1);
            debug!(resource = %resource, session = %session, "Lock released");
        }
        removed
    }

    /// Drop every lock the session holds. Called on disconnect so other
    /// collaborators are unblocked immediately rather than waiting out the
    /// lease. Returns the released leases for broadcast.
    pub fn release_session(&self, session: SessionId) -> Vec<Lease> {
        let held: Vec<ResourceRef> = self
            .locks
            .iter()
            .filter(|entry| entry.value().holder_session == session)
            .map(|entry| entry.key().clone())
            .collect();

        let mut released = Vec::with_capacity(held.len());
        for resource in held {
            if let Some((resource, entry)) =
                self.locks.remove_if(&resource, |_, e| e.holder_session == session)
            {
                released.push(entry.to_lease(&resource));
            }
        }

        if !released.is_empty() {
            self.released
                .fetch_add(released.len() as u64, Ordering::Relaxed);
            info!(session = %session, count = released.len(), "Session locks force-released");
        }
        released
    }

    /// Sweep out expired leases. Returns them so the caller can broadcast
    /// the unlocks. Run periodically; acquire also reclaims lazily, so the
    /// sweep only matters for observers who never try to acquire.
    pub fn reclaim_expired(&self) -> Vec<Lease> {
        let now = Instant::now();
        let expired: Vec<ResourceRef> = self
            .locks
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for resource in expired {
            if let Some((resource, entry)) =
                self.locks.remove_if(&resource, |_, e| e.is_expired(now))
            {
                reclaimed.push(entry.to_lease(&resource));
            }
        }

        if !reclaimed.is_empty() {
            self.expired_reclaimed
                .fetch_add(reclaimed.len() as u64, Ordering::Relaxed);
            counter!("huddle_locks_total", "outcome" => "reclaimed")
                .increment(reclaimed.len() as u64);
            debug!(count = reclaimed.len(), "Expired locks reclaimed");
        }
        reclaimed
    }

    /// The live holder of a resource, if any. Expired entries are reported
    /// as unheld.
    pub fn holder(&self, resource: &ResourceRef) -> Option<Lease> {
        let now = Instant::now();
        self.locks.get(resource).and_then(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(entry.to_lease(resource))
            }
        })
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            expired_reclaimed: self.expired_reclaimed.load(Ordering::Relaxed),
        }
    }

    fn fresh_entry(&self, session: SessionId, user: &UserId, now: Instant) -> LockEntry {
        LockEntry {
            token: LeaseToken::generate(),
            holder_session: session,
            holder_user: user.clone(),
            acquired_at: Utc::now(),
            lease: self.default_lease,
            deadline: now + self.default_lease,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
