//! Membership store: workspaces, members, role assignments, overrides.
//!
//! Mutations arrive from the trusted CRUD layer and are applied here
//! synchronously before the next permission resolution. Every write that can
//! change a member's effective permissions invalidates the corresponding
//! permission-cache entries before returning.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::authz::cache::PermissionCache;
use crate::error::{CollabError, ErrorCode, Result};
use crate::workspace::models::{
    CapabilityKey, Member, MemberStatus, Role, SystemRole, UserId, Workspace, WorkspaceId,
};

/// Thread-safe store of workspaces, members, and roles.
pub struct MembershipStore {
    workspaces: DashMap<WorkspaceId, Workspace>,
    /// Member rows keyed by the unique (workspace, user) pair.
    members: DashMap<(WorkspaceId, UserId), Member>,
    /// Custom roles, scoped per workspace. System roles are not stored here.
    custom_roles: DashMap<(WorkspaceId, String), Role>,
    /// Injected cache; invalidated synchronously on every write.
    cache: Arc<PermissionCache>,
}

impl MembershipStore {
    pub fn new(cache: Arc<PermissionCache>) -> Self {
        Self {
            workspaces: DashMap::new(),
            members: DashMap::new(),
            custom_roles: DashMap::new(),
            cache,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Workspaces
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a workspace and seed the owner's membership.
    pub fn create_workspace(&self, id: WorkspaceId, owner: UserId) -> Workspace {
        let workspace = Workspace::new(id.clone(), owner.clone());
        self.workspaces.insert(id.clone(), workspace.clone());

        let owner_member = Member::new(id.clone(), owner, SystemRole::Owner.name());
        self.members
            .insert((id.clone(), owner_member.user.clone()), owner_member);

        info!(workspace = %id, "Workspace created");
        workspace
    }

    pub fn workspace(&self, id: &WorkspaceId) -> Option<Workspace> {
        self.workspaces.get(id).map(|w| w.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Members
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace a member row (invitation acceptance, re-invite).
    pub fn upsert_member(&self, member: Member) -> Result<()> {
        if self.workspaces.get(&member.workspace).is_none() {
            return Err(CollabError::not_found(
                ErrorCode::WorkspaceNotFound,
                &member.workspace,
            ));
        }
        if self.role(&member.workspace, &member.role).is_none() {
            return Err(CollabError::configuration(format!(
                "Member references unknown role '{}'",
                member.role
            )));
        }

        let key = (member.workspace.clone(), member.user.clone());
        self.cache.invalidate(&member.user, &member.workspace);
        debug!(workspace = %member.workspace, user = %member.user, role = %member.role, "Member upserted");
        self.members.insert(key, member);
        Ok(())
    }

    pub fn member(&self, workspace: &WorkspaceId, user: &UserId) -> Option<Member> {
        self.members
            .get(&(workspace.clone(), user.clone()))
            .map(|m| m.clone())
    }

    /// Change a member's role.
    pub fn set_member_role(
        &self,
        workspace: &WorkspaceId,
        user: &UserId,
        role: impl Into<String>,
    ) -> Result<()> {
        let role = role.into();
        if self.role(workspace, &role).is_none() {
            return Err(CollabError::configuration(format!("Unknown role '{}'", role)));
        }

        let key = (workspace.clone(), user.clone());
        let mut entry = self
            .members
            .get_mut(&key)
            .ok_or_else(|| CollabError::not_found(ErrorCode::MemberNotFound, user))?;

        entry.role = role;
        drop(entry);

        // Invalidate after the row changes so a racing resolve cannot
        // repopulate the cache with the old role.
        self.cache.invalidate(user, workspace);
        info!(workspace = %workspace, user = %user, "Member role updated");
        Ok(())
    }

    /// Change a member's lifecycle status.
    pub fn set_member_status(
        &self,
        workspace: &WorkspaceId,
        user: &UserId,
        status: MemberStatus,
    ) -> Result<()> {
        let key = (workspace.clone(), user.clone());
        let mut entry = self
            .members
            .get_mut(&key)
            .ok_or_else(|| CollabError::not_found(ErrorCode::MemberNotFound, user))?;

        entry.status = status;
        drop(entry);

        self.cache.invalidate(user, workspace);
        info!(workspace = %workspace, user = %user, status = ?status, "Member status updated");
        Ok(())
    }

    /// Set (or clear, with `None`) a per-member override for one key.
    pub fn set_member_override(
        &self,
        workspace: &WorkspaceId,
        user: &UserId,
        key: CapabilityKey,
        allowed: Option<bool>,
    ) -> Result<()> {
        let map_key = (workspace.clone(), user.clone());
        let mut entry = self
            .members
            .get_mut(&map_key)
            .ok_or_else(|| CollabError::not_found(ErrorCode::MemberNotFound, user))?;

        match allowed {
            Some(value) => {
                entry.overrides.insert(key, value);
            }
            None => {
                entry.overrides.remove(&key);
            }
        }
        drop(entry);

        self.cache.invalidate(user, workspace);
        debug!(workspace = %workspace, user = %user, key = %key, "Member override updated");
        Ok(())
    }

    /// Remove a member. The cache entry is dropped before this returns, so
    /// the very next resolve sees the revocation.
    pub fn remove_member(&self, workspace: &WorkspaceId, user: &UserId) -> bool {
        let removed = self
            .members
            .remove(&(workspace.clone(), user.clone()))
            .is_some();
        if removed {
            self.cache.invalidate(user, workspace);
            info!(workspace = %workspace, user = %user, "Member removed");
        }
        removed
    }

    /// All members of a workspace.
    pub fn members_of(&self, workspace: &WorkspaceId) -> Vec<Member> {
        self.members
            .iter()
            .filter(|entry| &entry.key().0 == workspace)
            .map(|entry| entry.value().clone())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Roles
    // ─────────────────────────────────────────────────────────────────────────

    /// Look up a role by name: custom roles shadow nothing, system roles are
    /// always available under their fixed names.
    pub fn role(&self, workspace: &WorkspaceId, name: &str) -> Option<Role> {
        if let Some(role) = self.custom_roles.get(&(workspace.clone(), name.to_string())) {
            return Some(role.clone());
        }
        SystemRole::all()
            .iter()
            .find(|r| r.name() == name)
            .map(|r| r.to_role())
    }

    /// Create or replace a workspace-scoped custom role.
    ///
    /// System role names are reserved; attempting to redefine one fails.
    pub fn upsert_custom_role(&self, workspace: &WorkspaceId, role: Role) -> Result<()> {
        if SystemRole::all().iter().any(|r| r.name() == role.name) {
            warn!(workspace = %workspace, role = %role.name, "Attempt to redefine system role");
            return Err(CollabError::validation(format!(
                "Role '{}' is a system role and cannot be modified",
                role.name
            )));
        }

        let name = role.name.clone();
        self.custom_roles
            .insert((workspace.clone(), name.clone()), role);

        // A role edit can change any member holding it.
        self.cache.invalidate_workspace(workspace);
        info!(workspace = %workspace, role = %name, "Custom role upserted");
        Ok(())
    }

    /// Delete a custom role. Fails for system roles and for roles still
    /// assigned to a member.
    pub fn delete_custom_role(&self, workspace: &WorkspaceId, name: &str) -> Result<bool> {
        if SystemRole::all().iter().any(|r| r.name() == name) {
            return Err(CollabError::validation(format!(
                "Role '{}' is a system role and cannot be deleted",
                name
            )));
        }

        let in_use = self
            .members
            .iter()
            .any(|entry| &entry.key().0 == workspace && entry.value().role == name);
        if in_use {
            return Err(CollabError::validation(format!(
                "Role '{}' is still assigned to members",
                name
            )));
        }

        let removed = self
            .custom_roles
            .remove(&(workspace.clone(), name.to_string()))
            .is_some();
        if removed {
            self.cache.invalidate_workspace(workspace);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::models::Capability;
    use std::collections::BTreeMap;

    fn store() -> (MembershipStore, Arc<PermissionCache>) {
        let cache = Arc::new(PermissionCache::new());
        let store = MembershipStore::new(cache.clone());
        store.create_workspace(WorkspaceId::new("w1"), UserId::new("owner"));
        (store, cache)
    }

    // Simulate a resolve populating the cache.
    fn warm_cache(
        cache: &PermissionCache,
        store: &MembershipStore,
        ws: &WorkspaceId,
        user: &UserId,
        role: &str,
    ) {
        let token = cache.load_token(user, ws);
        assert!(cache.put_if_current(
            token,
            Arc::new(crate::authz::cache::MemberSnapshot {
                member: store.member(ws, user).unwrap(),
                role: store.role(ws, role).unwrap(),
            }),
        ));
    }

    #[test]
    fn test_workspace_seeds_owner_member() {
        let (store, _) = store();
        let member = store
            .member(&WorkspaceId::new("w1"), &UserId::new("owner"))
            .unwrap();
        assert_eq!(member.role, "owner");
        assert!(member.is_active());
    }

    #[test]
    fn test_upsert_member_requires_known_role() {
        let (store, _) = store();
        let bad = Member::new(WorkspaceId::new("w1"), UserId::new("bob"), "wizard");
        let err = store.upsert_member(bad).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_member_writes_invalidate_cache() {
        let (store, cache) = store();
        let ws = WorkspaceId::new("w1");
        let user = UserId::new("dev");
        store
            .upsert_member(Member::new(ws.clone(), user.clone(), "developer"))
            .unwrap();

        warm_cache(&cache, &store, &ws, &user, "developer");
        assert!(cache.get(&user, &ws).is_some());

        store.set_member_role(&ws, &user, "viewer").unwrap();
        assert!(cache.get(&user, &ws).is_none());
    }

    #[test]
    fn test_remove_member_invalidates_cache() {
        let (store, cache) = store();
        let ws = WorkspaceId::new("w1");
        let user = UserId::new("dev");
        store
            .upsert_member(Member::new(ws.clone(), user.clone(), "developer"))
            .unwrap();
        warm_cache(&cache, &store, &ws, &user, "developer");

        assert!(store.remove_member(&ws, &user));
        assert!(cache.get(&user, &ws).is_none());
        assert!(store.member(&ws, &user).is_none());
    }

    #[test]
    fn test_system_roles_are_immutable() {
        let (store, _) = store();
        let ws = WorkspaceId::new("w1");

        let imposter = Role::new("admin", BTreeMap::new());
        assert!(store.upsert_custom_role(&ws, imposter).is_err());
        assert!(store.delete_custom_role(&ws, "viewer").is_err());
    }

    #[test]
    fn test_custom_role_lifecycle() {
        let (store, cache) = store();
        let ws = WorkspaceId::new("w1");

        let mut caps = BTreeMap::new();
        caps.insert(
            CapabilityKey::new(crate::workspace::models::ResourceKind::Project, Capability::Read),
            true,
        );
        store
            .upsert_custom_role(&ws, Role::new("auditor", caps))
            .unwrap();
        assert!(store.role(&ws, "auditor").is_some());

        // Role edits flush the whole workspace from the cache.
        warm_cache(&cache, &store, &ws, &UserId::new("owner"), "owner");
        store
            .upsert_custom_role(&ws, Role::new("auditor", BTreeMap::new()))
            .unwrap();
        assert!(cache.get(&UserId::new("owner"), &ws).is_none());

        assert!(store.delete_custom_role(&ws, "auditor").unwrap());
        assert!(store.role(&ws, "auditor").is_none());
    }

    #[test]
    fn test_delete_role_in_use_rejected() {
        let (store, _) = store();
        let ws = WorkspaceId::new("w1");
        store
            .upsert_custom_role(&ws, Role::new("auditor", BTreeMap::new()))
            .unwrap();
        store
            .upsert_member(Member::new(ws.clone(), UserId::new("aud"), "auditor"))
            .unwrap();

        assert!(store.delete_custom_role(&ws, "auditor").is_err());
    }
}
