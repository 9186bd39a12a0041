//! Resource grant store and resource directory.
//!
//! Holds the explicit per-resource sharing grants plus the slim resource
//! metadata (owner, visibility) the resolver consumes. Resource content
//! lives elsewhere; the core only ever sees [`ResourceMeta`].

use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{CollabError, ErrorCode, Result};
use crate::workspace::models::{
    CapabilitySet, GrantSubject, ResourceGrant, ResourceMeta, ResourceRef, UserId, Visibility,
    WorkspaceId,
};

/// Thread-safe store of resource metadata and sharing grants.
#[derive(Default)]
pub struct ResourceGrantStore {
    /// Resource directory: ownership and visibility per resource.
    resources: DashMap<ResourceRef, ResourceMeta>,
    /// One grant row per (resource, subject). Re-granting overwrites.
    grants: DashMap<(ResourceRef, GrantSubject), ResourceGrant>,
}

impl ResourceGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Resource directory
    // ─────────────────────────────────────────────────────────────────────────

    /// Register (or update) a resource's coordination metadata.
    pub fn register_resource(&self, meta: ResourceMeta) {
        debug!(resource = %meta.resource, workspace = %meta.workspace, "Resource registered");
        self.resources.insert(meta.resource.clone(), meta);
    }

    pub fn resource(&self, resource: &ResourceRef) -> Option<ResourceMeta> {
        self.resources.get(resource).map(|m| m.clone())
    }

    pub fn set_visibility(&self, resource: &ResourceRef, visibility: Visibility) -> Result<()> {
        let mut entry = self
            .resources
            .get_mut(resource)
            .ok_or_else(|| CollabError::not_found(ErrorCode::ResourceNotFound, resource))?;
        entry.visibility = visibility;
        Ok(())
    }

    /// Drop a resource and all of its grants.
    pub fn remove_resource(&self, resource: &ResourceRef) -> bool {
        let removed = self.resources.remove(resource).is_some();
        if removed {
            self.grants.retain(|(res, _), _| res != resource);
            info!(resource = %resource, "Resource and grants removed");
        }
        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Grants
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace the grant row for (resource, subject).
    pub fn grant(&self, grant: ResourceGrant) -> Result<()> {
        if self.resources.get(&grant.resource).is_none() {
            return Err(CollabError::not_found(
                ErrorCode::ResourceNotFound,
                &grant.resource,
            ));
        }

        let key = (grant.resource.clone(), grant.subject.clone());
        let replaced = self.grants.insert(key, grant.clone()).is_some();
        info!(
            resource = %grant.resource,
            subject = ?grant.subject,
            replaced,
            "Resource grant written"
        );
        Ok(())
    }

    /// Remove the grant row for (resource, subject). Idempotent.
    pub fn revoke(&self, resource: &ResourceRef, subject: &GrantSubject) -> bool {
        let removed = self
            .grants
            .remove(&(resource.clone(), subject.clone()))
            .is_some();
        if removed {
            info!(resource = %resource, subject = ?subject, "Resource grant revoked");
        }
        removed
    }

    /// The capability set granted directly to a user on a resource, if any.
    pub fn user_grant(&self, resource: &ResourceRef, user: &UserId) -> Option<CapabilitySet> {
        let subject = GrantSubject::User { id: user.clone() };
        self.grants
            .get(&(resource.clone(), subject))
            .map(|g| g.capabilities.clone())
    }

    /// The capability set granted to a role name on a resource, if any.
    pub fn role_grant(&self, resource: &ResourceRef, role: &str) -> Option<CapabilitySet> {
        let subject = GrantSubject::Role {
            name: role.to_string(),
        };
        self.grants
            .get(&(resource.clone(), subject))
            .map(|g| g.capabilities.clone())
    }

    /// All grant rows on a resource.
    pub fn grants_for(&self, resource: &ResourceRef) -> Vec<ResourceGrant> {
        self.grants
            .iter()
            .filter(|entry| &entry.key().0 == resource)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// All resources registered under a workspace.
    pub fn resources_in(&self, workspace: &WorkspaceId) -> Vec<ResourceMeta> {
        self.resources
            .iter()
            .filter(|entry| &entry.value().workspace == workspace)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::models::{Capability, ResourceKind};

    fn meta(id: &str) -> ResourceMeta {
        ResourceMeta {
            resource: ResourceRef::new(ResourceKind::Collection, id),
            workspace: WorkspaceId::new("w1"),
            owner: UserId::new("owner"),
            visibility: Visibility::Private,
        }
    }

    #[test]
    fn test_grant_requires_registered_resource() {
        let store = ResourceGrantStore::new();
        let grant = ResourceGrant::new(
            ResourceRef::new(ResourceKind::Collection, "c1"),
            GrantSubject::user("alice"),
            CapabilitySet::read_only(),
            UserId::new("owner"),
        );
        assert_eq!(
            store.grant(grant).unwrap_err().code(),
            ErrorCode::ResourceNotFound
        );
    }

    #[test]
    fn test_regrant_overwrites_instead_of_accumulating() {
        let store = ResourceGrantStore::new();
        store.register_resource(meta("c1"));
        let resource = ResourceRef::new(ResourceKind::Collection, "c1");

        store
            .grant(ResourceGrant::new(
                resource.clone(),
                GrantSubject::user("alice"),
                CapabilitySet::read_only(),
                UserId::new("owner"),
            ))
            .unwrap();
        store
            .grant(ResourceGrant::new(
                resource.clone(),
                GrantSubject::user("alice"),
                CapabilitySet::of([Capability::Read, Capability::Write]),
                UserId::new("owner"),
            ))
            .unwrap();

        assert_eq!(store.grants_for(&resource).len(), 1);
        let caps = store.user_grant(&resource, &UserId::new("alice")).unwrap();
        assert!(caps.allows(Capability::Write));
    }

    #[test]
    fn test_user_and_role_grants_are_distinct_rows() {
        let store = ResourceGrantStore::new();
        store.register_resource(meta("c1"));
        let resource = ResourceRef::new(ResourceKind::Collection, "c1");

        store
            .grant(ResourceGrant::new(
                resource.clone(),
                GrantSubject::user("viewer"),
                CapabilitySet::read_only(),
                UserId::new("owner"),
            ))
            .unwrap();
        store
            .grant(ResourceGrant::new(
                resource.clone(),
                GrantSubject::role("viewer"),
                CapabilitySet::of([Capability::Read, Capability::Write]),
                UserId::new("owner"),
            ))
            .unwrap();

        assert_eq!(store.grants_for(&resource).len(), 2);
        assert!(!store
            .user_grant(&resource, &UserId::new("viewer"))
            .unwrap()
            .allows(Capability::Write));
        assert!(store
            .role_grant(&resource, "viewer")
            .unwrap()
            .allows(Capability::Write));
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let store = ResourceGrantStore::new();
        store.register_resource(meta("c1"));
        let resource = ResourceRef::new(ResourceKind::Collection, "c1");
        let subject = GrantSubject::user("alice");

        store
            .grant(ResourceGrant::new(
                resource.clone(),
                subject.clone(),
                CapabilitySet::read_only(),
                UserId::new("owner"),
            ))
            .unwrap();

        assert!(store.revoke(&resource, &subject));
        assert!(!store.revoke(&resource, &subject));
    }

    #[test]
    fn test_remove_resource_drops_grants() {
        let store = ResourceGrantStore::new();
        store.register_resource(meta("c1"));
        let resource = ResourceRef::new(ResourceKind::Collection, "c1");
        store
            .grant(ResourceGrant::new(
                resource.clone(),
                GrantSubject::user("alice"),
                CapabilitySet::read_only(),
                UserId::new("owner"),
            ))
            .unwrap();

        assert!(store.remove_resource(&resource));
        assert!(store.grants_for(&resource).is_empty());
        assert!(store.resource(&resource).is_none());
    }
}
