//! Permission resolution engine.
//!
//! Answers the question: "can user X exercise capability C on resource R
//! within workspace W?"
//!
//! Resolution is the logical OR of independently-sufficient layers, so a
//! grant can only ever widen access. There is deliberately no deny-overrides
//! layer; the single carve-out is that a member override defined for an
//! exact key replaces the *role default* answer for that key, in either
//! direction, without touching any other layer.

use metrics::counter;
use std::sync::Arc;
use tracing::debug;

use crate::authz::cache::{MemberSnapshot, PermissionCache};
use crate::error::{CollabError, ErrorCode, Result};
use crate::workspace::grants::ResourceGrantStore;
use crate::workspace::membership::MembershipStore;
use crate::workspace::models::{
    Capability, CapabilityKey, ResourceRef, UserId, Visibility, WorkspaceId,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// Which layer produced an allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    /// The user owns the resource.
    Ownership,
    /// A grant row targeting the user directly.
    UserGrant,
    /// A grant row targeting the user's role name.
    RoleGrant,
    /// The member's override map defines the exact key as allowed.
    MemberOverride,
    /// The role's default capability map allows the key.
    RoleDefault,
    /// `visibility = public` allows read for anyone.
    PublicVisibility,
    /// `visibility = workspace` allows read for active members.
    WorkspaceVisibility,
}

/// Result of a permission evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Allowed, with the layer that granted it.
    Allow(AllowReason),
    /// Denied, with a user-facing reason.
    Deny(String),
    /// The caller's membership is no longer active. Distinct from `Deny`
    /// so callers can present "you were removed" instead of "no permission".
    Revoked,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolver
// ═══════════════════════════════════════════════════════════════════════════════

/// The permission resolver, combining membership, grants, and visibility.
pub struct PermissionResolver {
    membership: Arc<MembershipStore>,
    grants: Arc<ResourceGrantStore>,
    cache: Arc<PermissionCache>,
}

impl PermissionResolver {
    pub fn new(
        membership: Arc<MembershipStore>,
        grants: Arc<ResourceGrantStore>,
        cache: Arc<PermissionCache>,
    ) -> Self {
        Self {
            membership,
            grants,
            cache,
        }
    }

    /// Evaluate a capability request.
    ///
    /// Lookup failures (unknown workspace or resource, a member pointing at
    /// a role that no longer exists) are errors; everything else is a
    /// [`Decision`].
    pub fn resolve(
        &self,
        user: &UserId,
        workspace: &WorkspaceId,
        resource: &ResourceRef,
        capability: Capability,
    ) -> Result<Decision> {
        let ws = self
            .membership
            .workspace(workspace)
            .ok_or_else(|| CollabError::not_found(ErrorCode::WorkspaceNotFound, workspace))?;

        let meta = self
            .grants
            .resource(resource)
            .ok_or_else(|| CollabError::not_found(ErrorCode::ResourceNotFound, resource))?;

        // Tenant isolation: a resource is only addressable through its own
        // workspace.
        if meta.workspace != *workspace {
            return Err(CollabError::not_found(ErrorCode::ResourceNotFound, resource));
        }

        if !ws.active {
            return Ok(self.record(Decision::Deny(format!(
                "Workspace {} is not active",
                workspace
            ))));
        }

        // Layer 1: ownership allows all actions.
        if meta.owner == *user {
            return Ok(self.record(Decision::Allow(AllowReason::Ownership)));
        }

        // Layer 2: direct user grant. Independent of membership, which is
        // what makes cross-workspace sharing with a specific outside user
        // possible.
        if let Some(caps) = self.grants.user_grant(resource, user) {
            if caps.allows(capability) {
                return Ok(self.record(Decision::Allow(AllowReason::UserGrant)));
            }
        }

        // Layers 3-6 derive from the membership record.
        let snapshot = match self.snapshot(user, workspace)? {
            Some(s) => s,
            None => {
                // Never a member: only the public fallback can help.
                if meta.visibility == Visibility::Public && capability == Capability::Read {
                    return Ok(self.record(Decision::Allow(AllowReason::PublicVisibility)));
                }
                return Ok(self.record(Decision::Deny(format!(
                    "User {} is not a member of workspace {}",
                    user, workspace
                ))));
            }
        };

        if !snapshot.member.is_active() {
            // Public read survives revocation; everything member-derived is
            // skipped.
            if meta.visibility == Visibility::Public && capability == Capability::Read {
                return Ok(self.record(Decision::Allow(AllowReason::PublicVisibility)));
            }
            debug!(user = %user, workspace = %workspace, "Member not active, signalling revoked");
            return Ok(self.record(Decision::Revoked));
        }

        // Layer 3: grant targeting the member's role name.
        if let Some(caps) = self.grants.role_grant(resource, &snapshot.member.role) {
            if caps.allows(capability) {
                return Ok(self.record(Decision::Allow(AllowReason::RoleGrant)));
            }
        }

        // Layers 4-5: member override for the exact key, else role default.
        let key = CapabilityKey::new(resource.kind, capability);
        match snapshot.member.overrides.get(&key) {
            Some(true) => {
                return Ok(self.record(Decision::Allow(AllowReason::MemberOverride)));
            }
            Some(false) => {
                // The override replaces the role default for this key only;
                // it never vetoes the remaining layers.
            }
            None => {
                if snapshot.role.default_for(&key) == Some(true) {
                    return Ok(self.record(Decision::Allow(AllowReason::RoleDefault)));
                }
            }
        }

        // Layer 6: visibility fallback.
        if capability == Capability::Read {
            match meta.visibility {
                Visibility::Public => {
                    return Ok(self.record(Decision::Allow(AllowReason::PublicVisibility)));
                }
                Visibility::Workspace => {
                    return Ok(self.record(Decision::Allow(AllowReason::WorkspaceVisibility)));
                }
                Visibility::Private => {}
            }
        }

        Ok(self.record(Decision::Deny(format!(
            "User {} lacks {} on {}",
            user, capability, resource
        ))))
    }

    /// Convenience wrapper: `Ok(reason)` if allowed, the matching error
    /// otherwise. This is what the real-time layer calls before any
    /// mutation.
    pub fn enforce(
        &self,
        user: &UserId,
        workspace: &WorkspaceId,
        resource: &ResourceRef,
        capability: Capability,
    ) -> Result<AllowReason> {
        match self.resolve(user, workspace, resource, capability)? {
            Decision::Allow(reason) => Ok(reason),
            Decision::Deny(reason) => Err(CollabError::permission_denied(reason)),
            Decision::Revoked => Err(CollabError::access_revoked(workspace)),
        }
    }

    /// Load the member snapshot through the cache.
    fn snapshot(
        &self,
        user: &UserId,
        workspace: &WorkspaceId,
    ) -> Result<Option<Arc<MemberSnapshot>>> {
        if let Some(snapshot) = self.cache.get(user, workspace) {
            return Ok(Some(snapshot));
        }

        // Token before the member read: a membership write landing between
        // the read and the publish bumps the generation and the stale
        // snapshot is discarded instead of cached.
        let token = self.cache.load_token(user, workspace);

        let member = match self.membership.member(workspace, user) {
            Some(m) => m,
            None => return Ok(None),
        };

        let role = self
            .membership
            .role(workspace, &member.role)
            .ok_or_else(|| {
                CollabError::configuration(format!(
                    "Member {} references unknown role '{}'",
                    user, member.role
                ))
            })?;

        let snapshot = Arc::new(MemberSnapshot { member, role });
        self.cache.put_if_current(token, snapshot.clone());
        Ok(Some(snapshot))
    }

    fn record(&self, decision: Decision) -> Decision {
        let outcome = match &decision {
            Decision::Allow(_) => "allow",
            Decision::Deny(_) => "deny",
            Decision::Revoked => "revoked",
        };
        counter!("huddle_authz_decisions_total", "outcome" => outcome).increment(1);
        decision
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
