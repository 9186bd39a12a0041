//! Workspace domain: identifiers, capabilities, roles, members, and grants.

pub mod grants;
pub mod membership;
pub mod models;

pub use grants::ResourceGrantStore;
pub use membership::MembershipStore;
pub use models::{
    Capability, CapabilityKey, CapabilitySet, GrantSubject, Member, MemberStatus, ResourceGrant,
    ResourceKind, ResourceMeta, ResourceRef, Role, SessionId, SystemRole, UserId, Visibility,
    Workspace, WorkspaceId,
};
