//! Huddle Core
//!
//! Multi-tenant workspace coordination: layered permission resolution,
//! presence tracking, lease-based resource locks, and sequenced event
//! broadcast over a JSON WebSocket protocol.
//!
//! # Architecture
//!
//! - [`workspace`] — identity, membership, roles, and sharing grants
//! - [`authz`] — the permission resolver and its member cache
//! - [`presence`] — session registry, state machine, and update coalescing
//! - [`locks`] — lease-based exclusive locks
//! - [`events`] — per-resource sequenced streams with two-lane fanout
//! - [`activity`] — the durable audit trail
//! - [`realtime`] — auth, wire protocol, and the WebSocket surface

pub mod activity;
pub mod authz;
pub mod config;
pub mod error;
pub mod events;
pub mod locks;
pub mod observability;
pub mod presence;
pub mod realtime;
pub mod workspace;

pub use config::Config;
pub use error::{CollabError, ErrorCode, Result};

/// Crate version, exposed for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types.
pub mod prelude {
    pub use crate::activity::{ActivityRecord, ActivitySink, MemoryActivityLog};
    pub use crate::authz::{AllowReason, Decision, PermissionCache, PermissionResolver};
    pub use crate::error::{CollabError, ErrorCode, Result};
    pub use crate::events::EventBroadcaster;
    pub use crate::locks::{Lease, LeaseToken, LockManager};
    pub use crate::presence::{PresenceState, PresenceTracker};
    pub use crate::realtime::{ClientMessage, CollabState, ServerMessage, TokenValidator};
    pub use crate::workspace::{
        Capability, CapabilityKey, CapabilitySet, GrantSubject, Member, MemberStatus,
        ResourceGrant, ResourceKind, ResourceMeta, ResourceRef, Role, SessionId, SystemRole,
        UserId, Visibility, Workspace, WorkspaceId,
    };
}
