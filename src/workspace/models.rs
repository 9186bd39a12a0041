//! Workspace data models: identifiers, capabilities, roles, members, grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Strongly-typed user identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Strongly-typed workspace identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a connected session (one per connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resources
// ═══════════════════════════════════════════════════════════════════════════════

/// The kinds of shareable artifacts the platform coordinates.
///
/// Validated at the system boundary; everything downstream works with this
/// fixed enum rather than free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Project,
    Collection,
    Environment,
    Request,
}

impl ResourceKind {
    /// Plural form used in capability keys (`projects.write`).
    pub fn key_segment(&self) -> &'static str {
        match self {
            Self::Project => "projects",
            Self::Collection => "collections",
            Self::Environment => "environments",
            Self::Request => "requests",
        }
    }

    /// Parse the wire form (`"project"`, `"collection"`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "project" | "projects" => Some(Self::Project),
            "collection" | "collections" => Some(Self::Collection),
            "environment" | "environments" => Some(Self::Environment),
            "request" | "requests" => Some(Self::Request),
            _ => None,
        }
    }

    pub fn all() -> [ResourceKind; 4] {
        [Self::Project, Self::Collection, Self::Environment, Self::Request]
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_segment())
    }
}

/// A typed reference to a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Who may see a resource without an explicit grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Workspace,
    Public,
}

/// Metadata the core keeps about a resource: enough to answer ownership and
/// visibility questions, nothing about its stored content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub resource: ResourceRef,
    pub workspace: WorkspaceId,
    pub owner: UserId,
    pub visibility: Visibility,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Capabilities
// ═══════════════════════════════════════════════════════════════════════════════

/// The fixed set of actions a grant can confer on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    Delete,
    Share,
    Admin,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Share => "share",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "delete" => Some(Self::Delete),
            "share" => Some(Self::Share),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Whether holding `self` satisfies a request for `wanted`.
    ///
    /// `Admin` implies every capability; everything else is exact.
    pub fn satisfies(&self, wanted: Capability) -> bool {
        *self == Capability::Admin || *self == wanted
    }

    /// Whether this capability is "write or stronger" for lock purposes.
    pub fn can_edit(&self) -> bool {
        matches!(self, Self::Write | Self::Delete | Self::Admin)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A set of capabilities attached to a resource grant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(pub HashSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self(HashSet::new())
    }

    pub fn of(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    /// Read-only set.
    pub fn read_only() -> Self {
        Self::of([Capability::Read])
    }

    /// Whether the set satisfies the wanted capability.
    pub fn allows(&self, wanted: Capability) -> bool {
        self.0.iter().any(|c| c.satisfies(wanted))
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0.insert(cap);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A capability key scopes a capability to a resource kind, the shape role
/// maps and member overrides are keyed by. Canonical form: `projects.write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapabilityKey {
    pub kind: ResourceKind,
    pub capability: Capability,
}

impl CapabilityKey {
    pub fn new(kind: ResourceKind, capability: Capability) -> Self {
        Self { kind, capability }
    }

    /// Parse the canonical `"projects.write"` form.
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, action) = s.split_once('.')?;
        Some(Self {
            kind: ResourceKind::parse(kind)?,
            capability: Capability::parse(action)?,
        })
    }
}

impl fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.capability)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Roles
// ═══════════════════════════════════════════════════════════════════════════════

/// A role maps capability keys to a default answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Role name, unique within a workspace (system roles are global).
    pub name: String,
    /// Ordered default capability map.
    pub capabilities: BTreeMap<CapabilityKey, bool>,
    /// System roles cannot be modified or deleted.
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn new(name: impl Into<String>, capabilities: BTreeMap<CapabilityKey, bool>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            capabilities,
            is_system: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark this as an immutable system role.
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    /// The role's default answer for a capability key, if it defines one.
    pub fn default_for(&self, key: &CapabilityKey) -> Option<bool> {
        self.capabilities.get(key).copied()
    }

    pub fn set_capability(&mut self, key: CapabilityKey, allowed: bool) {
        self.capabilities.insert(key, allowed);
        self.updated_at = Utc::now();
    }
}

/// The four built-in roles every workspace starts with.
///
/// | Role      | Description                                                |
/// |-----------|------------------------------------------------------------|
/// | Owner     | Full access to everything                                  |
/// | Admin     | Full access to everything                                  |
/// | Developer | Read/write all artifact kinds; cannot delete or share      |
/// | Viewer    | Read-only                                                  |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemRole {
    Owner,
    Admin,
    Developer,
    Viewer,
}

impl SystemRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Developer => "developer",
            Self::Viewer => "viewer",
        }
    }

    /// Build the default capability map for this role.
    pub fn capabilities(&self) -> BTreeMap<CapabilityKey, bool> {
        let mut map = BTreeMap::new();
        for kind in ResourceKind::all() {
            match self {
                Self::Owner | Self::Admin => {
                    for cap in [
                        Capability::Read,
                        Capability::Write,
                        Capability::Delete,
                        Capability::Share,
                        Capability::Admin,
                    ] {
                        map.insert(CapabilityKey::new(kind, cap), true);
                    }
                }
                Self::Developer => {
                    map.insert(CapabilityKey::new(kind, Capability::Read), true);
                    map.insert(CapabilityKey::new(kind, Capability::Write), true);
                }
                Self::Viewer => {
                    map.insert(CapabilityKey::new(kind, Capability::Read), true);
                }
            }
        }
        map
    }

    pub fn to_role(&self) -> Role {
        Role::new(self.name(), self.capabilities()).system()
    }

    pub fn all() -> [SystemRole; 4] {
        [Self::Owner, Self::Admin, Self::Developer, Self::Viewer]
    }

    /// All system roles as `Role` structs.
    pub fn all_defaults() -> Vec<Role> {
        Self::all().iter().map(|r| r.to_role()).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Workspaces & members
// ═══════════════════════════════════════════════════════════════════════════════

/// A workspace (tenant) that owns members, roles, and resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub owner: UserId,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(id: WorkspaceId, owner: UserId) -> Self {
        Self {
            id,
            owner,
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// Membership lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Inactive,
    Pending,
}

/// A user's participation record in a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub workspace: WorkspaceId,
    pub user: UserId,
    /// Name of the role assigned to this member.
    pub role: String,
    /// Per-member overrides for exact capability keys. An entry here wins
    /// over the role default for that key, in either direction.
    pub overrides: BTreeMap<CapabilityKey, bool>,
    pub status: MemberStatus,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn new(workspace: WorkspaceId, user: UserId, role: impl Into<String>) -> Self {
        Self {
            workspace,
            user,
            role: role.into(),
            overrides: BTreeMap::new(),
            status: MemberStatus::Active,
            joined_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resource grants
// ═══════════════════════════════════════════════════════════════════════════════

/// Who a resource grant targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum GrantSubject {
    User { id: UserId },
    Role { name: String },
}

impl GrantSubject {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User { id: UserId::new(id) }
    }

    pub fn role(name: impl Into<String>) -> Self {
        Self::Role { name: name.into() }
    }
}

/// An explicit per-resource capability grant.
///
/// At most one grant row exists per (resource, subject); re-granting
/// overwrites the row rather than accumulating duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub resource: ResourceRef,
    pub subject: GrantSubject,
    pub capabilities: CapabilitySet,
    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,
}

impl ResourceGrant {
    pub fn new(
        resource: ResourceRef,
        subject: GrantSubject,
        capabilities: CapabilitySet,
        granted_by: UserId,
    ) -> Self {
        Self {
            resource,
            subject,
            capabilities,
            granted_by,
            granted_at: Utc::now(),
        }
    }
}
