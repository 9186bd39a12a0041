//! Connection authentication.
//!
//! Tokens are issued elsewhere; this layer only verifies one at connect
//! time and maps it to a user and workspace. Everything after the
//! handshake trusts the session, with permissions re-checked per action.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{CollabError, Result};
use crate::workspace::models::{UserId, WorkspaceId};

/// Who a validated token belongs to, and where they are connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user: UserId,
    pub workspace: WorkspaceId,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthContext>;
}

/// Token table for development and tests. Production deployments plug in
/// a validator backed by the identity provider.
#[derive(Default)]
pub struct StaticTokenValidator {
    tokens: DashMap<String, AuthContext>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, token: impl Into<String>, user: UserId, workspace: WorkspaceId) {
        self.tokens.insert(token.into(), AuthContext { user, workspace });
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<AuthContext> {
        self.tokens
            .get(token)
            .map(|ctx| ctx.clone())
            .ok_or_else(|| CollabError::permission_denied("Invalid or expired token"))
    }
}
