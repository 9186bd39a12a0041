//! Wire protocol: JSON messages over the persistent connection.
//!
//! Both directions use a `type` tag in snake_case. Unknown client message
//! types fail deserialization and come back as an `invalid_message` error
//! rather than closing the connection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::activity::ActivityRecord;
use crate::error::{CollabError, ErrorCode};
use crate::locks::LeaseToken;
use crate::presence::{PresenceInfo, PresenceState};
use crate::workspace::models::{ResourceKind, SessionId, UserId};

// ═══════════════════════════════════════════════════════════════════════════════
// Client → Server
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Presence status and focused resource. Focusing a resource also
    /// subscribes the session to its event stream.
    PresenceUpdate {
        status: PresenceState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_resource: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_type: Option<ResourceKind>,
        /// Replay events after this sequence when subscribing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_sequence: Option<u64>,
    },
    CursorUpdate {
        resource_id: String,
        position: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<serde_json::Value>,
    },
    ResourceLock {
        resource_id: String,
    },
    ResourceUnlock {
        resource_id: String,
    },
    TypingIndicator {
        resource_id: String,
        is_typing: bool,
    },
    CollaborationEvent {
        event_type: String,
        resource_type: ResourceKind,
        resource_id: String,
        event_data: serde_json::Value,
    },
    Heartbeat,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server → Client
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection snapshot, sent once after the handshake. The high-water
    /// map lets the client replay anything it missed without gaps.
    InitialData {
        your_session: SessionId,
        presence: Vec<PresenceInfo>,
        recent_activity: Vec<ActivityRecord>,
        active_collaborators: Vec<UserId>,
        high_water_sequence: HashMap<String, u64>,
    },
    PresenceUpdate {
        user_id: UserId,
        presence: PresenceInfo,
    },
    PresenceLeft {
        user_id: UserId,
        session_id: SessionId,
    },
    ResourceLocked {
        resource_id: String,
        locked_by: UserId,
        user_name: String,
        /// Present only in the direct reply to the holder.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lease_token: Option<LeaseToken>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lease_seconds: Option<u64>,
    },
    ResourceLockDenied {
        resource_id: String,
        holder: UserId,
    },
    ResourceUnlocked {
        resource_id: String,
    },
    CollaborationEvent {
        event_type: String,
        resource_id: String,
        user_id: UserId,
        event_data: serde_json::Value,
        sequence: u64,
    },
    CursorUpdate {
        resource_id: String,
        user_id: UserId,
        position: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<serde_json::Value>,
    },
    TypingIndicator {
        resource_id: String,
        user_id: UserId,
        is_typing: bool,
    },
    Pong,
    Error {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },
}

impl ServerMessage {
    pub fn error(err: &CollabError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.user_message().to_string(),
            retryable: err.code().is_retryable(),
        }
    }

    /// Serialize into a shared frame for fanout.
    pub fn to_frame(&self) -> crate::error::Result<crate::events::Frame> {
        let json = serde_json::to_string(self)?;
        Ok(std::sync::Arc::from(json.as_str()))
    }
}
