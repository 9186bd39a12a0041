//! Real-time surface: authentication, wire protocol, shared state, and
//! the WebSocket connection loop.

pub mod auth;
pub mod handler;
pub mod message;
pub mod state;

pub use auth::{AuthContext, StaticTokenValidator, TokenValidator};
pub use handler::router;
pub use message::{ClientMessage, ServerMessage};
pub use state::{CollabState, CollabStats};
