//! Authorization: layered permission resolution with an explicit,
//! synchronously-invalidated member cache.

pub mod cache;
pub mod resolver;

pub use cache::{CacheStats, LoadToken, MemberSnapshot, PermissionCache};
pub use resolver::{AllowReason, Decision, PermissionResolver};
