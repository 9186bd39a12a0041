//! Presence: who is connected, what they are looking at, and how awake
//! they are.

pub mod debounce;
pub mod tracker;

pub use debounce::{Coalescer, Offer};
pub use tracker::{
    PresenceInfo, PresenceState, PresenceThresholds, PresenceTracker, Session, SweepOutcome,
};
