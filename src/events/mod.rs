//! Sequenced event streams with bounded, two-lane fanout.

pub mod broadcaster;
pub mod outbound;
pub mod stream;

pub use broadcaster::{BroadcastStats, EventBroadcaster, Published, Subscription};
pub use outbound::{channel, Frame, OutboundQueue, OutboundReceiver, SendOutcome};
pub use stream::{ResourceStream, SequencedEvent};
