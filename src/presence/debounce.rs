//! Update coalescing for high-frequency ephemeral traffic.
//!
//! Cursor and presence churn arrives far faster than anyone can read it.
//! The coalescer passes the first update through immediately, then absorbs
//! everything for the same key inside the window, keeping only the latest
//! value. A periodic drain emits that trailing value once the window
//! closes, so the final position is never lost.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Slot<V> {
    window_start: Instant,
    pending: Option<V>,
}

/// Verdict for one offered update.
#[derive(Debug, PartialEq, Eq)]
pub enum Offer<V> {
    /// Send this value now.
    Emit(V),
    /// Absorbed into the open window; a later drain may emit it.
    Held,
}

/// Per-key leading-edge coalescer with trailing emit.
pub struct Coalescer<K, V> {
    window: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash + Clone, V> Coalescer<K, V> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Offer an update for a key.
    pub fn offer(&self, key: K, value: V) -> Offer<V> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        match slots.get_mut(&key) {
            Some(slot) if now.duration_since(slot.window_start) < self.window => {
                slot.pending = Some(value);
                Offer::Held
            }
            _ => {
                slots.insert(
                    key,
                    Slot {
                        window_start: now,
                        pending: None,
                    },
                );
                Offer::Emit(value)
            }
        }
    }

    /// Collect trailing values for every window that has closed. Keys with
    /// nothing pending are simply forgotten.
    pub fn drain_due(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let due: Vec<K> = slots
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.window_start) >= self.window)
            .map(|(k, _)| k.clone())
            .collect();

        let mut out = Vec::new();
        for key in due {
            if let Some(slot) = slots.remove(&key) {
                if let Some(value) = slot.pending {
                    out.push((key, value));
                }
            }
        }
        out
    }

    /// Drop any pending state for a key, e.g. when its session disconnects.
    pub fn forget(&self, key: &K) {
        self.slots.lock().remove(key);
    }
}
