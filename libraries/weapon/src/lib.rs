//! This is a library for enabling cross-device local-first event syncing.
//! It was created for Yap.Town, so it doesn't include much that was not needed for that project.
//!
//! Syncing strategy:
//! 1. Each of the user's devices gets a unique ID. Two stores open on the same local storage (two tabs) write under
//!    distinct ids derived from it, claimed with [`persistence::EventLog::claim_writer`].
//! 2. As users use your app, instead of the app modifying the state directly, they generate "events". Events are associated with the device that generated them, an index within that device's events, a Lamport clock and a wall-clock timestamp.
//! 3. Starting from a default initial state, these events are "applied" in `(logical_clock, device)` order to get the current state.
//! 4. Events are written to local storage. Other tabs sharing that storage hear about the write over a broadcast channel and reload.
//! 5. When syncing with the server:
//!   1. The user's device asks the server how many events the server has, then sends any events that it has that the server doesn't.
//!   2. Events from the user's other devices arrive over a realtime subscription (or a catch-up fetch) and are merged.
//!
//! Merging is idempotent: an event already present (same device, stream and index) is skipped,
//! so every path above can deliver the same event any number of times.

#[cfg(feature = "supabase")]
pub mod supabase;

#[cfg(feature = "opfs")]
pub mod opfs;

pub mod cross_tab;
pub mod data_model;
#[cfg(not(target_arch = "wasm32"))]
pub mod fs_log;
pub mod log_codec;
pub mod persistence;
pub mod replicator;

pub use crate::data_model::Event;
use crate::data_model::Timestamped;

/// Core trait for partial event processing without derived state computation
pub trait PartialAppState: Sized {
    type Event: Event;

    /// The intermediate state type returned by process_event.
    /// For simple cases, this can just be Self.
    type Partial: Sized;

    /// Process an event partially, without computing derived state.
    /// This is called for each event when applying multiple events, in replay order.
    fn process_event(
        partial: Self::Partial,
        device_id: &str,
        event: &Timestamped<Self::Event>,
    ) -> Self::Partial;

    /// Finalize the state by computing any derived state (e.g., statistical models).
    /// This is called once after all events have been processed.
    fn finalize(partial: Self::Partial) -> Self;
}

/// Extension trait that provides apply_event for backward compatibility
pub trait AppState: PartialAppState {
    /// Apply a single event completely, including finalization.
    fn apply_event(self, device_id: &str, event: &Timestamped<Self::Event>) -> Self;
}

/// Blanket implementation: anything that can convert Self -> Partial gets apply_event automatically
impl<T> AppState for T
where
    T: PartialAppState,
    T::Partial: From<T>,
{
    fn apply_event(self, device_id: &str, event: &Timestamped<Self::Event>) -> Self {
        let partial = T::Partial::from(self);
        let partial = T::process_event(partial, device_id, event);
        T::finalize(partial)
    }
}
