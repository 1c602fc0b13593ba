//! The in-memory side of weapon: events, per-device streams, and the store that holds every stream.

#[path = "1-event.rs"]
mod event;
#[path = "2-timestamped.rs"]
mod timestamped;
#[path = "3-event-store.rs"]
mod event_store;
#[path = "4-event-stream-store.rs"]
mod event_stream_store;
#[path = "5-stream-store.rs"]
mod stream_store;

pub use event::Event;
pub use event_store::{Clock, EventStore, ListenerKey, Notification, SyncState, SyncTarget};
pub use event_stream_store::{EventStreamStore, ValidToAddEvents};
pub use stream_store::StreamStore;
pub use timestamped::{EventKey, Timestamped, WireEvent};
