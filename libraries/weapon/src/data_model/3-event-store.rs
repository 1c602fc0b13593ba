//! # EventStore
//! Holds every stream the app has requested, keyed by stream id.
//!
//! Streams are type-erased behind [`StreamStore`] so one store can hold, say, review events and
//! course-selection events side by side. The store also remembers which listeners to notify
//! when a stream changes and how far each sync target has gotten.
//!
//! Listener callbacks are never invoked while the store is borrowed. Mutations queue
//! notifications; the host drains them with [`EventStore::drain_due_notifications`] once it
//! has released its borrow, because callbacks usually call back into the store.

use std::{
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
};

use chrono::{DateTime, Utc};
use slotmap::SlotMap;

use crate::data_model::{Event, EventStreamStore, StreamStore, Timestamped};

slotmap::new_key_type! {
    pub struct ListenerKey;
}

/// Number of events per device, per stream.
pub type Clock<Stream, Device> = BTreeMap<Stream, BTreeMap<Device, usize>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum SyncTarget {
    LocalStorage,
    Remote,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(bound(
    serialize = "Stream: serde::Serialize + Ord, Device: serde::Serialize + Ord",
    deserialize = "Stream: serde::Deserialize<'de> + Ord, Device: serde::Deserialize<'de> + Ord"
))]
pub struct SyncState<Stream, Device> {
    /// What the target held the last time we looked.
    pub remote_clock: Clock<Stream, Device>,
    pub in_progress: bool,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl<Stream, Device> Default for SyncState<Stream, Device> {
    fn default() -> Self {
        Self {
            remote_clock: BTreeMap::new(),
            in_progress: false,
            last_error: None,
            last_synced_at: None,
        }
    }
}

type Listener<Stream> = Rc<dyn Fn(ListenerKey, Stream)>;

/// A queued listener call, ready to run once the store is no longer borrowed.
pub type Notification = Box<dyn FnOnce()>;

pub struct EventStore<Stream, Device> {
    streams: BTreeMap<Stream, Box<dyn StreamStore<Device>>>,
    listeners: SlotMap<ListenerKey, Listener<Stream>>,
    /// Streams that changed since the last drain, with the listener that caused the change.
    /// A listener is not told about changes it made itself.
    pending_notifications: BTreeMap<Stream, Option<ListenerKey>>,
    loaded: BTreeSet<Stream>,
    sync_states: BTreeMap<SyncTarget, SyncState<Stream, Device>>,
}

impl<Stream, Device> Default for EventStore<Stream, Device> {
    fn default() -> Self {
        Self {
            streams: BTreeMap::new(),
            listeners: SlotMap::with_key(),
            pending_notifications: BTreeMap::new(),
            loaded: BTreeSet::new(),
            sync_states: BTreeMap::new(),
        }
    }
}

impl<Stream, Device> EventStore<Stream, Device>
where
    Stream: Ord + Clone + std::fmt::Display + 'static,
    Device: Ord + Clone + 'static,
{
    pub fn register_listener(&mut self, listener: impl Fn(ListenerKey, Stream) + 'static) -> ListenerKey {
        self.listeners.insert(Rc::new(listener))
    }

    pub fn unregister_listener(&mut self, key: ListenerKey) {
        if self.listeners.remove(key).is_none() {
            log::warn!("Tried to unregister a listener that was not registered");
        }
    }

    fn queue_notification(&mut self, stream_id: Stream, modifier: Option<ListenerKey>) {
        self.pending_notifications
            .entry(stream_id)
            .and_modify(|existing| {
                // two different modifiers touched the stream, so everyone needs to hear about it
                if *existing != modifier {
                    *existing = None;
                }
            })
            .or_insert(modifier);
    }

    /// Takes every queued notification. Run them after releasing any borrow of the store.
    pub fn drain_due_notifications(&mut self) -> Vec<Notification> {
        let pending = std::mem::take(&mut self.pending_notifications);
        let mut notifications: Vec<Notification> = Vec::new();
        for (stream_id, modifier) in pending {
            for (key, listener) in &self.listeners {
                if Some(key) == modifier {
                    continue;
                }
                let listener = Rc::clone(listener);
                let stream_id = stream_id.clone();
                notifications.push(Box::new(move || listener(key, stream_id)));
            }
        }
        notifications
    }

    /// Returns the stream, creating it if this is the first time it is requested.
    /// Returns `None` if the stream already exists with a different event type.
    pub fn get_or_insert_default<E: Event + 'static>(
        &mut self,
        stream_id: Stream,
        modifier: Option<ListenerKey>,
    ) -> Option<&mut EventStreamStore<Device, Timestamped<E>>> {
        if !self.streams.contains_key(&stream_id) {
            self.streams.insert(
                stream_id.clone(),
                Box::new(EventStreamStore::<Device, Timestamped<E>>::default()),
            );
            self.queue_notification(stream_id.clone(), modifier);
        }

        let stream = self.streams.get_mut(&stream_id)?;
        let stream: &mut dyn std::any::Any = &mut **stream;
        let downcast = stream.downcast_mut::<EventStreamStore<Device, Timestamped<E>>>();
        if downcast.is_none() {
            log::error!("Stream {stream_id} holds a different event type than requested");
        }
        downcast
    }

    pub fn get<E: Event + 'static>(
        &self,
        stream_id: Stream,
    ) -> Option<&EventStreamStore<Device, Timestamped<E>>> {
        let stream: &dyn std::any::Any = &**self.streams.get(&stream_id)?;
        stream.downcast_ref::<EventStreamStore<Device, Timestamped<E>>>()
    }

    pub fn get_raw(&self, stream_id: Stream) -> Option<&dyn StreamStore<Device>> {
        self.streams.get(&stream_id).map(|stream| &**stream)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Stream, &dyn StreamStore<Device>)> {
        self.streams
            .iter()
            .map(|(stream_id, stream)| (stream_id, &**stream))
    }

    pub fn loaded_at_least_once(&self, stream_id: &Stream) -> bool {
        self.loaded.contains(stream_id)
    }

    /// Records that the stream has been read from local storage. Returns true the first time.
    pub fn mark_loaded(&mut self, stream_id: Stream, modifier: Option<ListenerKey>) -> bool {
        let newly_loaded = self.loaded.insert(stream_id.clone());
        if newly_loaded {
            self.queue_notification(stream_id, modifier);
        }
        newly_loaded
    }

    /// Appends a new event created on this device. The event gets the device's next index
    /// and a logical clock greater than anything the stream has seen.
    pub fn add_raw_event<E: Event + 'static>(
        &mut self,
        stream_id: Stream,
        device_id: Device,
        event: E,
        modifier: Option<ListenerKey>,
    ) -> Option<Timestamped<E>> {
        self.add_raw_event_at(stream_id, device_id, event, Utc::now(), modifier)
    }

    pub fn add_raw_event_at<E: Event + 'static>(
        &mut self,
        stream_id: Stream,
        device_id: Device,
        event: E,
        timestamp: DateTime<Utc>,
        modifier: Option<ListenerKey>,
    ) -> Option<Timestamped<E>> {
        let stream = self.get_or_insert_default::<E>(stream_id.clone(), modifier)?;
        let timestamped = Timestamped {
            within_device_events_index: stream.len_device(&device_id),
            logical_clock: stream.next_logical_clock(),
            timestamp,
            event,
        };
        let valid = stream.valid_to_add_events(&device_id, vec![timestamped.clone()])?;
        stream.add_device_events(device_id, valid);
        self.queue_notification(stream_id, modifier);
        Some(timestamped)
    }

    /// Merges one event from any device. Returns whether it was new.
    pub fn add_device_event<E: Event + 'static>(
        &mut self,
        stream_id: Stream,
        device_id: Device,
        event: Timestamped<E>,
        modifier: Option<ListenerKey>,
    ) -> bool {
        self.add_device_events(stream_id, device_id, vec![event], modifier) > 0
    }

    /// Merges a batch of events from one device. Known events are skipped, so merging the
    /// same batch twice adds nothing the second time. Returns the number of events added.
    pub fn add_device_events<E: Event + 'static>(
        &mut self,
        stream_id: Stream,
        device_id: Device,
        events: Vec<Timestamped<E>>,
        modifier: Option<ListenerKey>,
    ) -> usize {
        let Some(stream) = self.get_or_insert_default::<E>(stream_id.clone(), modifier) else {
            return 0;
        };
        let Some(valid) = stream.valid_to_add_events(&device_id, events) else {
            return 0;
        };
        let added = stream.add_device_events(device_id, valid);
        if added > 0 {
            self.queue_notification(stream_id, modifier);
        }
        added
    }

    /// Like [`Self::add_device_events`], for events whose type is only known to the stream.
    /// The stream must already exist.
    pub fn add_device_events_jsons(
        &mut self,
        stream_id: Stream,
        device_id: Device,
        events: Vec<Timestamped<serde_json::Value>>,
        modifier: Option<ListenerKey>,
    ) -> usize {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            log::warn!("Received events for stream {stream_id}, which has not been requested");
            return 0;
        };
        let Some(valid) = stream.valid_to_add_event_jsons(&device_id, events) else {
            return 0;
        };
        let added = stream.add_device_event_jsons(device_id, valid);
        if added > 0 {
            self.queue_notification(stream_id, modifier);
        }
        added
    }

    pub fn vector_clock(&self) -> Clock<Stream, Device> {
        self.streams
            .iter()
            .map(|(stream_id, stream)| {
                let counts = stream
                    .num_events_per_device()
                    .into_iter()
                    .map(|(device, count)| (device.clone(), count))
                    .collect();
                (stream_id.clone(), counts)
            })
            .collect()
    }

    pub fn mark_sync_started(&mut self, target: SyncTarget) {
        let state = self.sync_states.entry(target).or_default();
        state.in_progress = true;
    }

    pub fn mark_sync_finished(&mut self, target: SyncTarget, error: Option<String>) {
        let state = self.sync_states.entry(target).or_default();
        state.in_progress = false;
        if error.is_none() {
            state.last_synced_at = Some(Utc::now());
        }
        state.last_error = error;
    }

    /// Records what the target holds. Streams absent from `clock` keep their previous entry.
    pub fn update_sync_clock(&mut self, target: SyncTarget, clock: Clock<Stream, Device>) {
        let state = self.sync_states.entry(target).or_default();
        for (stream_id, counts) in clock {
            state.remote_clock.insert(stream_id, counts);
        }
    }

    pub fn sync_state(&self, target: SyncTarget) -> Option<&SyncState<Stream, Device>> {
        self.sync_states.get(&target)
    }

    /// The wall-clock time of the oldest event the target does not have yet.
    pub fn get_timestamp_of_earliest_unsynced_event(&self, target: SyncTarget) -> Option<DateTime<Utc>> {
        let empty = BTreeMap::new();
        let remote_clock = self
            .sync_state(target)
            .map(|state| &state.remote_clock);
        self.streams
            .iter()
            .filter_map(|(stream_id, stream)| {
                let synced = remote_clock
                    .and_then(|clock| clock.get(stream_id))
                    .unwrap_or(&empty);
                stream.timestamp_of_earliest_unsynced_event(synced)
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
    struct Note(String);

    impl Event for Note {
        fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
            serde_json::to_value(self)
        }

        fn from_json(json: &serde_json::Value) -> Result<Self, serde_json::Error> {
            serde_json::from_value(json.clone())
        }
    }

    fn note(text: &str) -> Note {
        Note(text.to_string())
    }

    #[test]
    fn local_appends_get_increasing_index_and_clock() {
        let mut store: EventStore<String, String> = EventStore::default();
        let first = store
            .add_raw_event("notes".to_string(), "a".to_string(), note("one"), None)
            .unwrap();
        let second = store
            .add_raw_event("notes".to_string(), "a".to_string(), note("two"), None)
            .unwrap();
        assert_eq!(first.within_device_events_index, 0);
        assert_eq!(second.within_device_events_index, 1);
        assert!(second.logical_clock > first.logical_clock);
    }

    #[test]
    fn appending_after_a_merge_advances_past_remote_clock() {
        let mut store: EventStore<String, String> = EventStore::default();
        let remote = Timestamped {
            within_device_events_index: 0,
            logical_clock: 41,
            timestamp: Utc::now(),
            event: note("remote"),
        };
        assert!(store.add_device_event("notes".to_string(), "b".to_string(), remote, None));
        let local = store
            .add_raw_event("notes".to_string(), "a".to_string(), note("local"), None)
            .unwrap();
        assert_eq!(local.logical_clock, 42);
    }

    #[test]
    fn merging_is_idempotent() {
        let mut source: EventStore<String, String> = EventStore::default();
        for text in ["one", "two", "three"] {
            source.add_raw_event("notes".to_string(), "a".to_string(), note(text), None);
        }
        let events: Vec<_> = source
            .get::<Note>("notes".to_string())
            .unwrap()
            .iter()
            .cloned()
            .collect();

        let mut replica: EventStore<String, String> = EventStore::default();
        let first = replica.add_device_events("notes".to_string(), "a".to_string(), events.clone(), None);
        let second = replica.add_device_events("notes".to_string(), "a".to_string(), events, None);
        assert_eq!(first, 3);
        assert_eq!(second, 0);
        assert_eq!(replica.vector_clock(), source.vector_clock());
    }

    #[test]
    fn listeners_are_not_told_about_their_own_changes() {
        let mut store: EventStore<String, String> = EventStore::default();
        let heard = Rc::new(RefCell::new(Vec::new()));

        let heard_by_a = Rc::clone(&heard);
        let a = store.register_listener(move |_, stream| heard_by_a.borrow_mut().push(("a", stream)));
        let heard_by_b = Rc::clone(&heard);
        store.register_listener(move |_, stream| heard_by_b.borrow_mut().push(("b", stream)));

        store.add_raw_event("notes".to_string(), "device".to_string(), note("hi"), Some(a));
        for notification in store.drain_due_notifications() {
            notification();
        }
        assert_eq!(*heard.borrow(), vec![("b", "notes".to_string())]);
        assert!(store.drain_due_notifications().is_empty());
    }

    #[test]
    fn a_malformed_json_event_keeps_the_events_before_it() {
        let mut store: EventStore<String, String> = EventStore::default();
        store.add_raw_event("notes".to_string(), "a".to_string(), note("mine"), None);

        let json = |index: usize, event: serde_json::Value| Timestamped {
            within_device_events_index: index,
            logical_clock: index as u64 + 1,
            timestamp: Utc::now(),
            event,
        };
        let batch = vec![
            json(0, serde_json::json!("first")),
            json(1, serde_json::json!({"FutureVariant": {}})),
            json(2, serde_json::json!("third")),
        ];
        let added = store.add_device_events_jsons("notes".to_string(), "b".to_string(), batch, None);
        assert_eq!(added, 1);

        let notes: Vec<Note> = store
            .get::<Note>("notes".to_string())
            .unwrap()
            .iter()
            .map(|event| event.event.clone())
            .collect();
        assert_eq!(notes, vec![note("mine"), note("first")]);
        assert_eq!(store.vector_clock()["notes"]["b"], 1);
    }

    #[test]
    fn unsynced_timestamp_follows_the_sync_clock() {
        let mut store: EventStore<String, String> = EventStore::default();
        let event = store
            .add_raw_event("notes".to_string(), "a".to_string(), note("one"), None)
            .unwrap();
        assert_eq!(
            store.get_timestamp_of_earliest_unsynced_event(SyncTarget::Remote),
            Some(event.timestamp)
        );

        store.update_sync_clock(SyncTarget::Remote, store.vector_clock());
        assert_eq!(store.get_timestamp_of_earliest_unsynced_event(SyncTarget::Remote), None);
    }
}
