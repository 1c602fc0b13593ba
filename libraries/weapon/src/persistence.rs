//! Durable local storage of event streams.
//!
//! Every backend keeps one append-only log per stream, in the [`crate::log_codec`] format.
//! The store-side operations here (load, save, sync) work against any [`EventLog`]:
//! [`crate::fs_log::FsEventLog`] on native targets, [`MemoryEventLog`] in tests, and the
//! origin private file system when built with the `opfs` feature.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
};

use crate::{
    data_model::{Clock, EventStore, ListenerKey, SyncTarget, Timestamped},
    log_codec::{
        EventLogRecord, encode_event_log_records, parse_device_counts, parse_event_log_records,
        read_event_log,
    },
};

pub const LOGGED_OUT_USER: &str = "logged-out-unknown-user";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid stream id {0:?}")]
    InvalidStreamId(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A place where each stream's event log can be durably kept.
///
/// Implementations are used from a single thread, so their futures need not be `Send`.
#[allow(async_fn_in_trait)]
pub trait EventLog {
    /// Every record of the stream, in storage order. A stream that was never saved is empty.
    async fn load(&self, stream_id: &str) -> Result<Vec<EventLogRecord>, PersistenceError>;

    /// Appends those of `records` that the log does not hold yet, all at once or not at all.
    /// Returns how many records were written.
    async fn save(&self, stream_id: &str, records: &[EventLogRecord]) -> Result<usize, PersistenceError>;

    /// How many contiguous events of each device the stream's log holds.
    async fn device_counts(&self, stream_id: &str) -> Result<BTreeMap<String, usize>, PersistenceError>;

    /// Every stream that has a log.
    async fn stream_ids(&self) -> Result<Vec<String>, PersistenceError>;

    /// Claims the id a newly opened store appends its events under.
    ///
    /// Event indices are handed out per writer, so two stores open on the same logs must
    /// never write as the same id. The result is `device_id` itself while no other open store
    /// holds it, and otherwise the first free [`writer_id`] slot.
    fn claim_writer(&self, device_id: &str) -> String;

    /// Gives back an id from [`EventLog::claim_writer`] once its store is closed.
    fn release_writer(&self, writer_id: &str);
}

/// The writer id in `slot` for `device_id`. Slot 0 is the device id itself.
pub fn writer_id(device_id: &str, slot: usize) -> String {
    if slot == 0 {
        device_id.to_string()
    } else {
        format!("{device_id}.{slot}")
    }
}

/// Stream ids become directory names, so they may not contain path separators.
pub fn validate_stream_id(stream_id: &str) -> Result<(), PersistenceError> {
    let valid = !stream_id.is_empty()
        && stream_id != "."
        && stream_id != ".."
        && !stream_id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidStreamId(stream_id.to_string()))
    }
}

/// Picks out the records that extend what the log already holds, in order, per device.
pub(crate) fn records_missing_from(
    on_disk: &BTreeMap<String, usize>,
    records: &[EventLogRecord],
) -> Vec<EventLogRecord> {
    let mut next_index: BTreeMap<&str, usize> = BTreeMap::new();
    let mut sorted: Vec<&EventLogRecord> = records.iter().collect();
    sorted.sort_by(|a, b| {
        (a.device_id.as_str(), a.within_device_events_index)
            .cmp(&(b.device_id.as_str(), b.within_device_events_index))
    });

    let mut missing = Vec::new();
    for record in sorted {
        let next = next_index
            .entry(record.device_id.as_str())
            .or_insert_with(|| on_disk.get(&record.device_id).copied().unwrap_or(0));
        if record.within_device_events_index == *next {
            missing.push(record.clone());
            *next += 1;
        } else if record.within_device_events_index > *next {
            log::warn!(
                "Not saving event {} of device {}: the log only has {} of its events",
                record.within_device_events_index,
                record.device_id,
                next
            );
        }
    }
    missing
}

/// What a save does to a log that currently holds `existing`.
#[derive(Debug, PartialEq)]
pub(crate) enum SavePlan {
    Unchanged,
    Append(Vec<EventLogRecord>),
    /// The log is damaged. It is replaced by its readable prefix followed by the new records,
    /// of which there are `written`.
    Rewrite {
        records: Vec<EventLogRecord>,
        written: usize,
    },
}

impl SavePlan {
    pub(crate) fn new(stream_id: &str, existing: &[u8], records: &[EventLogRecord]) -> Self {
        let contents = read_event_log(existing);
        let missing = records_missing_from(&contents.device_counts(), records);
        if contents.intact {
            return if missing.is_empty() {
                Self::Unchanged
            } else {
                Self::Append(missing)
            };
        }

        log::warn!(
            "Compacting damaged event log for stream {stream_id}: keeping {} readable record(s), adding {}",
            contents.records.len(),
            missing.len()
        );
        let written = missing.len();
        let mut kept = contents.records;
        kept.extend(missing);
        Self::Rewrite {
            records: kept,
            written,
        }
    }

    pub(crate) fn written(&self) -> usize {
        match self {
            Self::Unchanged => 0,
            Self::Append(records) => records.len(),
            Self::Rewrite { written, .. } => *written,
        }
    }
}

/// Event logs held in memory. Clones share the same logs, which is how tests stand in for
/// several tabs of one origin.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    files: Rc<RefCell<BTreeMap<String, Vec<u8>>>>,
    writers: Rc<RefCell<BTreeSet<String>>>,
}

impl MemoryEventLog {
    pub fn raw_bytes(&self, stream_id: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(stream_id).cloned()
    }

    /// Replaces a stream's log, damage and all.
    pub fn set_raw_bytes(&self, stream_id: &str, bytes: Vec<u8>) {
        self.files.borrow_mut().insert(stream_id.to_string(), bytes);
    }
}

impl EventLog for MemoryEventLog {
    async fn load(&self, stream_id: &str) -> Result<Vec<EventLogRecord>, PersistenceError> {
        validate_stream_id(stream_id)?;
        Ok(self
            .files
            .borrow()
            .get(stream_id)
            .map(|bytes| parse_event_log_records(bytes))
            .unwrap_or_default())
    }

    async fn save(&self, stream_id: &str, records: &[EventLogRecord]) -> Result<usize, PersistenceError> {
        validate_stream_id(stream_id)?;
        let mut files = self.files.borrow_mut();
        let existing = files.get(stream_id).map(Vec::as_slice).unwrap_or_default();
        let plan = SavePlan::new(stream_id, existing, records);
        let written = plan.written();
        if plan == SavePlan::Unchanged {
            return Ok(0);
        }
        let file = files.entry(stream_id.to_string()).or_default();
        match plan {
            SavePlan::Unchanged => {}
            SavePlan::Append(missing) => {
                let include_header = file.is_empty();
                file.extend(encode_event_log_records(&missing, include_header));
            }
            SavePlan::Rewrite { records, .. } => *file = encode_event_log_records(&records, true),
        }
        Ok(written)
    }

    async fn device_counts(&self, stream_id: &str) -> Result<BTreeMap<String, usize>, PersistenceError> {
        validate_stream_id(stream_id)?;
        Ok(self
            .files
            .borrow()
            .get(stream_id)
            .map(|bytes| parse_device_counts(bytes))
            .unwrap_or_default())
    }

    async fn stream_ids(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.files.borrow().keys().cloned().collect())
    }

    fn claim_writer(&self, device_id: &str) -> String {
        let mut writers = self.writers.borrow_mut();
        let mut slot = 0;
        loop {
            let writer_id = writer_id(device_id, slot);
            if writers.insert(writer_id.clone()) {
                return writer_id;
            }
            slot += 1;
        }
    }

    fn release_writer(&self, writer_id: &str) {
        self.writers.borrow_mut().remove(writer_id);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LocalSyncResult {
    pub loaded: usize,
    pub written: usize,
}

impl EventStore<String, String> {
    /// Reload events from local storage and merge with current state.
    /// Returns how many events were new to this store.
    pub async fn load_from_local_storage<L: EventLog>(
        store: &RefCell<EventStore<String, String>>,
        event_log: &L,
        stream_id: String,
        modifier: Option<ListenerKey>,
    ) -> Result<usize, PersistenceError> {
        let mut counts: BTreeMap<String, usize> = {
            let store_ref = store.borrow();
            store_ref
                .get_raw(stream_id.clone())
                .map(|s| {
                    s.num_events_per_device()
                        .into_iter()
                        .map(|(device, count)| (device.clone(), count))
                        .collect()
                })
                .unwrap_or_default()
        };

        let stored_events = event_log
            .load(&stream_id)
            .await
            .inspect_err(|e| log::error!("Failed to reload from local storage: {e:?}"))?;

        let mut events_to_add: BTreeMap<String, Vec<Timestamped<serde_json::Value>>> =
            BTreeMap::new();

        for record in stored_events {
            let device_id = record.device_id;
            let event_index = record.within_device_events_index;

            let entry = counts.entry(device_id.clone()).or_insert(0);
            let expected_index = *entry;
            if event_index < expected_index {
                // already in memory
                continue;
            }

            if event_index > expected_index {
                log::error!(
                    "Event log gap detected for stream {stream_id} device {device_id}: expected index {expected_index}, found {event_index}",
                );
            }

            events_to_add
                .entry(device_id.clone())
                .or_default()
                .push(record.event);
            *entry = event_index + 1;
        }

        if events_to_add.is_empty() {
            return Ok(0);
        }

        let mut store_mut = store.borrow_mut();
        let mut added = 0;
        for (device_id, events) in events_to_add {
            added += store_mut.add_device_events_jsons(stream_id.clone(), device_id, events, modifier);
        }

        Ok(added)
    }

    /// Save events to local storage. Returns how many records were written.
    pub async fn save_to_local_storage<L: EventLog>(
        store: &RefCell<EventStore<String, String>>,
        event_log: &L,
        stream_id: String,
    ) -> Result<usize, PersistenceError> {
        // Local desired counts per device for this stream
        let Some(device_events) = store.borrow().vector_clock().remove(&stream_id) else {
            log::warn!("Stream {stream_id} not found in store, skipping save");
            return Ok(0);
        };

        let device_counts_on_disk = event_log.device_counts(&stream_id).await?;

        let mut records_to_append: Vec<EventLogRecord> = Vec::new();

        for (device_id, num_events) in device_events {
            let device_events_on_disk = device_counts_on_disk.get(&device_id).copied().unwrap_or(0);
            if device_events_on_disk >= num_events {
                continue;
            }

            let events_to_write: Vec<Timestamped<serde_json::Value>> = {
                let store_ref = store.borrow();
                let Some(stream) = store_ref.get_raw(stream_id.clone()) else {
                    log::error!(
                        "Stream {stream_id} not found in store, which should be impossible as we already checked for it"
                    );
                    continue;
                };
                stream.jsons(&device_id, device_events_on_disk)
            };

            for event in events_to_write {
                records_to_append.push(EventLogRecord {
                    device_id: device_id.clone(),
                    within_device_events_index: event.within_device_events_index(),
                    event,
                });
            }
        }

        if records_to_append.is_empty() {
            return Ok(0);
        }

        let written = event_log.save(&stream_id, &records_to_append).await?;
        log::debug!("Saved {written} event(s) of stream {stream_id}");
        Ok(written)
    }

    /// Loads, then saves, either one stream or every stream, and records the resulting
    /// on-disk clock in the local storage sync state.
    pub async fn sync_with_local_storage<L: EventLog>(
        store: &RefCell<EventStore<String, String>>,
        event_log: &L,
        stream_id_to_sync: Option<String>,
        modifier: Option<ListenerKey>,
    ) -> Result<LocalSyncResult, PersistenceError> {
        store.borrow_mut().mark_sync_started(SyncTarget::LocalStorage);

        let result =
            Self::sync_with_local_storage_inner(store, event_log, stream_id_to_sync, modifier).await;

        match &result {
            Ok(_) => store
                .borrow_mut()
                .mark_sync_finished(SyncTarget::LocalStorage, None),
            Err(e) => store
                .borrow_mut()
                .mark_sync_finished(SyncTarget::LocalStorage, Some(e.to_string())),
        }

        result
    }

    async fn sync_with_local_storage_inner<L: EventLog>(
        store: &RefCell<EventStore<String, String>>,
        event_log: &L,
        stream_id_to_sync: Option<String>,
        modifier: Option<ListenerKey>,
    ) -> Result<LocalSyncResult, PersistenceError> {
        let stream_ids: Vec<String> = match stream_id_to_sync {
            Some(stream_id) => vec![stream_id],
            None => store.borrow().iter().map(|(sid, _)| sid.clone()).collect(),
        };

        let mut result = LocalSyncResult::default();
        let mut clock: Clock<String, String> = BTreeMap::new();
        for stream_id in stream_ids {
            result.loaded +=
                Self::load_from_local_storage(store, event_log, stream_id.clone(), modifier).await?;
            store.borrow_mut().mark_loaded(stream_id.clone(), modifier);
            result.written += Self::save_to_local_storage(store, event_log, stream_id.clone()).await?;
            clock.insert(stream_id.clone(), event_log.device_counts(&stream_id).await?);
        }

        store
            .borrow_mut()
            .update_sync_clock(SyncTarget::LocalStorage, clock);

        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Event;

    #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
    pub(crate) struct Tick(pub u32);

    impl Event for Tick {
        fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
            serde_json::to_value(self)
        }

        fn from_json(json: &serde_json::Value) -> Result<Self, serde_json::Error> {
            serde_json::from_value(json.clone())
        }
    }

    pub(crate) fn store_with_ticks(device: &str, ticks: u32) -> RefCell<EventStore<String, String>> {
        let mut store = EventStore::default();
        store.get_or_insert_default::<Tick>("ticks".to_string(), None);
        for tick in 0..ticks {
            store.add_raw_event("ticks".to_string(), device.to_string(), Tick(tick), None);
        }
        RefCell::new(store)
    }

    #[tokio::test]
    async fn sync_records_the_on_disk_clock() {
        let log = MemoryEventLog::default();
        let store = store_with_ticks("device-a", 2);
        let result = EventStore::sync_with_local_storage(&store, &log, None, None)
            .await
            .unwrap();
        assert_eq!(result, LocalSyncResult { loaded: 0, written: 2 });

        let store = store.borrow();
        let state = store.sync_state(SyncTarget::LocalStorage).unwrap();
        assert!(!state.in_progress);
        assert_eq!(state.remote_clock, store.vector_clock());
        assert!(store.loaded_at_least_once(&"ticks".to_string()));
    }

    #[tokio::test]
    async fn a_damaged_log_is_compacted_instead_of_growing() {
        use crate::log_codec::{encode_event_log_record, read_event_log};

        let log = MemoryEventLog::default();
        let store = store_with_ticks("a", 3);
        EventStore::sync_with_local_storage(&store, &log, None, None)
            .await
            .unwrap();

        // break the JSON payload of the middle record, leaving its framing intact
        let records = parse_event_log_records(&log.raw_bytes("ticks").unwrap());
        let mut middle = encode_event_log_record(&records[1]).unwrap();
        middle[4 + 8 + 4 + "a".len() + 4] = b'#';
        let mut damaged = encode_event_log_records(&records[..1], true);
        damaged.extend(middle);
        damaged.extend(encode_event_log_records(&records[2..], false));
        log.set_raw_bytes("ticks", damaged);

        let first = EventStore::sync_with_local_storage(&store, &log, None, None)
            .await
            .unwrap();
        assert_eq!(first.written, 2);
        let compacted = log.raw_bytes("ticks").unwrap();

        let second = EventStore::sync_with_local_storage(&store, &log, None, None)
            .await
            .unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(log.raw_bytes("ticks").unwrap(), compacted);

        let contents = read_event_log(&compacted);
        assert!(contents.intact);
        assert_eq!(contents.records, records);

        let reader = store_with_ticks("b", 0);
        let loaded = EventStore::sync_with_local_storage(&reader, &log, None, None)
            .await
            .unwrap();
        assert_eq!(loaded.loaded, 3);
    }

    #[test]
    fn writer_ids_are_unique_while_claimed() {
        let log = MemoryEventLog::default();
        let other_tab = log.clone();
        assert_eq!(log.claim_writer("dev"), "dev");
        assert_eq!(other_tab.claim_writer("dev"), "dev.1");
        assert_eq!(log.claim_writer("dev"), "dev.2");

        other_tab.release_writer("dev.1");
        assert_eq!(log.claim_writer("dev"), "dev.1");
        assert_eq!(log.claim_writer("phone"), "phone");
    }

    #[tokio::test]
    async fn tabs_of_one_device_never_overwrite_each_other() {
        let log = MemoryEventLog::default();
        let tab_a = store_with_ticks("unused", 0);
        let tab_b = store_with_ticks("unused", 0);
        let writer_a = log.claim_writer("dev");
        let writer_b = log.clone().claim_writer("dev");

        tab_a
            .borrow_mut()
            .add_raw_event("ticks".to_string(), writer_a, Tick(1), None);
        tab_b
            .borrow_mut()
            .add_raw_event("ticks".to_string(), writer_b, Tick(2), None);

        let a = EventStore::sync_with_local_storage(&tab_a, &log, None, None)
            .await
            .unwrap();
        let b = EventStore::sync_with_local_storage(&tab_b, &log, None, None)
            .await
            .unwrap();
        assert_eq!(a, LocalSyncResult { loaded: 0, written: 1 });
        assert_eq!(b, LocalSyncResult { loaded: 1, written: 1 });

        let a = EventStore::sync_with_local_storage(&tab_a, &log, None, None)
            .await
            .unwrap();
        assert_eq!(a.loaded, 1);

        let ticks = |store: &RefCell<EventStore<String, String>>| -> Vec<Tick> {
            store
                .borrow()
                .get::<Tick>("ticks".to_string())
                .unwrap()
                .iter()
                .map(|event| event.event.clone())
                .collect()
        };
        assert_eq!(ticks(&tab_a), vec![Tick(1), Tick(2)]);
        assert_eq!(ticks(&tab_a), ticks(&tab_b));
        assert_eq!(parse_event_log_records(&log.raw_bytes("ticks").unwrap()).len(), 2);
    }

    #[test]
    fn stream_ids_cannot_escape_the_user_directory() {
        assert!(validate_stream_id("reviews").is_ok());
        assert!(validate_stream_id("../reviews").is_err());
        assert!(validate_stream_id("").is_err());
    }
}
