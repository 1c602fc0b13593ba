//! A trait for EventStreamStores, that allows type erasure

use std::{any::Any, collections::BTreeMap};

use crate::data_model::{EventStreamStore, Timestamped, ValidToAddEvents};

pub trait StreamStore<Device>: Any {
    fn num_events_per_device(&self) -> BTreeMap<&Device, usize>;

    fn num_events(&self) -> usize {
        self.num_events_per_device().values().sum()
    }

    fn max_logical_clock(&self) -> u64;

    /// The events of `device` from index `skip` onwards, as JSON envelopes.
    fn jsons(&self, device: &Device, skip: usize) -> Vec<Timestamped<serde_json::Value>>;

    fn valid_to_add_event_jsons(
        &self,
        device: &Device,
        events: Vec<Timestamped<serde_json::Value>>,
    ) -> Option<ValidToAddEvents<Timestamped<serde_json::Value>>>;

    fn add_device_event_jsons(
        &mut self,
        device: Device,
        events: ValidToAddEvents<Timestamped<serde_json::Value>>,
    ) -> usize;

    fn timestamp_of_earliest_unsynced_event(
        &self,
        sync_state: &BTreeMap<Device, usize>,
    ) -> Option<chrono::DateTime<chrono::Utc>>;
}

impl<Device: Ord + Clone + 'static, Event: crate::data_model::Event + 'static> StreamStore<Device>
    for EventStreamStore<Device, Timestamped<Event>>
{
    fn num_events_per_device(&self) -> BTreeMap<&Device, usize> {
        self.events()
            .iter()
            .map(|(device, events)| (device, events.len()))
            .collect()
    }

    fn max_logical_clock(&self) -> u64 {
        EventStreamStore::max_logical_clock(self)
    }

    fn jsons(&self, device: &Device, skip: usize) -> Vec<Timestamped<serde_json::Value>> {
        let Some(events) = self.events().get(device) else {
            return Vec::new();
        };
        let mut jsons = Vec::new();
        for event in events.iter().skip(skip) {
            match event.as_ref().map(|event| event.to_json()).transpose() {
                Ok(json) => jsons.push(json),
                Err(e) => {
                    // stop here so that the returned events stay contiguous
                    log::error!(
                        "Error serializing event {}: {e:?}",
                        event.within_device_events_index
                    );
                    break;
                }
            }
        }
        jsons
    }

    fn valid_to_add_event_jsons(
        &self,
        device: &Device,
        events: Vec<Timestamped<serde_json::Value>>,
    ) -> Option<ValidToAddEvents<Timestamped<serde_json::Value>>> {
        self.valid_to_add_events(device, events)
    }

    fn add_device_event_jsons(
        &mut self,
        device: Device,
        events: ValidToAddEvents<Timestamped<serde_json::Value>>,
    ) -> usize {
        let (events, malformed) = events.map_prefix(|event| {
            Event::from_json(&event).inspect_err(|e| {
                log::error!("Error deserializing event JSON into event type: {e:?} in `{event}`");
            })
        });
        if let Some((index, _)) = malformed {
            // later events of this device wait until the malformed one can be read
            log::warn!(
                "Keeping {} event(s) before malformed event {index}; the rest of the batch is skipped",
                events.len()
            );
        }
        self.add_device_events(device, events)
    }

    fn timestamp_of_earliest_unsynced_event(
        &self,
        sync_state: &BTreeMap<Device, usize>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        let mut earliest: Option<_> = None;
        for (device_id, events_set) in self.events() {
            let synced_count = sync_state.get(device_id).copied().unwrap_or(0);

            if events_set.len() > synced_count {
                if let Some(ev) = events_set
                    .iter()
                    .find(|e| e.within_device_events_index == synced_count)
                {
                    let candidate = ev.timestamp;
                    earliest = match earliest {
                        None => Some(candidate),
                        Some(current) => Some(current.min(candidate)),
                    };
                }
            }
        }
        earliest
    }
}
