//! # EventStreamStore
//! Weapon allows multiple "event streams" to be created. Each event stream combines events from all of a user's devices.
//! For example, a spaced-repetition app keeps its reviews in one stream and the learner's course selection in another.
//! Streams are the unit of persistence, sync and subscription.

use std::collections::{BTreeMap, BTreeSet};

use crate::data_model::Timestamped;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct EventStreamStore<Device: Ord + Clone, Event: Ord + Clone> {
    events: BTreeMap<Device, BTreeSet<Event>>,
    /// Highest Lamport clock seen in this stream, local or remote.
    max_logical_clock: u64,
}

impl<Device: Ord + Clone, Event: Ord + Clone> EventStreamStore<Device, Event> {
    pub fn events(&self) -> &BTreeMap<Device, BTreeSet<Event>> {
        &self.events
    }

    pub fn max_logical_clock(&self) -> u64 {
        self.max_logical_clock
    }

    pub fn num_events(&self) -> usize {
        self.events.values().map(BTreeSet::len).sum()
    }
}

impl<Device: Ord + Clone, Event: Ord + Clone> Default for EventStreamStore<Device, Event> {
    fn default() -> Self {
        Self {
            events: BTreeMap::new(),
            max_logical_clock: 0,
        }
    }
}

impl<Device: Ord + Clone, Event: Ord + Clone> EventStreamStore<Device, Timestamped<Event>> {
    pub fn len_device(&self, device: &Device) -> usize {
        self.events.get(device).map(|set| set.len()).unwrap_or(0)
    }

    /// The clock the next locally created event gets.
    pub fn next_logical_clock(&self) -> u64 {
        self.max_logical_clock + 1
    }

    /// Filters a batch of events from one device down to the part that can be appended.
    ///
    /// Events this store already has are dropped, which is what makes merging idempotent.
    /// The remainder must continue the device's sequence without gaps; anything after a gap
    /// is rejected and will arrive again on a later sync.
    pub(crate) fn valid_to_add_events<A>(
        &self,
        key: &Device,
        mut events: Vec<Timestamped<A>>,
    ) -> Option<ValidToAddEvents<Timestamped<A>>> {
        let expected_index = self.len_device(key);

        events.retain(|event| event.within_device_events_index >= expected_index);
        events.sort_by_key(|event| event.within_device_events_index);
        events.dedup_by_key(|event| event.within_device_events_index);

        // Early return if nothing new is left
        if events.is_empty() {
            return None;
        }

        if events[0].within_device_events_index != expected_index {
            log::warn!(
                "Event out of order - expected index {}, got {}",
                expected_index,
                events[0].within_device_events_index
            );
            return None;
        }

        let contiguous = events
            .iter()
            .enumerate()
            .take_while(|(offset, event)| event.within_device_events_index == expected_index + offset)
            .count();
        if contiguous < events.len() {
            log::warn!(
                "Gap detected in events after index {}, dropping {} event(s)",
                expected_index + contiguous - 1,
                events.len() - contiguous
            );
            events.truncate(contiguous);
        }

        Some(ValidToAddEvents { events })
    }

    pub(crate) fn add_device_events(
        &mut self,
        key: Device,
        events: ValidToAddEvents<Timestamped<Event>>,
    ) -> usize {
        let mut events_added = 0;

        // double check the events are still valid
        let Some(events) = self.valid_to_add_events(&key, events.events) else {
            return events_added;
        };

        let stream = self.events.entry(key).or_default();

        for event in events.events {
            self.max_logical_clock = self.max_logical_clock.max(event.logical_clock);
            events_added += 1;
            stream.insert(event);
        }

        events_added
    }

    /// All events in replay order, together with the device that created them.
    ///
    /// Each device's events come out in sequence order. Across devices the order is
    /// `(logical_clock, device)`, so every replica that holds the same events replays them
    /// identically.
    pub fn iter_with_device(&self) -> impl Iterator<Item = (&Device, &Timestamped<Event>)> {
        // Collect all iterators from the per-device sets
        let mut iters: Vec<_> = self
            .events
            .iter()
            .map(|(device, set)| (device, set.iter().peekable()))
            .collect();

        // k-way merge; devices are visited in ascending order so `<` breaks clock ties by device
        std::iter::from_fn(move || {
            let mut min_idx = None;
            let mut min_clock = None;

            for (idx, (_, iter)) in iters.iter_mut().enumerate() {
                if let Some(val) = iter.peek() {
                    if min_clock.is_none_or(|min| val.logical_clock < min) {
                        min_idx = Some(idx);
                        min_clock = Some(val.logical_clock);
                    }
                }
            }

            let idx = min_idx?;
            let (device, iter) = &mut iters[idx];
            let device: &Device = *device;
            iter.next().map(|event| (device, event))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Timestamped<Event>> {
        self.iter_with_device().map(|(_, event)| event)
    }
}

impl<Device: Ord + Clone + AsRef<str>, Event: crate::Event> EventStreamStore<Device, Timestamped<Event>> {
    pub fn state<A>(&self, initial_state: A::Partial) -> A
    where
        A: crate::PartialAppState<Event = Event>,
    {
        apply_events(
            self.iter_with_device()
                .map(|(device, event)| (device.as_ref(), event)),
            initial_state,
        )
    }
}

pub(crate) fn apply_events<'a, E: crate::data_model::Event + 'a, A>(
    events: impl Iterator<Item = (&'a str, &'a Timestamped<E>)>,
    initial_state: A::Partial,
) -> A
where
    A: crate::PartialAppState<Event = E>,
{
    let mut state = initial_state;
    // Process all events efficiently without finalizing
    for (device, event) in events {
        state = A::process_event(state, device, event);
    }

    // Finalize once at the end
    A::finalize(state)
}

pub struct ValidToAddEvents<Event> {
    events: Vec<Event>,
}

impl<Event> ValidToAddEvents<Event> {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<Event> ValidToAddEvents<Timestamped<Event>> {
    /// Converts the events one at a time, keeping everything before the first failure.
    ///
    /// The result is still contiguous. The failure, if any, comes back with its index.
    pub(crate) fn map_prefix<A, Error>(
        self,
        f: impl Fn(Event) -> Result<A, Error>,
    ) -> (ValidToAddEvents<Timestamped<A>>, Option<(usize, Error)>) {
        let mut events = Vec::with_capacity(self.events.len());
        for timestamped in self.events {
            let index = timestamped.within_device_events_index;
            match timestamped.map(&f).transpose() {
                Ok(event) => events.push(event),
                Err(e) => return (ValidToAddEvents { events }, Some((index, e))),
            }
        }
        (ValidToAddEvents { events }, None)
    }
}
