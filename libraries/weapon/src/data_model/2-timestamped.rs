//! # Timestamped
//! The envelope every event is stored in. The envelope is what makes merging possible:
//! `within_device_events_index` orders events from one device, and `logical_clock` is a
//! Lamport clock that orders events across devices without trusting wall clocks.

use chrono::{DateTime, Utc};

use crate::data_model::Event;

/// Field order matters: the derived `Ord` sorts events of one device by their index first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Timestamped<E> {
    #[serde(rename = "sequence_no", alias = "within_device_events_index")]
    pub within_device_events_index: usize,
    /// Events written before logical clocks existed deserialize with a clock of 0.
    #[serde(default)]
    pub logical_clock: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "payload", alias = "event")]
    pub event: E,
}

impl<E> Timestamped<E> {
    pub fn within_device_events_index(&self) -> usize {
        self.within_device_events_index
    }

    pub fn map<F, A>(self, f: F) -> Timestamped<A>
    where
        F: FnOnce(E) -> A,
    {
        Timestamped {
            within_device_events_index: self.within_device_events_index,
            logical_clock: self.logical_clock,
            timestamp: self.timestamp,
            event: f(self.event),
        }
    }

    pub fn as_ref(&self) -> Timestamped<&E> {
        Timestamped {
            within_device_events_index: self.within_device_events_index,
            logical_clock: self.logical_clock,
            timestamp: self.timestamp,
            event: &self.event,
        }
    }
}

impl<E, Error> Timestamped<Result<E, Error>> {
    pub fn transpose(self) -> Result<Timestamped<E>, Error> {
        Ok(Timestamped {
            within_device_events_index: self.within_device_events_index,
            logical_clock: self.logical_clock,
            timestamp: self.timestamp,
            event: self.event?,
        })
    }
}

impl<E: Event> Event for Timestamped<E> {
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        let envelope = self.as_ref().map(|event| event.to_json()).transpose()?;
        serde_json::to_value(envelope)
    }

    fn from_json(json: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let envelope: Timestamped<serde_json::Value> = serde_json::from_value(json.clone())?;
        envelope.map(|event| E::from_json(&event)).transpose()
    }
}

/// Identifies one event across every replica.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct EventKey {
    pub device_id: String,
    pub stream_id: String,
    pub sequence_no: usize,
}

/// An event as it travels between replicas: the envelope plus where it came from.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WireEvent<E> {
    pub device_id: String,
    pub stream_id: String,
    #[serde(flatten)]
    pub event: Timestamped<E>,
}

impl<E> WireEvent<E> {
    pub fn key(&self) -> EventKey {
        EventKey {
            device_id: self.device_id.clone(),
            stream_id: self.stream_id.clone(),
            sequence_no: self.event.within_device_events_index,
        }
    }
}
