//! # Event
//! Anything that can be stored in a stream. Events are persisted and replicated as JSON,
//! so an event type decides its own (versioned) JSON representation.

pub trait Event: Sized + Clone + Ord {
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;

    fn from_json(json: &serde_json::Value) -> Result<Self, serde_json::Error>;
}
