//! Keeping tabs that share local storage in step.
//!
//! When one tab writes events to local storage it announces `{"type": "written", "stream_id": ...}`
//! on a channel every tab of the origin listens to. The message carries no events: a tab that
//! hears it reloads the stream from local storage and merges. Merging is idempotent, so a lost,
//! duplicated or reordered message can at worst delay a tab, never corrupt it.

use std::{cell::RefCell, rc::Rc};

use futures::{FutureExt as _, StreamExt as _, channel::mpsc};
use slotmap::SlotMap;

use crate::{
    data_model::{EventStore, ListenerKey},
    persistence::{EventLog, PersistenceError},
};

/// Name of the browser `BroadcastChannel` the announcements travel on.
pub const BROADCAST_CHANNEL_NAME: &str = "weapon-opfs-sync";

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrossTabMessage {
    Written { stream_id: String },
}

impl CrossTabMessage {
    pub fn stream_id(&self) -> &str {
        match self {
            CrossTabMessage::Written { stream_id } => stream_id,
        }
    }
}

slotmap::new_key_type! {
    pub struct TabKey;
}

/// An in-process broadcast channel with the semantics of the browser's `BroadcastChannel`:
/// every joined tab receives each message except the tab that posted it.
#[derive(Clone, Default)]
pub struct TabBus {
    tabs: Rc<RefCell<SlotMap<TabKey, mpsc::UnboundedSender<CrossTabMessage>>>>,
}

impl TabBus {
    pub fn join(&self) -> TabChannel {
        let (sender, receiver) = mpsc::unbounded();
        let key = self.tabs.borrow_mut().insert(sender);
        TabChannel {
            key,
            bus: self.clone(),
            receiver,
        }
    }

    pub fn num_tabs(&self) -> usize {
        self.tabs.borrow().len()
    }
}

/// One tab's end of a [`TabBus`]. Leaves the bus when dropped.
pub struct TabChannel {
    key: TabKey,
    bus: TabBus,
    receiver: mpsc::UnboundedReceiver<CrossTabMessage>,
}

impl TabChannel {
    pub fn post(&self, message: &CrossTabMessage) {
        let tabs = self.bus.tabs.borrow();
        for (key, sender) in tabs.iter() {
            if key == self.key {
                continue;
            }
            // a tab that is shutting down may already have dropped its receiver
            let _ = sender.unbounded_send(message.clone());
        }
    }

    /// Tells the other tabs that `stream_id` has new events in local storage.
    pub fn announce_written(&self, stream_id: &str) {
        log::debug!("Broadcasting written message for stream: {stream_id}");
        self.post(&CrossTabMessage::Written {
            stream_id: stream_id.to_string(),
        });
    }

    /// Waits for the next message from another tab.
    pub async fn recv(&mut self) -> Option<CrossTabMessage> {
        self.receiver.next().await
    }

    /// Returns a message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<CrossTabMessage> {
        self.receiver.next().now_or_never().flatten()
    }
}

impl Drop for TabChannel {
    fn drop(&mut self) {
        self.bus.tabs.borrow_mut().remove(self.key);
    }
}

impl EventStore<String, String> {
    /// Saves the stream and, if anything was written, tells the other tabs.
    pub async fn save_and_announce<L: EventLog>(
        store: &RefCell<EventStore<String, String>>,
        event_log: &L,
        channel: &TabChannel,
        stream_id: String,
    ) -> Result<usize, PersistenceError> {
        let written = Self::save_to_local_storage(store, event_log, stream_id.clone()).await?;
        if written > 0 {
            channel.announce_written(&stream_id);
        }
        Ok(written)
    }

    /// Reacts to another tab's announcement by reloading the stream it wrote.
    /// Streams this tab has not requested are ignored.
    pub async fn handle_cross_tab_message<L: EventLog>(
        store: &RefCell<EventStore<String, String>>,
        event_log: &L,
        message: &CrossTabMessage,
        modifier: Option<ListenerKey>,
    ) -> Result<usize, PersistenceError> {
        let stream_id = message.stream_id().to_string();
        if store.borrow().get_raw(stream_id.clone()).is_none() {
            log::debug!("Ignoring write announcement for unrequested stream {stream_id}");
            return Ok(0);
        }
        Self::load_from_local_storage(store, event_log, stream_id, modifier).await
    }
}
