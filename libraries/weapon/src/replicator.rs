//! Replicating streams through a central store.
//!
//! Two independent, best-effort paths:
//!
//! * **Push**: ask the remote how many events of each device it holds, then send everything
//!   beyond that. Nothing is considered sent until the remote accepts the batch, and the remote
//!   ignores rows it already has, so retrying after a failure never duplicates an event.
//! * **Pull**: rows written by the user's other devices arrive over a subscription and are
//!   merged. Rows from this device are our own echo and are ignored. A catch-up fetch covers
//!   whatever was missed while offline.
//!
//! Network failures are not errors for the app: they are logged and the next tick tries again.

use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use crate::data_model::{Clock, EventStore, ListenerKey, SyncTarget, Timestamped};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote store is unreachable")]
    Offline,
    #[error("remote store answered with status {status}: {body}")]
    Status { status: String, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not decode remote data: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One event as the central store keeps it.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RemoteRow {
    pub user_id: String,
    pub device_id: String,
    pub stream_id: String,
    /// The [`Timestamped`] envelope. Some transports deliver it as a JSON-encoded string.
    pub event: serde_json::Value,
}

impl RemoteRow {
    pub fn new(
        user_id: &str,
        device_id: &str,
        stream_id: &str,
        event: &Timestamped<serde_json::Value>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            stream_id: stream_id.to_string(),
            event: serde_json::to_value(event)?,
        })
    }

    pub fn timestamped(&self) -> Result<Timestamped<serde_json::Value>, serde_json::Error> {
        match &self.event {
            serde_json::Value::String(encoded) => serde_json::from_str(encoded),
            event => serde_json::from_value(event.clone()),
        }
    }
}

/// The central event store.
///
/// Implementations are used from a single thread, so their futures need not be `Send`.
#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    /// How many events of each device, per stream, the remote holds for this user.
    async fn get_clock(&self, user_id: &str) -> Result<Clock<String, String>, RemoteError>;

    /// Stores the rows. Rows the remote already holds are ignored.
    async fn push(&self, rows: &[RemoteRow]) -> Result<(), RemoteError>;

    /// Every row of the user that lies beyond `clock`.
    async fn fetch_since(
        &self,
        user_id: &str,
        clock: &Clock<String, String>,
    ) -> Result<Vec<RemoteRow>, RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Added,
    AlreadyKnown,
    /// The row came from this device.
    OwnEcho,
    /// Earlier events of the row's device are still missing. A catch-up fetch will bring them.
    OutOfOrder,
    /// The row belongs to a stream this replica has not requested, or could not be decoded.
    Ignored,
}

impl EventStore<String, String> {
    /// Sends every event the remote does not have yet. Returns how many rows were sent.
    pub async fn push_unacknowledged<R: RemoteStore>(
        store: &RefCell<EventStore<String, String>>,
        remote: &R,
        user_id: &str,
    ) -> Result<usize, RemoteError> {
        store.borrow_mut().mark_sync_started(SyncTarget::Remote);

        let result = Self::push_unacknowledged_inner(store, remote, user_id).await;

        match &result {
            Ok(_) => store.borrow_mut().mark_sync_finished(SyncTarget::Remote, None),
            Err(e) => store
                .borrow_mut()
                .mark_sync_finished(SyncTarget::Remote, Some(e.to_string())),
        }

        result
    }

    async fn push_unacknowledged_inner<R: RemoteStore>(
        store: &RefCell<EventStore<String, String>>,
        remote: &R,
        user_id: &str,
    ) -> Result<usize, RemoteError> {
        let remote_clock = remote.get_clock(user_id).await?;

        // collect first, so that no borrow is held across the push
        let mut rows = Vec::new();
        let mut pushed_clock = remote_clock.clone();
        {
            let store_ref = store.borrow();
            for (stream_id, stream) in store_ref.iter() {
                for (device_id, count) in stream.num_events_per_device() {
                    let on_remote = remote_clock
                        .get(stream_id)
                        .and_then(|devices| devices.get(device_id))
                        .copied()
                        .unwrap_or(0);
                    if on_remote >= count {
                        continue;
                    }
                    let events = stream.jsons(device_id, on_remote);
                    for event in &events {
                        rows.push(RemoteRow::new(user_id, device_id, stream_id, event)?);
                    }
                    pushed_clock
                        .entry(stream_id.clone())
                        .or_default()
                        .insert(device_id.clone(), on_remote + events.len());
                }
            }
        }

        if !rows.is_empty() {
            log::info!("Uploading {} events", rows.len());
            remote.push(&rows).await?;
        }

        store
            .borrow_mut()
            .update_sync_clock(SyncTarget::Remote, pushed_clock);
        Ok(rows.len())
    }

    /// Merges a row delivered by the remote.
    pub fn ingest_remote_row(
        store: &RefCell<EventStore<String, String>>,
        row: &RemoteRow,
        own_device_id: &str,
        modifier: Option<ListenerKey>,
    ) -> IngestOutcome {
        if row.device_id == own_device_id {
            return IngestOutcome::OwnEcho;
        }

        let event = match row.timestamped() {
            Ok(event) => event,
            Err(e) => {
                log::error!("Could not decode remote row from device {}: {e}", row.device_id);
                return IngestOutcome::Ignored;
            }
        };

        let mut store = store.borrow_mut();
        let Some(known) = store.get_raw(row.stream_id.clone()).map(|stream| {
            stream
                .num_events_per_device()
                .get(&row.device_id)
                .copied()
                .unwrap_or(0)
        }) else {
            log::debug!("Ignoring remote row for unrequested stream {}", row.stream_id);
            return IngestOutcome::Ignored;
        };

        let index = event.within_device_events_index;
        if index < known {
            return IngestOutcome::AlreadyKnown;
        }
        if index > known {
            log::warn!(
                "Remote event {index} of device {} arrived before event {known}",
                row.device_id
            );
            return IngestOutcome::OutOfOrder;
        }

        let added = store.add_device_events_jsons(
            row.stream_id.clone(),
            row.device_id.clone(),
            vec![event],
            modifier,
        );
        if added > 0 {
            IngestOutcome::Added
        } else {
            IngestOutcome::Ignored
        }
    }

    /// Fetches and merges everything the remote has that this replica lacks.
    /// Returns how many events were added.
    pub async fn pull_missing<R: RemoteStore>(
        store: &RefCell<EventStore<String, String>>,
        remote: &R,
        user_id: &str,
        modifier: Option<ListenerKey>,
    ) -> Result<usize, RemoteError> {
        // this device's own rows are fetched too: they restore a replica whose local storage was lost
        let clock = store.borrow().vector_clock();
        let rows = remote.fetch_since(user_id, &clock).await?;

        // group per device so each batch is merged in one contiguous piece
        let mut batches: BTreeMap<(String, String), Vec<Timestamped<serde_json::Value>>> =
            BTreeMap::new();
        for row in rows {
            match row.timestamped() {
                Ok(event) => batches
                    .entry((row.stream_id.clone(), row.device_id.clone()))
                    .or_default()
                    .push(event),
                Err(e) => log::error!("Could not decode remote row: {e}"),
            }
        }

        let mut added = 0;
        let mut store = store.borrow_mut();
        for ((stream_id, device_id), events) in batches {
            added += store.add_device_events_jsons(stream_id, device_id, events, modifier);
        }
        if added > 0 {
            log::info!("Downloaded {added} events");
        }
        Ok(added)
    }
}

/// Runs the push and pull paths for one store.
///
/// Every push runs as its own task, so a push stuck on the network never delays the next tick.
#[cfg(not(target_arch = "wasm32"))]
pub struct Replicator<R> {
    store: Rc<RefCell<EventStore<String, String>>>,
    remote: Rc<R>,
    user_id: String,
    device_id: String,
    after_merge: Option<Rc<dyn Fn()>>,
}

#[cfg(not(target_arch = "wasm32"))]
impl<R: RemoteStore + 'static> Replicator<R> {
    pub fn new(
        store: Rc<RefCell<EventStore<String, String>>>,
        remote: Rc<R>,
        user_id: String,
        device_id: String,
    ) -> Self {
        Self {
            store,
            remote,
            user_id,
            device_id,
            after_merge: None,
        }
    }

    /// Called whenever the pull path added events, outside any borrow of the store.
    pub fn with_after_merge(mut self, after_merge: impl Fn() + 'static) -> Self {
        self.after_merge = Some(Rc::new(after_merge));
        self
    }

    /// Pushes now, in the background. Must be called from within a `LocalSet`.
    pub fn request_push(&self) -> tokio::task::JoinHandle<usize> {
        let store = Rc::clone(&self.store);
        let remote = Rc::clone(&self.remote);
        let user_id = self.user_id.clone();
        tokio::task::spawn_local(async move {
            match EventStore::push_unacknowledged(&store, remote.as_ref(), &user_id).await {
                Ok(pushed) => pushed,
                Err(e) => {
                    log::warn!("Push failed, will retry on the next tick: {e}");
                    0
                }
            }
        })
    }

    /// Pushes every `interval`, forever. Must be run within a `LocalSet`.
    pub async fn run_push_loop(&self, interval: std::time::Duration) {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            // detached: the next tick does not wait for this push
            drop(self.request_push());
        }
    }

    /// Catches up with the remote, then merges rows from the subscription until it ends.
    pub async fn run_pull_loop(&self, mut rows: impl futures::Stream<Item = RemoteRow> + Unpin) {
        use futures::StreamExt as _;

        self.catch_up().await;
        while let Some(row) = rows.next().await {
            if row.user_id != self.user_id {
                continue;
            }
            let outcome = EventStore::ingest_remote_row(&self.store, &row, &self.device_id, None);
            match outcome {
                IngestOutcome::Added => self.merged(),
                IngestOutcome::OutOfOrder => {
                    self.catch_up().await;
                }
                IngestOutcome::AlreadyKnown | IngestOutcome::OwnEcho | IngestOutcome::Ignored => {}
            }
        }
        log::info!("Remote subscription ended");
    }

    /// Fetches whatever the remote has that this replica lacks. Failures are logged.
    pub async fn catch_up(&self) -> usize {
        match EventStore::pull_missing(&self.store, self.remote.as_ref(), &self.user_id, None)
        .await
        {
            Ok(added) => {
                if added > 0 {
                    self.merged();
                }
                added
            }
            Err(e) => {
                log::warn!("Catch-up fetch failed: {e}");
                0
            }
        }
    }

    fn merged(&self) {
        if let Some(after_merge) = &self.after_merge {
            after_merge();
        }
    }
}

/// An in-process central store, for tests and for running several replicas side by side.
/// Clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Rc<RefCell<MemoryRemoteInner>>,
}

#[derive(Default)]
struct MemoryRemoteInner {
    rows: Vec<RemoteRow>,
    keys: std::collections::BTreeSet<(String, String, String, usize)>,
    offline: bool,
    subscribers: Vec<(String, futures::channel::mpsc::UnboundedSender<RemoteRow>)>,
}

impl MemoryRemote {
    pub fn set_online(&self, online: bool) {
        self.inner.borrow_mut().offline = !online;
    }

    pub fn rows(&self) -> Vec<RemoteRow> {
        self.inner.borrow().rows.clone()
    }

    /// Rows of `user_id` written from now on, including this replica's own.
    pub fn subscribe(&self, user_id: &str) -> futures::channel::mpsc::UnboundedReceiver<RemoteRow> {
        let (sender, receiver) = futures::channel::mpsc::unbounded();
        self.inner
            .borrow_mut()
            .subscribers
            .push((user_id.to_string(), sender));
        receiver
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.inner.borrow().offline {
            Err(RemoteError::Offline)
        } else {
            Ok(())
        }
    }
}

impl RemoteStore for MemoryRemote {
    async fn get_clock(&self, user_id: &str) -> Result<Clock<String, String>, RemoteError> {
        self.check_online()?;
        let mut clock: Clock<String, String> = BTreeMap::new();
        for (row_user, stream_id, device_id, _) in self.inner.borrow().keys.iter() {
            if row_user == user_id {
                *clock
                    .entry(stream_id.clone())
                    .or_default()
                    .entry(device_id.clone())
                    .or_default() += 1;
            }
        }
        Ok(clock)
    }

    async fn push(&self, rows: &[RemoteRow]) -> Result<(), RemoteError> {
        self.check_online()?;
        let mut inner = self.inner.borrow_mut();
        for row in rows {
            let index = row.timestamped()?.within_device_events_index;
            let key = (
                row.user_id.clone(),
                row.stream_id.clone(),
                row.device_id.clone(),
                index,
            );
            if !inner.keys.insert(key) {
                continue;
            }
            inner.rows.push(row.clone());
            inner.subscribers.retain(|(subscriber, sender)| {
                *subscriber != row.user_id || sender.unbounded_send(row.clone()).is_ok()
            });
        }
        Ok(())
    }

    async fn fetch_since(
        &self,
        user_id: &str,
        clock: &Clock<String, String>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        self.check_online()?;
        let inner = self.inner.borrow();
        let mut rows = Vec::new();
        for row in inner.rows.iter().filter(|row| row.user_id == user_id) {
            let known = clock
                .get(&row.stream_id)
                .and_then(|devices| devices.get(&row.device_id))
                .copied()
                .unwrap_or(0);
            if row.timestamped()?.within_device_events_index >= known {
                rows.push(row.clone());
            }
        }
        Ok(rows)
    }
}
