//! Event logs in ordinary files, for native hosts.
//!
//! ```text
//! <root>/.weapon/device-id                      this device's id while logged in
//! <root>/.weapon/device-id-logged-out           ... and while logged out
//! <root>/.weapon/user-events/user__<user>/stream__<stream>/events.blob
//! <root>/.weapon/user-events/user__<user>/writers/<writer id>   locked while a store writes as it
//! ```
//!
//! A save never edits the live file in place: the new log is written next to it, flushed, and
//! renamed over it, so a crash leaves either the old or the new log. Saves to one stream are
//! serialized by a lock shared by every handle in the process, and the lock holder re-reads
//! what is on disk before writing, so two tabs saving at once never write an event twice.
//!
//! Writer ids are claimed by locking a file named after them. The operating system drops the
//! lock when the process exits, so a crashed session leaves its id free.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use tokio::io::AsyncWriteExt as _;

use crate::{
    log_codec::{
        EVENTS_FILE_NAME, EventLogRecord, encode_event_log_records, parse_device_counts,
        parse_event_log_records,
    },
    persistence::{
        EventLog, LOGGED_OUT_USER, PersistenceError, SavePlan, validate_stream_id, writer_id,
    },
};

/// The event logs of one user, kept in ordinary files.
#[derive(Debug, Clone)]
pub struct FsEventLog {
    user_directory: PathBuf,
    locks: StreamLocks,
    writers: WriterFiles,
}

type StreamLocks = Arc<tokio::sync::Mutex<BTreeMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>;

/// The locked file behind each writer id this process holds.
type WriterFiles = Arc<std::sync::Mutex<BTreeMap<String, std::fs::File>>>;

static STREAM_LOCKS: LazyLock<StreamLocks> = LazyLock::new(StreamLocks::default);

impl FsEventLog {
    fn stream_directory(&self, stream_id: &str) -> Result<PathBuf, PersistenceError> {
        validate_stream_id(stream_id)?;
        Ok(self.user_directory.join(format!("stream__{stream_id}")))
    }

    fn events_file(&self, stream_id: &str) -> Result<PathBuf, PersistenceError> {
        Ok(self.stream_directory(stream_id)?.join(EVENTS_FILE_NAME))
    }

    pub fn user_directory(&self) -> &Path {
        &self.user_directory
    }

    async fn stream_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    fn try_claim_writer(&self, device_id: &str) -> Result<String, PersistenceError> {
        if device_id.is_empty() || device_id.contains(['/', '\\', '\0']) || device_id.starts_with('.') {
            return Err(PersistenceError::Backend(format!(
                "device id {device_id:?} cannot name a writer file"
            )));
        }
        let directory = self.user_directory.join("writers");
        std::fs::create_dir_all(&directory)?;

        let mut held = self
            .writers
            .lock()
            .map_err(|_| PersistenceError::Backend("writer registry poisoned".to_string()))?;
        let mut slot = 0;
        loop {
            let writer_id = writer_id(device_id, slot);
            slot += 1;
            if held.contains_key(&writer_id) {
                continue;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(directory.join(&writer_id))?;
            match file.try_lock() {
                Ok(()) => {
                    held.insert(writer_id.clone(), file);
                    return Ok(writer_id);
                }
                Err(std::fs::TryLockError::WouldBlock) => continue,
                Err(std::fs::TryLockError::Error(e)) => return Err(e.into()),
            }
        }
    }
}

async fn read_or_empty(path: &Path) -> Result<Vec<u8>, PersistenceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Writes `bytes` next to `path`, flushes them, and renames them over `path`.
async fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(EVENTS_FILE_NAME);
    let temporary = path.with_file_name(format!("{file_name}.tmp-{}", uuid::Uuid::new_v4()));

    let mut file = tokio::fs::File::create(&temporary).await?;
    let written = async {
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&temporary).await;
        return Err(e.into());
    }

    tokio::fs::rename(&temporary, path).await?;
    Ok(())
}

impl EventLog for FsEventLog {
    async fn load(&self, stream_id: &str) -> Result<Vec<EventLogRecord>, PersistenceError> {
        let bytes = read_or_empty(&self.events_file(stream_id)?).await?;
        Ok(parse_event_log_records(&bytes))
    }

    async fn save(&self, stream_id: &str, records: &[EventLogRecord]) -> Result<usize, PersistenceError> {
        if records.is_empty() {
            return Ok(0);
        }
        let path = self.events_file(stream_id)?;
        let lock = self.stream_lock(&path).await;
        let _guard = lock.lock().await;

        let mut existing = read_or_empty(&path).await?;
        let plan = SavePlan::new(stream_id, &existing, records);
        let written = plan.written();
        let bytes = match plan {
            SavePlan::Unchanged => return Ok(0),
            SavePlan::Append(missing) => {
                let include_header = existing.is_empty();
                existing.extend(encode_event_log_records(&missing, include_header));
                existing
            }
            SavePlan::Rewrite { records, .. } => {
                let damaged = path.with_file_name(format!("{EVENTS_FILE_NAME}.damaged"));
                log::error!(
                    "Event log for stream {stream_id} is damaged, keeping a copy at {}",
                    damaged.display()
                );
                replace_file(&damaged, &existing).await?;
                encode_event_log_records(&records, true)
            }
        };

        tokio::fs::create_dir_all(self.stream_directory(stream_id)?).await?;
        replace_file(&path, &bytes).await?;

        Ok(written)
    }

    async fn device_counts(&self, stream_id: &str) -> Result<BTreeMap<String, usize>, PersistenceError> {
        let bytes = read_or_empty(&self.events_file(stream_id)?).await?;
        Ok(parse_device_counts(&bytes))
    }

    async fn stream_ids(&self) -> Result<Vec<String>, PersistenceError> {
        let mut entries = match tokio::fs::read_dir(&self.user_directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut stream_ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(stream_id) = name.to_str().and_then(|name| name.strip_prefix("stream__")) else {
                continue;
            };
            stream_ids.push(stream_id.to_string());
        }
        stream_ids.sort();
        Ok(stream_ids)
    }

    fn claim_writer(&self, device_id: &str) -> String {
        match self.try_claim_writer(device_id) {
            Ok(writer_id) => writer_id,
            Err(e) => {
                // a fresh id is never shared, at the cost of one more writer in the clock
                let writer_id = format!("{device_id}.{}", uuid::Uuid::new_v4().simple());
                log::error!("Could not claim a writer slot for {device_id}, writing as {writer_id}: {e:?}");
                writer_id
            }
        }
    }

    fn release_writer(&self, writer_id: &str) {
        match self.writers.lock() {
            // dropping the file releases its lock
            Ok(mut held) => drop(held.remove(writer_id)),
            Err(e) => log::error!("Could not release writer {writer_id}: {e}"),
        }
    }
}

/// The `.weapon` directory under an app's data root.
#[derive(Debug, Clone)]
pub struct WeaponDirectory {
    weapon_directory: PathBuf,
    locks: StreamLocks,
    writers: WriterFiles,
}

impl WeaponDirectory {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let weapon_directory = root.as_ref().join(".weapon");
        tokio::fs::create_dir_all(weapon_directory.join("user-events")).await?;
        Ok(Self {
            weapon_directory,
            locks: Arc::clone(&STREAM_LOCKS),
            writers: WriterFiles::default(),
        })
    }

    fn user_events_directory(&self) -> PathBuf {
        self.weapon_directory.join("user-events")
    }

    /// The event logs of `user_id`, or of the logged-out user.
    pub fn user_log(&self, user_id: Option<&str>) -> FsEventLog {
        let user_id = user_id.unwrap_or(LOGGED_OUT_USER);
        FsEventLog {
            user_directory: self.user_events_directory().join(format!("user__{user_id}")),
            locks: Arc::clone(&self.locks),
            writers: Arc::clone(&self.writers),
        }
    }

    /// Returns this device's id, creating and persisting a new one on first use.
    pub async fn get_or_create_device_id(&self, user_id: Option<&str>) -> Result<String, PersistenceError> {
        let file_name = if user_id.is_some() {
            "device-id"
        } else {
            "device-id-logged-out"
        };
        let path = self.weapon_directory.join(file_name);

        match tokio::fs::read(&path).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(device_id) if !device_id.trim().is_empty() => return Ok(device_id.trim().to_string()),
                _ => log::error!("Device ID file contained invalid data, generating a new ID"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let device_id = uuid::Uuid::new_v4().to_string();
        replace_file(&path, device_id.as_bytes()).await?;
        log::info!("Created device ID {device_id}");
        Ok(device_id)
    }

    /// Moves the events recorded while logged out into the account of the user who just
    /// logged in, so offline work is kept. Nothing happens if that user already has data.
    pub async fn import_logged_out_user_data(&self, user_id: &str) -> Result<usize, PersistenceError> {
        let logged_out = self.user_log(None);
        let logged_out_streams = logged_out.stream_ids().await?;
        if logged_out_streams.is_empty() {
            return Ok(0);
        }

        let current = self.user_log(Some(user_id));
        if !current.stream_ids().await?.is_empty() {
            return Ok(0);
        }

        let mut imported = 0;
        for stream_id in logged_out_streams {
            let records = logged_out.load(&stream_id).await?;
            if records.is_empty() {
                continue;
            }
            imported += current.save(&stream_id, &records).await?;
        }

        let _ = tokio::fs::remove_file(self.weapon_directory.join("device-id-logged-out")).await;
        if let Err(e) = tokio::fs::remove_dir_all(logged_out.user_directory()).await {
            log::error!("Failed to remove logged-out user directory: {e:?}");
        }

        log::info!("Imported {imported} logged-out event(s) for user {user_id}");
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::EventStore;
    use crate::persistence::tests::{Tick, store_with_ticks};

    #[tokio::test]
    async fn missing_stream_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let weapon = WeaponDirectory::open(dir.path()).await.unwrap();
        let log = weapon.user_log(Some("user"));
        assert!(log.load("reviews").await.unwrap().is_empty());
        assert!(log.device_counts("reviews").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn saved_events_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_ticks("device-a", 3);
        {
            let weapon = WeaponDirectory::open(dir.path()).await.unwrap();
            let log = weapon.user_log(Some("user"));
            let written = EventStore::save_to_local_storage(&store, &log, "ticks".to_string())
                .await
                .unwrap();
            assert_eq!(written, 3);
            // nothing new to write the second time
            let written = EventStore::save_to_local_storage(&store, &log, "ticks".to_string())
                .await
                .unwrap();
            assert_eq!(written, 0);
        }

        let weapon = WeaponDirectory::open(dir.path()).await.unwrap();
        let log = weapon.user_log(Some("user"));
        let reloaded = store_with_ticks("device-a", 0);
        let loaded = EventStore::load_from_local_storage(&reloaded, &log, "ticks".to_string(), None)
            .await
            .unwrap();
        assert_eq!(loaded, 3);
        assert_eq!(reloaded.borrow().vector_clock(), store.borrow().vector_clock());
        assert_eq!(log.stream_ids().await.unwrap(), vec!["ticks".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_saves_write_each_event_once() {
        let dir = tempfile::tempdir().unwrap();
        let weapon = WeaponDirectory::open(dir.path()).await.unwrap();
        let tab_a = weapon.user_log(Some("user"));
        let tab_b = weapon.user_log(Some("user"));
        let store = store_with_ticks("device-a", 5);

        let (a, b) = tokio::join!(
            EventStore::save_to_local_storage(&store, &tab_a, "ticks".to_string()),
            EventStore::save_to_local_storage(&store, &tab_b, "ticks".to_string()),
        );
        assert_eq!(a.unwrap() + b.unwrap(), 5);
        assert_eq!(tab_a.load("ticks").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn a_damaged_log_is_rewritten_with_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let weapon = WeaponDirectory::open(dir.path()).await.unwrap();
        let log = weapon.user_log(Some("user"));
        let store = store_with_ticks("device-a", 2);
        EventStore::save_to_local_storage(&store, &log, "ticks".to_string())
            .await
            .unwrap();

        // an interrupted write from some older version left half a record behind
        let path = log.events_file("ticks").unwrap();
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let intact_len = bytes.len();
        bytes.extend_from_slice(&[7, 0, 0]);
        tokio::fs::write(&path, &bytes).await.unwrap();

        store
            .borrow_mut()
            .add_raw_event("ticks".to_string(), "device-a".to_string(), Tick(2), None);
        let written = EventStore::save_to_local_storage(&store, &log, "ticks".to_string())
            .await
            .unwrap();
        assert_eq!(written, 1);

        assert_eq!(log.load("ticks").await.unwrap().len(), 3);
        let backup = path.with_file_name(format!("{EVENTS_FILE_NAME}.damaged"));
        assert_eq!(tokio::fs::read(backup).await.unwrap(), bytes);
        assert!(tokio::fs::read(&path).await.unwrap().len() > intact_len);
    }

    #[tokio::test]
    async fn separately_opened_logs_claim_different_writers() {
        let dir = tempfile::tempdir().unwrap();
        let first = WeaponDirectory::open(dir.path()).await.unwrap().user_log(Some("user"));
        let second = WeaponDirectory::open(dir.path()).await.unwrap().user_log(Some("user"));

        let a = first.claim_writer("dev");
        let b = second.claim_writer("dev");
        assert_eq!(a, "dev");
        assert_eq!(b, "dev.1");

        first.release_writer(&a);
        assert_eq!(second.claim_writer("dev"), "dev");
        // the writer files are not streams
        assert!(first.stream_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn device_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let weapon = WeaponDirectory::open(dir.path()).await.unwrap();
        let first = weapon.get_or_create_device_id(Some("user")).await.unwrap();
        let second = weapon.get_or_create_device_id(Some("user")).await.unwrap();
        let logged_out = weapon.get_or_create_device_id(None).await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first, logged_out);
    }

    #[tokio::test]
    async fn logged_out_data_moves_to_first_user() {
        let dir = tempfile::tempdir().unwrap();
        let weapon = WeaponDirectory::open(dir.path()).await.unwrap();
        let store = store_with_ticks("offline-device", 2);
        EventStore::save_to_local_storage(&store, &weapon.user_log(None), "ticks".to_string())
            .await
            .unwrap();

        let imported = weapon.import_logged_out_user_data("user").await.unwrap();
        assert_eq!(imported, 2);
        assert_eq!(weapon.user_log(Some("user")).load("ticks").await.unwrap().len(), 2);
        assert!(weapon.user_log(None).stream_ids().await.unwrap().is_empty());
    }
}
