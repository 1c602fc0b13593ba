//! Event logs in the browser's origin private file system.
//!
//! Layout: `user__<user_id>/stream__<stream_id>/events.blob`, one log per stream, in the
//! [`crate::log_codec`] format. Every tab of the origin shares these files.
//!
//! Tabs have no shared memory to agree on writer ids through, so every opened store writes
//! under an id of its own, derived from the device id.

use std::collections::BTreeMap;

use futures::{Stream, StreamExt};
use opfs::{
    DirectoryEntry, DirectoryHandle as _, FileHandle as _, WritableFileStream as _,
    persistent::{self, DirectoryHandle, FileHandle},
};

use crate::{
    log_codec::{
        EVENT_LOG_HEADER_LEN, EVENTS_FILE_NAME, EventLogRecord, encode_event_log_record,
        encode_event_log_records, event_log_header_bytes, parse_device_counts,
        parse_event_log_records,
    },
    persistence::{EventLog, LOGGED_OUT_USER, PersistenceError, SavePlan, validate_stream_id},
};

impl From<persistent::Error> for PersistenceError {
    fn from(e: persistent::Error) -> Self {
        PersistenceError::Backend(format!("{e:?}"))
    }
}

#[derive(Debug, Clone)]
pub struct OpfsEventLog {
    user_directory: UserDirectory,
}

impl OpfsEventLog {
    pub async fn new(user_events_directory: &DirectoryHandle, user_id: &str) -> Result<Self, PersistenceError> {
        Ok(Self {
            user_directory: UserDirectory::new(user_events_directory, user_id).await?,
        })
    }

    /// Moves the logged-out user's events into this user's directory, the first time this user
    /// logs in on this device. Returns how many events were moved.
    pub async fn import_logged_out_user_data(
        &self,
        mut weapon_directory: DirectoryHandle,
        mut user_events_directory: DirectoryHandle,
    ) -> Result<usize, PersistenceError> {
        let logged_out_directory = match user_events_directory
            .get_directory_handle_with_options(
                &format!("user__{LOGGED_OUT_USER}"),
                &opfs::GetDirectoryHandleOptions { create: false },
            )
            .await
        {
            Ok(dir) => UserDirectory {
                directory_handle: dir,
            },
            Err(_) => return Ok(0),
        };

        let mut existing_streams = self.user_directory.event_stream_directories().await?;
        if existing_streams.next().await.is_some() {
            return Ok(0);
        }

        let mut moved = 0;
        let mut streams = logged_out_directory.event_stream_directories().await?;
        while let Some((stream_id, stream_dir)) = streams.next().await {
            let events = stream_dir.get_event_log_file().await?.read_records().await?;
            if events.is_empty() {
                continue;
            }
            let target_log = self
                .user_directory
                .get_stream_directory(&stream_id)
                .await?
                .get_event_log_file()
                .await?;
            target_log.append_records(&events).await?;
            moved += events.len();
        }

        let _ = weapon_directory.remove_entry("device-id-logged-out").await;
        let _ = user_events_directory
            .remove_entry_with_options(
                &format!("user__{LOGGED_OUT_USER}"),
                &opfs::FileSystemRemoveOptions { recursive: true },
            )
            .await
            .inspect_err(|e| log::error!("Failed to remove logged-out user directory: {e:?}"));

        Ok(moved)
    }
}

impl EventLog for OpfsEventLog {
    async fn load(&self, stream_id: &str) -> Result<Vec<EventLogRecord>, PersistenceError> {
        validate_stream_id(stream_id)?;
        let file = self
            .user_directory
            .get_stream_directory(stream_id)
            .await?
            .get_event_log_file()
            .await?;
        Ok(file.read_records().await?)
    }

    async fn save(&self, stream_id: &str, records: &[EventLogRecord]) -> Result<usize, PersistenceError> {
        validate_stream_id(stream_id)?;
        let file = self
            .user_directory
            .get_stream_directory(stream_id)
            .await?
            .get_event_log_file()
            .await?;
        let existing = file.file_handle.read().await?;
        let plan = SavePlan::new(stream_id, &existing, records);
        let written = plan.written();
        match plan {
            SavePlan::Unchanged => {}
            SavePlan::Append(missing) => file.append_records(&missing).await?,
            SavePlan::Rewrite { records, .. } => file.replace_records(&records).await?,
        }
        Ok(written)
    }

    async fn device_counts(&self, stream_id: &str) -> Result<BTreeMap<String, usize>, PersistenceError> {
        validate_stream_id(stream_id)?;
        let file = self
            .user_directory
            .get_stream_directory(stream_id)
            .await?
            .get_event_log_file()
            .await?;
        Ok(file.device_counts().await?)
    }

    async fn stream_ids(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self
            .user_directory
            .event_stream_directories()
            .await?
            .map(|(stream_id, _)| stream_id)
            .collect::<Vec<_>>()
            .await)
    }

    fn claim_writer(&self, device_id: &str) -> String {
        format!("{device_id}.{}", uuid::Uuid::new_v4().simple())
    }

    fn release_writer(&self, _writer_id: &str) {}
}

#[derive(Debug, Clone)]
struct UserDirectory {
    directory_handle: DirectoryHandle,
}

#[derive(Debug, Clone)]
struct StreamDirectory {
    directory_handle: DirectoryHandle,
}

#[derive(Debug, Clone)]
struct EventLogFile {
    file_handle: FileHandle,
}

impl UserDirectory {
    async fn new(parent: &DirectoryHandle, user_id: &str) -> Result<Self, persistent::Error> {
        Ok(Self {
            directory_handle: parent
                .get_directory_handle_with_options(
                    &format!("user__{user_id}"),
                    &opfs::GetDirectoryHandleOptions { create: true },
                )
                .await?,
        })
    }

    async fn event_stream_directories(
        &self,
    ) -> Result<impl Stream<Item = (String, StreamDirectory)>, persistent::Error> {
        Ok(self.directory_handle.entries().await?.filter_map(|entry| {
            let (directory_name, stream_directory) = match entry {
                Ok(res) => res,
                Err(e) => {
                    log::error!("Failed to get stream directory: {e:?}");
                    return futures::future::ready(None);
                }
            };
            let Some(stream_id) = directory_name.strip_prefix("stream__") else {
                return futures::future::ready(None);
            };
            let DirectoryEntry::Directory(stream_directory) = stream_directory else {
                return futures::future::ready(None);
            };
            let stream_directory = StreamDirectory {
                directory_handle: stream_directory,
            };
            futures::future::ready(Some((stream_id.to_string(), stream_directory)))
        }))
    }

    async fn get_stream_directory(&self, stream_id: &str) -> Result<StreamDirectory, persistent::Error> {
        Ok(StreamDirectory {
            directory_handle: self
                .directory_handle
                .get_directory_handle_with_options(
                    &format!("stream__{stream_id}"),
                    &opfs::GetDirectoryHandleOptions { create: true },
                )
                .await?,
        })
    }
}

impl StreamDirectory {
    async fn get_event_log_file(&self) -> Result<EventLogFile, persistent::Error> {
        Ok(EventLogFile {
            file_handle: self
                .directory_handle
                .get_file_handle_with_options(
                    EVENTS_FILE_NAME,
                    &opfs::GetFileHandleOptions { create: true },
                )
                .await?,
        })
    }
}

impl EventLogFile {
    async fn read_records(&self) -> Result<Vec<EventLogRecord>, persistent::Error> {
        let bytes = self.file_handle.read().await?;
        Ok(parse_event_log_records(&bytes))
    }

    // A writable stream only replaces the file when closed, so a failed append leaves the old log.
    async fn append_records(&self, records: &[EventLogRecord]) -> Result<(), persistent::Error> {
        if records.is_empty() {
            return Ok(());
        }

        let existing_size = self.file_handle.size().await?;
        let mut file_handle = self.file_handle.clone();
        let mut writable = file_handle
            .create_writable_with_options(&opfs::CreateWritableOptions {
                keep_existing_data: true,
            })
            .await?;

        if existing_size < EVENT_LOG_HEADER_LEN {
            writable.truncate(0).await?;
            writable.write_at_cursor_pos(event_log_header_bytes()).await?;
            writable.seek(EVENT_LOG_HEADER_LEN).await?;
        } else {
            writable.seek(existing_size).await?;
        }

        for record in records {
            if let Some(bytes) = encode_event_log_record(record) {
                writable.write_at_cursor_pos(bytes).await?;
            }
        }

        writable.close().await?;

        Ok(())
    }

    async fn replace_records(&self, records: &[EventLogRecord]) -> Result<(), persistent::Error> {
        let mut file_handle = self.file_handle.clone();
        let mut writable = file_handle
            .create_writable_with_options(&opfs::CreateWritableOptions {
                keep_existing_data: false,
            })
            .await?;
        writable
            .write_at_cursor_pos(encode_event_log_records(records, true))
            .await?;
        writable.close().await?;
        Ok(())
    }

    async fn device_counts(&self) -> Result<BTreeMap<String, usize>, persistent::Error> {
        let bytes = self.file_handle.read().await?;
        Ok(parse_device_counts(&bytes))
    }
}

/// The browser side of [`crate::cross_tab`]: posts write announcements on a `BroadcastChannel`.
#[cfg(target_arch = "wasm32")]
pub fn broadcast_written(stream_id: &str) {
    use crate::cross_tab::CrossTabMessage;

    let message = CrossTabMessage::Written {
        stream_id: stream_id.to_string(),
    };
    let channel = match web_sys::BroadcastChannel::new(crate::cross_tab::BROADCAST_CHANNEL_NAME) {
        Ok(channel) => channel,
        Err(e) => {
            log::error!("Failed to create BroadcastChannel: {e:?}");
            return;
        }
    };
    let value = match serde_wasm_bindgen::to_value(&message) {
        Ok(value) => value,
        Err(e) => {
            log::error!("Failed to encode cross-tab message: {e:?}");
            return;
        }
    };
    log::info!("Broadcasting written message for stream: {stream_id}");
    if let Err(e) = channel.post_message(&value) {
        log::error!("Failed to post message: {e:?}");
    }
}
