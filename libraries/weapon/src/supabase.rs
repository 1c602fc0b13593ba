//! A [`RemoteStore`] backed by a Supabase database.
//!
//! Expects an `events` table with a unique key on `(user_id, device_id, stream_id, within_device_events_index)`
//! and two RPCs: `get_clock(p_user_id)`, returning `{ "<stream_id>": { "<device_id>": <event_count> } }`,
//! and `sync_events(sync_request)`, returning every event beyond the given per-device counts.
//! Realtime rows from the `events` table are delivered by the host, which passes them to
//! [`crate::data_model::EventStore::ingest_remote_row`].

use std::{cell::RefCell, collections::HashMap};

use fetch_happen::Client;
use serde_json::json;

use crate::{
    data_model::{Clock, Timestamped},
    replicator::{RemoteError, RemoteRow, RemoteStore},
};

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SupabaseConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

impl SupabaseConfig {
    /// Reads `SUPABASE_URL` and `SUPABASE_ANON_KEY`.
    pub fn from_env() -> Option<Self> {
        let supabase_url = std::env::var("SUPABASE_URL").ok()?;
        let supabase_anon_key = std::env::var("SUPABASE_ANON_KEY").ok()?;
        Some(Self {
            supabase_url,
            supabase_anon_key,
        })
    }
}

pub struct SupabaseRemote {
    config: SupabaseConfig,
    access_token: RefCell<String>,
    client: Client,
}

impl SupabaseRemote {
    pub fn new(config: SupabaseConfig, access_token: String) -> Self {
        Self {
            config,
            access_token: RefCell::new(access_token),
            client: Client,
        }
    }

    /// Access tokens expire; the host refreshes them here.
    pub fn set_access_token(&self, access_token: String) {
        *self.access_token.borrow_mut() = access_token;
    }

    async fn post(&self, path: &str, body: &impl serde::Serialize) -> Result<String, RemoteError> {
        let SupabaseConfig {
            supabase_url,
            supabase_anon_key,
        } = &self.config;
        let access_token = self.access_token.borrow().clone();

        let response = self
            .client
            .post(&format!("{supabase_url}{path}"))
            .header("apikey", supabase_anon_key)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Prefer", "resolution=ignore-duplicates")
            .json(body)
            .map_err(|e| RemoteError::Transport(format!("{e:?}")))?
            .send()
            .await
            .map_err(|e| RemoteError::Transport(format!("{e:?}")))?;

        if !response.ok() {
            let status = response.status().to_string();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RemoteError::Status { status, body });
        }

        response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(format!("{e:?}")))
    }
}

impl RemoteStore for SupabaseRemote {
    async fn get_clock(&self, user_id: &str) -> Result<Clock<String, String>, RemoteError> {
        let text = self
            .post("/rest/v1/rpc/get_clock", &json!({ "p_user_id": user_id }))
            .await?;
        serde_json::from_str(&text).map_err(|e| {
            log::error!("Failed to parse get_clock response: {e}. Body: {text}");
            RemoteError::Decode(e)
        })
    }

    async fn push(&self, rows: &[RemoteRow]) -> Result<(), RemoteError> {
        let rows = rows
            .iter()
            .map(SyncableEvent::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.post("/rest/v1/events", &rows).await?;
        log::info!("Successfully uploaded events");
        Ok(())
    }

    async fn fetch_since(
        &self,
        user_id: &str,
        clock: &Clock<String, String>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        let payload = json!({
            "sync_request": clock.iter().map(|(stream_id, device_events)| {
                (stream_id, json!({
                    "last_synced_ids": device_events
                }))
            }).collect::<HashMap<_, _>>()
        });
        let body = self.post("/rest/v1/rpc/sync_events", &payload).await?;

        #[allow(clippy::type_complexity)]
        let sync_response: HashMap<String, HashMap<String, Vec<SyncEventResponse>>> =
            serde_json::from_str(&body).map_err(|e| {
                log::error!("Failed to parse sync response: {e}\nResponse body: {body}");
                RemoteError::Decode(e)
            })?;

        let mut rows = Vec::new();
        for (stream_id, device_events) in sync_response {
            for (device_id, events) in device_events {
                for response in events {
                    rows.push(RemoteRow {
                        user_id: user_id.to_string(),
                        device_id: device_id.clone(),
                        stream_id: stream_id.clone(),
                        event: response.event,
                    });
                }
            }
        }
        Ok(rows)
    }
}

#[derive(Debug, serde::Deserialize)]
struct SyncEventResponse {
    event: serde_json::Value,
}

/// A row of the `events` table.
#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub struct SyncableEvent {
    pub user_id: String,
    pub device_id: String,
    pub event: serde_json::Value,
    pub created_at: String,
    pub within_device_events_index: usize,
    pub stream_id: String,
}

impl SyncableEvent {
    fn from_row(row: &RemoteRow) -> Result<Self, serde_json::Error> {
        let event: Timestamped<serde_json::Value> = row.timestamped()?;
        Ok(Self {
            user_id: row.user_id.clone(),
            device_id: row.device_id.clone(),
            created_at: event.timestamp.to_rfc3339(),
            within_device_events_index: event.within_device_events_index,
            event: row.event.clone(),
            stream_id: row.stream_id.clone(),
        })
    }
}
