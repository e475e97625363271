//! Last-known entity snapshots for the offline read path
//!
//! Entries are keyed by `"{kind}:{scope_id}"` in the local store and never
//! expire on their own: emergency information has to stay readable for as
//! long as the device is offline. Readers decide staleness from `cached_at`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::now_millis;
use crate::error::{SyncError, SyncResult};
use crate::storage::KeyValueStore;

/// Kinds of entity snapshots the client caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    CareRecipient,
    Medications,
    MedicationLogs,
    Timeline,
    Shifts,
    EmergencyInfo,
    CircleMembers,
    Documents,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::CareRecipient,
        EntityKind::Medications,
        EntityKind::MedicationLogs,
        EntityKind::Timeline,
        EntityKind::Shifts,
        EntityKind::EmergencyInfo,
        EntityKind::CircleMembers,
        EntityKind::Documents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::CareRecipient => "care-recipient",
            EntityKind::Medications => "medications",
            EntityKind::MedicationLogs => "medication-logs",
            EntityKind::Timeline => "timeline",
            EntityKind::Shifts => "shifts",
            EntityKind::EmergencyInfo => "emergency-info",
            EntityKind::CircleMembers => "circle-members",
            EntityKind::Documents => "documents",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SyncError::InvalidOperation(format!("Unknown entity kind: {s}")))
    }
}

/// A cached snapshot and the moment it was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub cached_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn KeyValueStore>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Storage key of an entry.
    pub fn key(kind: EntityKind, scope_id: &str) -> String {
        format!("{}:{}", kind.as_str(), scope_id)
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        scope_id: &str,
    ) -> SyncResult<Option<CacheEntry<T>>> {
        match self.store.get(&Self::key(kind, scope_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Overwrites the entry, stamping `cached_at` with the current time.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        kind: EntityKind,
        scope_id: &str,
        data: &T,
    ) -> SyncResult<DateTime<Utc>> {
        let entry = CacheEntry {
            data,
            cached_at: now_millis(),
        };
        self.store
            .set(&Self::key(kind, scope_id), &serde_json::to_string(&entry)?)
            .await?;

        tracing::trace!(kind = %kind, scope_id = scope_id, "Cached snapshot");

        Ok(entry.cached_at)
    }

    /// Untyped variant of [`CacheStore::set`] for pushed payloads.
    pub async fn set_raw(
        &self,
        kind: EntityKind,
        scope_id: &str,
        data: serde_json::Value,
    ) -> SyncResult<DateTime<Utc>> {
        self.set(kind, scope_id, &data).await
    }

    /// Drops a single entry so the next read goes to the network.
    pub async fn invalidate(&self, kind: EntityKind, scope_id: &str) -> SyncResult<bool> {
        self.store.remove(&Self::key(kind, scope_id)).await
    }

    /// Removes every cached entry of every kind. Other records in the
    /// store are left alone.
    pub async fn clear_all(&self) -> SyncResult<usize> {
        let mut removed = 0;
        for kind in EntityKind::ALL {
            let prefix = format!("{}:", kind.as_str());
            for key in self.store.keys_with_prefix(&prefix).await? {
                if self.store.remove(&key).await? {
                    removed += 1;
                }
            }
        }

        tracing::info!(removed, "Cleared entity cache");

        Ok(removed)
    }
}
