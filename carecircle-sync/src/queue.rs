//! Durable FIFO queue of writes made while offline
//!
//! The whole queue lives as one JSON array under [`QUEUE_KEY`]. Every
//! operation is a read-modify-write of that array; an async mutex serializes
//! those cycles within the process so concurrent appends cannot lose each
//! other's writes. Insertion order is the only ordering the system
//! guarantees.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clock::ActionId;
use crate::error::{SyncError, SyncResult};
use crate::storage::KeyValueStore;

/// Storage key of the pending action list
pub const QUEUE_KEY: &str = "offline_actions";

/// Write kinds that can be deferred and replayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    MedicationLog,
    MedicationLogUpdate,
    TimelineEntry,
    TimelineEntryUpdate,
    ShiftCheckIn,
    ShiftCheckOut,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        ActionType::MedicationLog,
        ActionType::MedicationLogUpdate,
        ActionType::TimelineEntry,
        ActionType::TimelineEntryUpdate,
        ActionType::ShiftCheckIn,
        ActionType::ShiftCheckOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::MedicationLog => "medication-log",
            ActionType::MedicationLogUpdate => "medication-log-update",
            ActionType::TimelineEntry => "timeline-entry",
            ActionType::TimelineEntryUpdate => "timeline-entry-update",
            ActionType::ShiftCheckIn => "shift-check-in",
            ActionType::ShiftCheckOut => "shift-check-out",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|action_type| action_type.as_str() == s)
            .ok_or_else(|| SyncError::InvalidOperation(format!("Unknown action type: {s}")))
    }
}

/// A write that has not been confirmed by the API yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: ActionId,

    #[serde(rename = "type")]
    pub action_type: ActionType,

    /// Request body, opaque to everything but the replay route
    pub payload: serde_json::Value,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    /// Failed replay attempts so far
    pub retry_count: u32,

    /// Earliest time the next replay may be attempted
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Redacted description of the last failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingAction {
    pub fn new(
        id: ActionId,
        action_type: ActionType,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            action_type,
            payload,
            created_at,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Whether the backoff window (if any) has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Fields of a queued action that replay bookkeeping may change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionPatch {
    pub retry_count: Option<u32>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ActionPatch {
    fn apply(self, action: &mut PendingAction) {
        if let Some(retry_count) = self.retry_count {
            action.retry_count = retry_count;
        }
        if let Some(next_attempt_at) = self.next_attempt_at {
            action.next_attempt_at = Some(next_attempt_at);
        }
        if let Some(last_error) = self.last_error {
            action.last_error = Some(last_error);
        }
    }
}

#[derive(Clone)]
pub struct DurableQueue {
    store: Arc<dyn KeyValueStore>,
    lock: Arc<Mutex<()>>,
}

impl DurableQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load(&self) -> SyncResult<Vec<PendingAction>> {
        match self.store.get(QUEUE_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, actions: &[PendingAction]) -> SyncResult<()> {
        self.store.set(QUEUE_KEY, &serde_json::to_string(actions)?).await
    }

    pub async fn append(&self, action: PendingAction) -> SyncResult<()> {
        let _guard = self.lock.lock().await;
        let mut actions = self.load().await?;

        if actions.iter().any(|queued| queued.id == action.id) {
            return Err(SyncError::InvalidOperation(format!(
                "Action {} is already queued",
                action.id
            )));
        }

        tracing::debug!(
            action_id = %action.id,
            action_type = %action.action_type,
            position = actions.len(),
            "Queued action for sync"
        );

        actions.push(action);
        self.save(&actions).await
    }

    /// Snapshot of the queue in insertion order.
    pub async fn list(&self) -> SyncResult<Vec<PendingAction>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn len(&self) -> SyncResult<usize> {
        Ok(self.list().await?.len())
    }

    pub async fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Returns whether the action was queued.
    pub async fn remove(&self, id: &ActionId) -> SyncResult<bool> {
        let _guard = self.lock.lock().await;
        let mut actions = self.load().await?;
        let before = actions.len();
        actions.retain(|action| &action.id != id);

        if actions.len() == before {
            return Ok(false);
        }

        self.save(&actions).await?;
        tracing::debug!(action_id = %id, remaining = actions.len(), "Removed action from queue");
        Ok(true)
    }

    /// Returns whether the action was queued.
    pub async fn update(&self, id: &ActionId, patch: ActionPatch) -> SyncResult<bool> {
        let _guard = self.lock.lock().await;
        let mut actions = self.load().await?;

        let Some(action) = actions.iter_mut().find(|action| &action.id == id) else {
            return Ok(false);
        };
        patch.apply(action);

        self.save(&actions).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> SyncResult<()> {
        let _guard = self.lock.lock().await;
        self.store.remove(QUEUE_KEY).await?;
        tracing::info!("Cleared pending action queue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ActionIdGenerator;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn action(ids: &ActionIdGenerator, action_type: ActionType) -> PendingAction {
        let (id, created_at) = ids.next_id();
        PendingAction::new(id, action_type, json!({"shiftId": "s-1"}), created_at)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = DurableQueue::new(Arc::new(MemoryStore::new()));
        let ids = ActionIdGenerator::new();
        let queued: Vec<_> = (0..5).map(|_| action(&ids, ActionType::ShiftCheckIn)).collect();

        for a in &queued {
            queue.append(a.clone()).await.unwrap();
        }

        assert_eq!(queue.list().await.unwrap(), queued);
        assert_eq!(queue.len().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let queue = DurableQueue::new(Arc::new(MemoryStore::new()));
        let ids = ActionIdGenerator::new();
        let first = action(&ids, ActionType::MedicationLog);
        let second = action(&ids, ActionType::TimelineEntry);
        queue.append(first.clone()).await.unwrap();
        queue.append(second.clone()).await.unwrap();

        let updated = queue
            .update(
                &first.id,
                ActionPatch {
                    retry_count: Some(1),
                    last_error: Some("server responded 503".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let listed = queue.list().await.unwrap();
        assert_eq!(listed[0].retry_count, 1);
        assert_eq!(listed[0].last_error.as_deref(), Some("server responded 503"));
        assert_eq!(listed[1], second);

        assert!(queue.remove(&first.id).await.unwrap());
        assert!(!queue.remove(&first.id).await.unwrap());
        assert!(!queue.update(&first.id, ActionPatch::default()).await.unwrap());
        assert_eq!(queue.list().await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let queue = DurableQueue::new(Arc::new(MemoryStore::new()));
        let ids = ActionIdGenerator::new();
        let a = action(&ids, ActionType::ShiftCheckOut);
        queue.append(a.clone()).await.unwrap();
        assert!(matches!(
            queue.append(a).await,
            Err(SyncError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let queue = DurableQueue::new(Arc::new(MemoryStore::new()));
        let ids = Arc::new(ActionIdGenerator::new());

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let queue = queue.clone();
                let a = action(&ids, ActionType::TimelineEntry);
                tokio::spawn(async move { queue.append(a).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(queue.len().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = Arc::new(MemoryStore::new());
        let queue = DurableQueue::new(store.clone());
        let ids = ActionIdGenerator::new();
        queue.append(action(&ids, ActionType::ShiftCheckIn)).await.unwrap();
        queue.clear().await.unwrap();
        assert!(queue.is_empty().await.unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_wire_format() {
        let a = PendingAction::new(
            ActionId::from("1760000000000-000000-00000001"),
            ActionType::MedicationLog,
            json!({"medicationId": "m-1"}),
            DateTime::from_timestamp_millis(1_760_000_000_000).unwrap(),
        );
        let value = serde_json::to_value(&a).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "1760000000000-000000-00000001",
                "type": "medication-log",
                "payload": {"medicationId": "m-1"},
                "createdAt": 1_760_000_000_000_i64,
                "retryCount": 0
            })
        );
        let back: PendingAction = serde_json::from_value(value).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut a = PendingAction::new(ActionId::from("x"), ActionType::ShiftCheckIn, json!({}), now);
        assert!(a.is_due(now));
        a.next_attempt_at = Some(now + chrono::Duration::seconds(30));
        assert!(!a.is_due(now));
    }
}
