//! Write path: call the API now, or queue the write for later
//!
//! Every write gets an [`ActionId`] up front so the direct call and any later
//! replay carry the same `Idempotency-Key`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::api::{ApiError, FailureClass, ReplayApi, ReplayRoute};
use crate::clock::{ActionId, ActionIdGenerator};
use crate::error::SyncResult;
use crate::network::NetworkMonitor;
use crate::queue::{ActionType, DurableQueue, PendingAction};
use crate::state::StateHandle;

/// Result of a submitted write
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Submission {
    /// The API accepted the write; carries its response body
    #[serde(rename_all = "camelCase")]
    Sent { action_id: ActionId, response: Value },
    /// The write was stored for replay
    #[serde(rename_all = "camelCase")]
    Queued { action_id: ActionId },
}

impl Submission {
    pub fn action_id(&self) -> &ActionId {
        match self {
            Submission::Sent { action_id, .. } | Submission::Queued { action_id } => action_id,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Submission::Queued { .. })
    }
}

#[derive(Clone)]
pub struct ActionEnqueuer {
    queue: DurableQueue,
    api: Arc<dyn ReplayApi>,
    monitor: NetworkMonitor,
    state: StateHandle,
    ids: Arc<ActionIdGenerator>,
    request_timeout: Duration,
    fallback_to_queue: bool,
}

impl ActionEnqueuer {
    pub fn new(
        queue: DurableQueue,
        api: Arc<dyn ReplayApi>,
        monitor: NetworkMonitor,
        state: StateHandle,
        ids: Arc<ActionIdGenerator>,
        request_timeout: Duration,
        fallback_to_queue: bool,
    ) -> Self {
        Self {
            queue,
            api,
            monitor,
            state,
            ids,
            request_timeout,
            fallback_to_queue,
        }
    }

    /// Submits a write.
    ///
    /// # Errors
    ///
    /// `SyncError::Rejected` when the payload cannot fill the route or the
    /// server refuses it; `SyncError::Network` for a transient failure when
    /// falling back to the queue is disabled; storage errors when queueing.
    pub async fn submit(&self, action_type: ActionType, payload: Value) -> SyncResult<Submission> {
        // A payload that cannot address its route would never replay
        ReplayRoute::for_action(action_type).resolve_segments(&payload)?;

        let (id, created_at) = self.ids.next_id();

        if self.monitor.is_online() {
            match self.call(action_type, &payload, &id).await {
                Ok(response) => {
                    tracing::debug!(action_id = %id, action_type = %action_type, "Write sent directly");
                    return Ok(Submission::Sent {
                        action_id: id,
                        response,
                    });
                }
                Err(e) if e.class() == FailureClass::Transient && self.fallback_to_queue => {
                    tracing::warn!(
                        action_id = %id,
                        action_type = %action_type,
                        error = %logger_redacted::redact(&e.to_string()),
                        "Direct write failed, queueing for replay"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.queue
            .append(PendingAction::new(id.clone(), action_type, payload, created_at))
            .await?;
        self.refresh_pending_count().await?;

        tracing::info!(action_id = %id, action_type = %action_type, "Write queued for sync");

        Ok(Submission::Queued { action_id: id })
    }

    async fn call(
        &self,
        action_type: ActionType,
        payload: &Value,
        id: &ActionId,
    ) -> Result<Value, ApiError> {
        tokio::time::timeout(
            self.request_timeout,
            self.api.execute(action_type, payload, id),
        )
        .await
        .unwrap_or(Err(ApiError::Timeout(self.request_timeout)))
    }

    async fn refresh_pending_count(&self) -> SyncResult<()> {
        let pending = self.queue.len().await?;
        self.state.set_pending_count(pending);
        Ok(())
    }

    /// Fast-forwards id generation past everything already queued, so ids
    /// stay increasing across restarts.
    pub async fn observe_queue(&self) -> SyncResult<()> {
        if let Some(last) = self.queue.list().await?.last() {
            self.ids.observe(&last.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::network::Connectivity;
    use crate::state::SyncState;
    use crate::storage::MemoryStore;
    use crate::testing::ScriptedReplayApi;
    use serde_json::json;

    struct Fixture {
        enqueuer: ActionEnqueuer,
        queue: DurableQueue,
        api: Arc<ScriptedReplayApi>,
        monitor: NetworkMonitor,
        state: StateHandle,
    }

    fn fixture(initial: Connectivity, fallback_to_queue: bool) -> Fixture {
        let queue = DurableQueue::new(Arc::new(MemoryStore::new()));
        let api = Arc::new(ScriptedReplayApi::new());
        let monitor = NetworkMonitor::new(initial);
        let state = StateHandle::new(SyncState::default());
        let enqueuer = ActionEnqueuer::new(
            queue.clone(),
            api.clone(),
            monitor.clone(),
            state.clone(),
            Arc::new(ActionIdGenerator::new()),
            Duration::from_secs(15),
            fallback_to_queue,
        );
        Fixture {
            enqueuer,
            queue,
            api,
            monitor,
            state,
        }
    }

    fn medication_log() -> Value {
        json!({"careRecipientId": "cr-1", "medicationId": "m-1", "dose": "5mg"})
    }

    #[tokio::test]
    async fn test_online_calls_api_directly() {
        let f = fixture(Connectivity::Online, true);
        f.api.push_ok(json!({"id": "log-1"}));

        let submission = f
            .enqueuer
            .submit(ActionType::MedicationLog, medication_log())
            .await
            .unwrap();

        assert_eq!(
            submission,
            Submission::Sent {
                action_id: f.api.calls()[0].idempotency_key.clone(),
                response: json!({"id": "log-1"}),
            }
        );
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_queues_without_calling() {
        let f = fixture(Connectivity::Offline, true);

        let submission = f
            .enqueuer
            .submit(ActionType::MedicationLog, medication_log())
            .await
            .unwrap();

        assert!(submission.is_queued());
        assert_eq!(f.api.call_count(), 0);

        let queued = f.queue.list().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(&queued[0].id, submission.action_id());
        assert_eq!(queued[0].retry_count, 0);
        assert_eq!(queued[0].payload, medication_log());
        assert_eq!(
            queued[0].id.timestamp_ms(),
            Some(queued[0].created_at.timestamp_millis())
        );
        assert_eq!(f.state.snapshot().pending_count, 1);
    }

    #[tokio::test]
    async fn test_ids_increase_in_submission_order() {
        let f = fixture(Connectivity::Offline, true);
        let mut ids = Vec::new();
        for _ in 0..50 {
            let s = f
                .enqueuer
                .submit(ActionType::TimelineEntry, json!({"careRecipientId": "cr-1"}))
                .await
                .unwrap();
            ids.push(s.action_id().clone());
        }
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_transient_failure_falls_back_to_queue() {
        let f = fixture(Connectivity::Online, true);
        f.api.push_error(ApiError::Status {
            status: 503,
            body: String::new(),
        });

        let submission = f
            .enqueuer
            .submit(ActionType::ShiftCheckIn, json!({"shiftId": "s-1"}))
            .await
            .unwrap();

        assert!(submission.is_queued());
        // the replay will reuse the key of the failed direct call
        assert_eq!(&f.api.calls()[0].idempotency_key, submission.action_id());
        assert_eq!(f.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_without_fallback_is_returned() {
        let f = fixture(Connectivity::Online, false);
        f.api.push_error(ApiError::Network("reset".into()));

        let err = f
            .enqueuer
            .submit(ActionType::ShiftCheckIn, json!({"shiftId": "s-1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_rejected() {
        let f = fixture(Connectivity::Online, true);
        f.api.push_error(ApiError::Status {
            status: 422,
            body: "dose required".into(),
        });

        let err = f
            .enqueuer
            .submit(ActionType::MedicationLog, medication_log())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { status: Some(422), .. }));
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_unroutable_payload_rejected_even_offline() {
        let f = fixture(Connectivity::Offline, true);
        let err = f
            .enqueuer
            .submit(ActionType::ShiftCheckOut, json!({"note": "no shift id"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { status: None, .. }));
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_reconnect_switches_path() {
        let f = fixture(Connectivity::Offline, true);
        let first = f
            .enqueuer
            .submit(ActionType::ShiftCheckIn, json!({"shiftId": "s-1"}))
            .await
            .unwrap();
        f.monitor.set_online(true);
        let second = f
            .enqueuer
            .submit(ActionType::ShiftCheckOut, json!({"shiftId": "s-1"}))
            .await
            .unwrap();

        assert!(first.is_queued());
        assert!(!second.is_queued());
    }

    #[tokio::test]
    async fn test_observe_queue_keeps_ids_increasing_across_restart() {
        let f = fixture(Connectivity::Offline, true);
        let queued = PendingAction::new(
            ActionId::from("9999999999999-000000-00000000"),
            ActionType::ShiftCheckIn,
            json!({"shiftId": "s-1"}),
            chrono::Utc::now(),
        );
        f.queue.append(queued.clone()).await.unwrap();

        f.enqueuer.observe_queue().await.unwrap();
        let next = f
            .enqueuer
            .submit(ActionType::ShiftCheckOut, json!({"shiftId": "s-1"}))
            .await
            .unwrap();
        assert!(next.action_id() > &queued.id);
    }
}
