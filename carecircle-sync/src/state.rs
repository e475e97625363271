//! Observable sync state
//!
//! Derived, process-wide view of the sync core published through a
//! `tokio::sync::watch` channel. Only `last_sync_at` is persisted, by the
//! engine; everything else is rebuilt at bootstrap.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::clock::ActionId;
use crate::queue::ActionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Replay failed but will be retried
    Transient,
    /// Rejected by the server; the action was dropped
    Permanent,
    /// Retry budget used up; the action was dropped
    Exhausted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Exhausted => "exhausted",
        };
        f.write_str(label)
    }
}

/// Most recent replay failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub kind: ErrorKind,
    pub action_id: ActionId,
    pub action_type: ActionType,
    /// Redacted error description
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub online: bool,
    pub syncing: bool,
    pub pending_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
}

/// Shared writer side of the state channel
#[derive(Clone)]
pub struct StateHandle {
    sender: Arc<watch::Sender<SyncState>>,
}

impl StateHandle {
    pub fn new(initial: SyncState) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn snapshot(&self) -> SyncState {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.sender.subscribe()
    }

    /// Applies `f` and notifies receivers only if the state changed.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncState),
    {
        self.sender.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    pub fn set_online(&self, online: bool) {
        self.update(|state| state.online = online);
    }

    pub fn set_pending_count(&self, pending_count: usize) {
        self.update(|state| state.pending_count = pending_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unchanged_update_does_not_notify() {
        let handle = StateHandle::new(SyncState::default());
        let mut rx = handle.subscribe();

        handle.set_pending_count(0);
        assert!(!rx.has_changed().unwrap());

        handle.set_pending_count(3);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().pending_count, 3);
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let state = SyncState {
            online: true,
            pending_count: 2,
            ..Default::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["pendingCount"], 2);
        assert_eq!(value["lastSyncAt"], serde_json::Value::Null);
    }
}
