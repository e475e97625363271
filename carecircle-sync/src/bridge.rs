//! Trigger path from a background context into the sync engine
//!
//! A background worker (service-worker style) cannot touch the engine
//! directly. It posts [`BridgeMessage`]s through a cloneable
//! [`BridgeSender`]; a listener attached on the main side turns
//! `SYNC_OFFLINE_ACTIONS` into `SyncEngine::sync()` calls and forwards
//! notification clicks to the host's navigation channel.
//!
//! The channel is bounded. Messages posted before a listener attaches are
//! buffered; once the buffer is full further messages are dropped.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::{SyncEngine, SyncOutcome};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeMessage {
    SyncOfflineActions,
    NotificationClick { url: String },
}

impl BridgeMessage {
    /// Parses a cross-context JSON message; unknown shapes yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

#[derive(Clone)]
pub struct BridgeSender {
    tx: mpsc::Sender<BridgeMessage>,
}

impl BridgeSender {
    /// Returns false if the message was dropped.
    pub fn post(&self, message: BridgeMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                tracing::warn!(?message, "Bridge buffer full, dropping message");
                false
            }
            Err(TrySendError::Closed(message)) => {
                tracing::debug!(?message, "Bridge closed, dropping message");
                false
            }
        }
    }

    pub fn post_raw(&self, raw: &str) -> bool {
        match BridgeMessage::parse(raw) {
            Some(message) => self.post(message),
            None => {
                tracing::debug!("Ignoring unrecognised bridge message");
                false
            }
        }
    }

    pub fn request_sync(&self) -> bool {
        self.post(BridgeMessage::SyncOfflineActions)
    }
}

pub struct BackgroundSyncBridge {
    sender: BridgeSender,
    receiver: Mutex<Option<mpsc::Receiver<BridgeMessage>>>,
}

impl BackgroundSyncBridge {
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Self {
            sender: BridgeSender { tx },
            receiver: Mutex::new(Some(rx)),
        }
    }

    pub fn sender(&self) -> BridgeSender {
        self.sender.clone()
    }

    /// Starts draining messages into `engine`. Only one listener may be
    /// attached over the bridge's lifetime.
    pub fn attach(
        &self,
        engine: SyncEngine,
        navigation: Option<mpsc::UnboundedSender<String>>,
    ) -> SyncResult<BridgeListener> {
        let rx = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| SyncError::InvalidOperation("Bridge listener already attached".to_string()))?;

        let (status_tx, status_rx) = watch::channel(BridgeStatus::default());
        let task = tokio::spawn(listen(rx, engine, navigation, status_tx));

        Ok(BridgeListener {
            status: status_rx,
            task: Some(task),
        })
    }
}

/// What the listener has done so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeStatus {
    pub handled: u64,
    pub last_outcome: Option<SyncOutcome>,
}

async fn listen(
    mut rx: mpsc::Receiver<BridgeMessage>,
    engine: SyncEngine,
    navigation: Option<mpsc::UnboundedSender<String>>,
    status: watch::Sender<BridgeStatus>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            BridgeMessage::SyncOfflineActions => {
                tracing::debug!("Background sync requested");
                match engine.sync().await {
                    Ok(outcome) => status.send_modify(|s| s.last_outcome = Some(outcome)),
                    Err(e) => tracing::warn!(error = %e, "Background sync failed"),
                }
            }
            BridgeMessage::NotificationClick { url } => match &navigation {
                Some(nav) => {
                    if nav.send(url).is_err() {
                        tracing::debug!("Navigation receiver gone");
                    }
                }
                None => tracing::debug!("No navigation channel, ignoring notification click"),
            },
        }
        status.send_modify(|s| s.handled += 1);
    }
}

/// Attached listener. Dropping it stops the listener task.
#[must_use = "dropping the listener detaches it immediately"]
pub struct BridgeListener {
    status: watch::Receiver<BridgeStatus>,
    task: Option<JoinHandle<()>>,
}

impl BridgeListener {
    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<BridgeStatus> {
        self.status.clone()
    }

    /// Waits until at least `n` messages have been handled.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn wait_handled(&self, n: u64) {
        let mut rx = self.status.clone();
        // Closed only when the task ended, which leaves nothing to wait for
        let _ = rx.wait_for(|s| s.handled >= n).await;
    }

    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Bridge listener ended abnormally");
                }
            }
        }
    }
}

impl Drop for BridgeListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
