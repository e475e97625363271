//! In-process fakes of the two network seams
//!
//! [`ScriptedReplayApi`] answers replay calls from a script and records what
//! it was asked; [`ChannelConnector`] hands out realtime connections backed by
//! channels, with the server end returned to the test.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Semaphore};

use crate::api::{ApiError, ReplayApi};
use crate::clock::ActionId;
use crate::error::{SyncError, SyncResult};
use crate::queue::ActionType;
use crate::realtime::{RealtimeConnection, RealtimeConnector};

/// A replay call as the API saw it
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub action_type: ActionType,
    pub payload: Value,
    pub idempotency_key: ActionId,
}

/// [`ReplayApi`] that pops scripted responses, falling back to a default
/// once the script is used up.
pub struct ScriptedReplayApi {
    script: Mutex<VecDeque<Result<Value, ApiError>>>,
    fallback: Mutex<Result<Value, ApiError>>,
    calls: Mutex<Vec<RecordedCall>>,
    call_count: watch::Sender<usize>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Default for ScriptedReplayApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedReplayApi {
    pub fn new() -> Self {
        let (call_count, _) = watch::channel(0);
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(json!({ "ok": true }))),
            calls: Mutex::new(Vec::new()),
            call_count,
            gate: Mutex::new(None),
        }
    }

    pub fn push_ok(&self, body: Value) {
        self.script.lock().push_back(Ok(body));
    }

    pub fn push_error(&self, error: ApiError) {
        self.script.lock().push_back(Err(error));
    }

    /// Response used once the script is empty.
    pub fn set_fallback(&self, response: Result<Value, ApiError>) {
        *self.fallback.lock() = response;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.borrow()
    }

    /// Waits until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.call_count.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Makes calls block after being recorded until [`Self::release`].
    pub fn hold(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.close();
        }
    }
}

#[async_trait]
impl ReplayApi for ScriptedReplayApi {
    async fn execute(
        &self,
        action_type: ActionType,
        payload: &Value,
        idempotency_key: &ActionId,
    ) -> Result<Value, ApiError> {
        self.calls.lock().push(RecordedCall {
            action_type,
            payload: payload.clone(),
            idempotency_key: idempotency_key.clone(),
        });
        self.call_count.send_modify(|count| *count += 1);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            // Closed on release
            let _ = gate.acquire().await;
        }

        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

/// Server end of a [`ChannelConnector`] connection
pub struct ServerSession {
    pub scope: String,
    received: mpsc::UnboundedReceiver<String>,
    frames: Option<mpsc::UnboundedSender<String>>,
}

impl ServerSession {
    /// Pushes a raw text frame. Returns false once the client is gone.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.frames
            .as_ref()
            .is_some_and(|frames| frames.send(text.into()).is_ok())
    }

    pub fn push_event(&self, event_type: &str, scope: &str, data: Value) -> bool {
        self.push(json!({ "type": event_type, "scope": scope, "data": data }).to_string())
    }

    /// Next frame sent by the client, `None` once the client closed.
    pub async fn next_received(&mut self) -> Option<String> {
        self.received.recv().await
    }

    /// Drops the server side of the stream, as a network loss would.
    pub fn disconnect(&mut self) {
        self.frames = None;
    }
}

struct ChannelConnection {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl RealtimeConnection for ChannelConnection {
    async fn send_text(&mut self, text: String) -> SyncResult<()> {
        self.outgoing
            .send(text)
            .map_err(|_| SyncError::Realtime("server session dropped".to_string()))
    }

    async fn next_text(&mut self) -> Option<SyncResult<String>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.incoming.close();
        Ok(())
    }
}

/// [`RealtimeConnector`] whose connections are in-memory channels
pub struct ChannelConnector {
    sessions: mpsc::UnboundedSender<ServerSession>,
    failures: AtomicU32,
    connects: AtomicU32,
}

impl ChannelConnector {
    /// The receiver yields the server end of every successful connect.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSession>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            sessions,
            failures: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        });
        (connector, rx)
    }

    /// Refuses the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeConnector for ChannelConnector {
    async fn connect(&self, scope: &str) -> SyncResult<Box<dyn RealtimeConnection>> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncError::Realtime("connection refused".to_string()));
        }

        let (outgoing, received) = mpsc::unbounded_channel();
        let (frames, incoming) = mpsc::unbounded_channel();

        self.sessions
            .send(ServerSession {
                scope: scope.to_string(),
                received,
                frames: Some(frames),
            })
            .map_err(|_| SyncError::Realtime("no server listening".to_string()))?;
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ChannelConnection { outgoing, incoming }))
    }
}
