//! Realtime cache invalidation feed
//!
//! One WebSocket subscription per caregiving circle. After connecting the
//! client sends `{"action":"subscribe","scope":<id>}`; the server then pushes
//! `{type, scope, data}` events that are dispatched by `type` to an
//! [`InvalidationHandler`]. Lost connections are re-established with capped
//! exponential backoff for as long as the subscription is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::cache::{CacheStore, EntityKind};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// Event types handled out of the box and the cache entries they refresh
pub const DEFAULT_EVENT_ROUTES: [(&str, EntityKind); 8] = [
    ("medication.logged", EntityKind::MedicationLogs),
    ("medication.updated", EntityKind::Medications),
    ("timeline.updated", EntityKind::Timeline),
    ("shift.updated", EntityKind::Shifts),
    ("care_recipient.updated", EntityKind::CareRecipient),
    ("emergency_info.updated", EntityKind::EmergencyInfo),
    ("circle.members_updated", EntityKind::CircleMembers),
    ("document.updated", EntityKind::Documents),
];

/// Server-pushed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub scope: String,
    #[serde(default)]
    pub data: Value,
}

/// Outbound handshake frame
fn subscribe_frame(scope: &str) -> String {
    serde_json::json!({ "action": "subscribe", "scope": scope }).to_string()
}

/// One open connection to the feed
#[async_trait]
pub trait RealtimeConnection: Send {
    async fn send_text(&mut self, text: String) -> SyncResult<()>;

    /// Next text frame, or `None` once the peer has closed the connection.
    async fn next_text(&mut self) -> Option<SyncResult<String>>;

    async fn close(&mut self) -> SyncResult<()>;
}

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, scope: &str) -> SyncResult<Box<dyn RealtimeConnection>>;
}

/// tokio-tungstenite connector for `{realtime_url}/{scope}`
pub struct WebSocketConnector {
    base_url: String,
    auth_token: Option<String>,
}

impl WebSocketConnector {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            base_url: config.realtime_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        }
    }

    pub fn endpoint(&self, scope: &str) -> String {
        format!("{}/{}", self.base_url, scope)
    }
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn connect(&self, scope: &str) -> SyncResult<Box<dyn RealtimeConnection>> {
        let mut request = self
            .endpoint(scope)
            .into_client_request()
            .map_err(|e| SyncError::Realtime(format!("Invalid WebSocket request: {e}")))?;

        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SyncError::Config(format!("Invalid auth token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SyncError::Realtime(format!("WebSocket handshake failed: {e}")))?;

        Ok(Box::new(WebSocketConnection { stream }))
    }
}

pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeConnection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> SyncResult<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Option<SyncResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::warn!("Skipping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite on the next flush
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> SyncResult<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Reacts to one type of pushed event
#[async_trait]
pub trait InvalidationHandler: Send + Sync {
    async fn handle(&self, event: &RealtimeEvent) -> SyncResult<()>;
}

/// Overwrites the event scope's entry with the pushed data, or invalidates it
/// when the event carries none.
pub struct CacheRefresh {
    cache: CacheStore,
    kind: EntityKind,
}

impl CacheRefresh {
    pub fn new(cache: CacheStore, kind: EntityKind) -> Self {
        Self { cache, kind }
    }
}

#[async_trait]
impl InvalidationHandler for CacheRefresh {
    async fn handle(&self, event: &RealtimeEvent) -> SyncResult<()> {
        if event.data.is_null() {
            self.cache.invalidate(self.kind, &event.scope).await?;
        } else {
            self.cache
                .set_raw(self.kind, &event.scope, event.data.clone())
                .await?;
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn InvalidationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a [`CacheRefresh`] for every entry of
    /// [`DEFAULT_EVENT_ROUTES`].
    pub fn with_cache_defaults(cache: &CacheStore) -> Self {
        let mut registry = Self::new();
        for (event_type, kind) in DEFAULT_EVENT_ROUTES {
            registry.register(event_type, Arc::new(CacheRefresh::new(cache.clone(), kind)));
        }
        registry
    }

    /// Replaces any handler already registered for `event_type`.
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn InvalidationHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Returns whether a handler exists for the event's type.
    pub async fn dispatch(&self, event: &RealtimeEvent) -> SyncResult<bool> {
        let Some(handler) = self.handlers.get(&event.event_type) else {
            return Ok(false);
        };
        handler.handle(event).await?;
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Closed,
}

#[derive(Clone)]
pub struct RealtimeChannel {
    connector: Arc<dyn RealtimeConnector>,
    handlers: Arc<HandlerRegistry>,
    policy: ReconnectPolicy,
}

impl RealtimeChannel {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        handlers: HandlerRegistry,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            connector,
            handlers: Arc::new(handlers),
            policy,
        }
    }

    /// Starts the connection task for `scope`. Must be called inside a
    /// Tokio runtime.
    pub fn subscribe(&self, scope: impl Into<String>) -> RealtimeSubscription {
        let scope = scope.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);

        let worker = Worker {
            scope: scope.clone(),
            connector: self.connector.clone(),
            handlers: self.handlers.clone(),
            policy: self.policy.clone(),
            shutdown: shutdown_rx,
            status: status_tx,
        };
        let task = tokio::spawn(worker.run());

        tracing::info!(scope = %scope, "Realtime subscription started");

        RealtimeSubscription {
            scope,
            shutdown: shutdown_tx,
            status: status_rx,
            task: Some(task),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected(String),
}

struct Worker {
    scope: String,
    connector: Arc<dyn RealtimeConnector>,
    handlers: Arc<HandlerRegistry>,
    policy: ReconnectPolicy,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<ChannelStatus>,
}

impl Worker {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                _ = self.shutdown.changed() => break,
                result = self.connector.connect(&self.scope) => result,
            };

            match connected {
                Ok(mut connection) => {
                    match self.session(connection.as_mut(), &mut attempt).await {
                        SessionEnd::Shutdown => {
                            if let Err(e) = connection.close().await {
                                tracing::debug!(scope = %self.scope, error = %e, "Close failed");
                            }
                            break;
                        }
                        SessionEnd::Disconnected(reason) => {
                            tracing::warn!(scope = %self.scope, reason = %reason, "Realtime connection lost");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(scope = %self.scope, error = %e, "Realtime connect failed");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.policy.backoff(attempt);
            self.status
                .send_replace(ChannelStatus::Reconnecting { attempt, delay });
            tracing::debug!(scope = %self.scope, attempt, ?delay, "Reconnecting");

            tokio::select! {
                _ = self.shutdown.changed() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.status.send_replace(ChannelStatus::Closed);
        tracing::info!(scope = %self.scope, "Realtime subscription closed");
    }

    async fn session(
        &mut self,
        connection: &mut dyn RealtimeConnection,
        attempt: &mut u32,
    ) -> SessionEnd {
        if let Err(e) = connection.send_text(subscribe_frame(&self.scope)).await {
            return SessionEnd::Disconnected(e.to_string());
        }

        *attempt = 0;
        self.status.send_replace(ChannelStatus::Connected);
        tracing::debug!(scope = %self.scope, "Realtime connected");

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.changed() => return SessionEnd::Shutdown,
                frame = connection.next_text() => frame,
            };

            match frame {
                None => return SessionEnd::Disconnected("closed by server".to_string()),
                Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
                Some(Ok(text)) => self.handle_frame(&text).await,
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let event: RealtimeEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(scope = %self.scope, error = %e, "Skipping unparseable realtime frame");
                return;
            }
        };

        match self.handlers.dispatch(&event).await {
            Ok(true) => {
                tracing::debug!(event_type = %event.event_type, scope = %event.scope, "Applied realtime event");
            }
            Ok(false) => {
                tracing::debug!(event_type = %event.event_type, "No handler for realtime event");
            }
            Err(e) => {
                tracing::warn!(event_type = %event.event_type, error = %e, "Realtime handler failed");
            }
        }
    }
}

/// Live subscription. Dropping it aborts the connection task; use
/// [`RealtimeSubscription::unsubscribe`] to close cleanly.
#[must_use = "dropping the subscription closes it immediately"]
pub struct RealtimeSubscription {
    scope: String,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<ChannelStatus>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeSubscription {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Closes the connection and waits for the task to finish.
    pub async fn unsubscribe(mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(scope = %self.scope, error = %e, "Realtime task ended abnormally");
            }
        }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::ChannelConnector;
    use serde_json::json;

    fn channel(connector: Arc<ChannelConnector>) -> (CacheStore, RealtimeChannel) {
        let cache = CacheStore::new(Arc::new(MemoryStore::new()));
        let channel = RealtimeChannel::new(
            connector,
            HandlerRegistry::with_cache_defaults(&cache),
            ReconnectPolicy {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
        );
        (cache, channel)
    }

    async fn wait_status(sub: &RealtimeSubscription, expected: ChannelStatus) {
        let mut rx = sub.status_watch();
        rx.wait_for(|status| *status == expected).await.unwrap();
    }

    #[test]
    fn test_reconnect_backoff_caps_at_max() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(6), Duration::from_secs(30));
        assert_eq!(policy.backoff(100), Duration::from_secs(30));
    }

    #[test]
    fn test_endpoint_appends_scope() {
        let connector = WebSocketConnector::new(&SyncConfig {
            realtime_url: "wss://rt.example.test/ws/".to_string(),
            ..Default::default()
        });
        assert_eq!(connector.endpoint("circle-7"), "wss://rt.example.test/ws/circle-7");
    }

    #[tokio::test]
    async fn test_handshake_and_cache_update() {
        let (connector, mut sessions) = ChannelConnector::new();
        let (cache, channel) = channel(connector);
        let sub = channel.subscribe("circle-1");

        let mut server = sessions.recv().await.unwrap();
        assert_eq!(server.scope, "circle-1");
        let handshake: Value = serde_json::from_str(&server.next_received().await.unwrap()).unwrap();
        assert_eq!(handshake, json!({"action": "subscribe", "scope": "circle-1"}));

        server.push_event("emergency_info.updated", "circle-1", json!({"dnr": true}));
        server.push_event("timeline.updated", "circle-1", json!([{"id": "t-1"}]));
        server.push_event("timeline.updated", "circle-1", Value::Null);
        server.push("not json");
        server.push_event("vitals.updated", "circle-1", json!({}));
        server.push_event("shift.updated", "circle-1", json!([{"id": "s-1"}]));

        // frames are handled in order, so the last one landing means all did
        loop {
            if cache.get::<Value>(EntityKind::Shifts, "circle-1").await.unwrap().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let info = cache.get::<Value>(EntityKind::EmergencyInfo, "circle-1").await.unwrap().unwrap();
        assert_eq!(info.data, json!({"dnr": true}));
        assert!(cache.get::<Value>(EntityKind::Timeline, "circle-1").await.unwrap().is_none());
        assert_eq!(sub.status(), ChannelStatus::Connected);

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_backoff_after_disconnect() {
        let (connector, mut sessions) = ChannelConnector::new();
        let (_cache, channel) = channel(connector.clone());
        let sub = channel.subscribe("circle-1");

        let first = sessions.recv().await.unwrap();
        wait_status(&sub, ChannelStatus::Connected).await;
        drop(first);

        wait_status(
            &sub,
            ChannelStatus::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(1),
            },
        )
        .await;

        let _second = sessions.recv().await.unwrap();
        wait_status(&sub, ChannelStatus::Connected).await;
        assert_eq!(connector.connect_count(), 2);

        sub.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connects_back_off_exponentially() {
        let (connector, mut sessions) = ChannelConnector::new();
        connector.fail_next(3);
        let (_cache, channel) = channel(connector.clone());
        let sub = channel.subscribe("circle-1");

        let mut rx = sub.status_watch();
        let mut delays = Vec::new();
        while delays.len() < 3 {
            rx.changed().await.unwrap();
            if let ChannelStatus::Reconnecting { delay, .. } = *rx.borrow_and_update() {
                delays.push(delay);
            }
        }
        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );

        let _server = sessions.recv().await.unwrap();
        wait_status(&sub, ChannelStatus::Connected).await;
        sub.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_deterministically() {
        let (connector, mut sessions) = ChannelConnector::new();
        let (_cache, channel) = channel(connector.clone());
        let sub = channel.subscribe("circle-1");
        let mut server = sessions.recv().await.unwrap();
        server.next_received().await.unwrap();

        let status = sub.status_watch();
        sub.unsubscribe().await;

        assert_eq!(*status.borrow(), ChannelStatus::Closed);
        // the client side of the connection is gone
        assert!(server.next_received().await.is_none());
        assert_eq!(connector.connect_count(), 1);
    }
}
