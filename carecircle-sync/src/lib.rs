//! Offline-first synchronization core for CareCircle clients
//!
//! Provides:
//! - Durable FIFO queue of writes made while offline
//! - Replay engine with per-action backoff and failure classification
//! - Last-known entity cache for the offline read path
//! - Realtime invalidation feed per caregiving circle
//! - Background-context sync trigger
//!
//! [`SyncCore`] wires everything together and is the only object an app
//! needs to hold.

pub mod api;
pub mod bridge;
pub mod cache;
pub mod clock;
pub mod config;
pub mod enqueuer;
pub mod engine;
pub mod error;
pub mod network;
pub mod queue;
pub mod realtime;
pub mod state;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

pub use api::{ApiError, FailureClass, HttpReplayApi, ReplayApi, ReplayRoute};
pub use bridge::{BackgroundSyncBridge, BridgeListener, BridgeMessage, BridgeSender, BridgeStatus};
pub use cache::{CacheEntry, CacheStore, EntityKind};
pub use clock::{ActionId, ActionIdGenerator};
pub use config::SyncConfig;
pub use enqueuer::{ActionEnqueuer, Submission};
pub use engine::{ReplayPolicy, SyncEngine, SyncOutcome, SyncReport, LAST_SYNC_KEY};
pub use error::{SyncError, SyncResult};
pub use network::{Connectivity, NetworkMonitor, NetworkSubscription};
pub use queue::{ActionPatch, ActionType, DurableQueue, PendingAction, QUEUE_KEY};
pub use realtime::{
    CacheRefresh, ChannelStatus, HandlerRegistry, InvalidationHandler, RealtimeChannel,
    RealtimeConnection, RealtimeConnector, RealtimeEvent, RealtimeSubscription, ReconnectPolicy,
    WebSocketConnector,
};
pub use state::{ErrorKind, LastError, StateHandle, SyncState};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, SqliteStoreOptions};

/// Owns every sync component for one signed-in session
pub struct SyncCore {
    config: SyncConfig,
    store: Arc<dyn KeyValueStore>,
    monitor: NetworkMonitor,
    state: StateHandle,
    cache: CacheStore,
    queue: DurableQueue,
    enqueuer: ActionEnqueuer,
    engine: SyncEngine,
    realtime: RealtimeChannel,
    bridge: BackgroundSyncBridge,
    bridge_listener: Option<BridgeListener>,
    network_subscription: Option<NetworkSubscription>,
    navigation: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl SyncCore {
    /// Opens the SQLite store at `config.database_path` and connects the
    /// HTTP and WebSocket seams.
    pub async fn open(config: SyncConfig, initial: Connectivity) -> SyncResult<Self> {
        config.validate()?;

        if let Some(parent) = Path::new(&config.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SyncError::Config(format!("Cannot create database directory: {e}")))?;
            }
        }

        let store = SqliteStore::open(&config.database_path, SqliteStoreOptions::default()).await?;
        let api = HttpReplayApi::new(&config)?;
        let connector = WebSocketConnector::new(&config);

        Self::with_parts(config, Arc::new(store), Arc::new(api), Arc::new(connector), initial).await
    }

    /// Builds the core on caller-provided storage and network seams.
    pub async fn with_parts(
        config: SyncConfig,
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn ReplayApi>,
        connector: Arc<dyn RealtimeConnector>,
        initial: Connectivity,
    ) -> SyncResult<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Runtime(format!("SyncCore needs a Tokio runtime: {e}")))?;

        let monitor = NetworkMonitor::new(initial);
        let state = StateHandle::new(SyncState {
            online: initial.is_online(),
            ..Default::default()
        });
        let cache = CacheStore::new(store.clone());
        let queue = DurableQueue::new(store.clone());

        let engine = SyncEngine::new(
            queue.clone(),
            api.clone(),
            monitor.clone(),
            state.clone(),
            store.clone(),
            ReplayPolicy::from_config(&config),
        );
        engine.restore().await?;

        let enqueuer = ActionEnqueuer::new(
            queue.clone(),
            api,
            monitor.clone(),
            state.clone(),
            Arc::new(ActionIdGenerator::new()),
            config.request_timeout,
            config.fallback_to_queue,
        );
        enqueuer.observe_queue().await?;

        let realtime = RealtimeChannel::new(
            connector,
            HandlerRegistry::with_cache_defaults(&cache),
            ReconnectPolicy::from_config(&config),
        );

        let network_subscription = {
            let state = state.clone();
            let engine = engine.clone();
            let sync_on_reconnect = config.sync_on_reconnect;
            monitor.subscribe(move |connectivity| {
                state.set_online(connectivity.is_online());
                if connectivity.is_online() && sync_on_reconnect {
                    engine.spawn_sync(&runtime, "reconnect");
                }
            })
        };

        let bridge = BackgroundSyncBridge::new(config.bridge_buffer);
        let (navigation_tx, navigation_rx) = mpsc::unbounded_channel();
        let bridge_listener = bridge.attach(engine.clone(), Some(navigation_tx))?;

        let snapshot = state.snapshot();
        tracing::info!(
            online = snapshot.online,
            pending_count = snapshot.pending_count,
            "Sync core started"
        );

        Ok(Self {
            config,
            store,
            monitor,
            state,
            cache,
            queue,
            enqueuer,
            engine,
            realtime,
            bridge,
            bridge_listener: Some(bridge_listener),
            network_subscription: Some(network_subscription),
            navigation: parking_lot::Mutex::new(Some(navigation_rx)),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn enqueuer(&self) -> &ActionEnqueuer {
        &self.enqueuer
    }

    pub fn realtime(&self) -> &RealtimeChannel {
        &self.realtime
    }

    /// Sender to hand to the background context.
    pub fn bridge_sender(&self) -> BridgeSender {
        self.bridge.sender()
    }

    pub fn bridge_status(&self) -> Option<BridgeStatus> {
        self.bridge_listener.as_ref().map(BridgeListener::status)
    }

    /// URLs from notification clicks. Can be taken once.
    pub fn take_navigation_receiver(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.navigation.lock().take()
    }

    pub fn state(&self) -> SyncState {
        self.state.snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Feeds a platform connectivity signal into the monitor.
    pub fn report_connectivity(&self, connectivity: Connectivity) -> bool {
        self.monitor.report(connectivity)
    }

    pub async fn submit(&self, action_type: ActionType, payload: Value) -> SyncResult<Submission> {
        self.enqueuer.submit(action_type, payload).await
    }

    pub async fn sync(&self) -> SyncResult<SyncOutcome> {
        self.engine.sync().await
    }

    pub fn subscribe_realtime(&self, scope: impl Into<String>) -> RealtimeSubscription {
        self.realtime.subscribe(scope)
    }

    async fn stop(&mut self) {
        self.network_subscription.take();
        if let Some(listener) = self.bridge_listener.take() {
            listener.shutdown().await;
        }
        self.engine.shutdown().await;
    }

    /// Stops background tasks; persisted data is kept.
    pub async fn shutdown(mut self) {
        self.stop().await;
        tracing::info!("Sync core stopped");
    }

    /// Stops background tasks and erases the queue, the cache and sync
    /// metadata. Realtime subscriptions are owned by the caller and must be
    /// closed separately.
    pub async fn logout(mut self) -> SyncResult<()> {
        self.stop().await;

        let pending = self.queue.len().await?;
        self.queue.clear().await?;
        let cleared = self.cache.clear_all().await?;
        self.store.remove(LAST_SYNC_KEY).await?;
        self.store.compact().await?;

        tracing::info!(discarded_actions = pending, cleared_entries = cleared, "Logged out, local data erased");
        Ok(())
    }
}
