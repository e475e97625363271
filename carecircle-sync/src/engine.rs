//! Queue replay engine
//!
//! Drains the [`DurableQueue`] strictly in insertion order. A pass stops at
//! the first transient failure (or at a head action still inside its backoff
//! window) so later actions never overtake earlier ones. Rejected and
//! exhausted actions are recorded in [`SyncState`] and dropped.
//!
//! Only one pass runs at a time. The `syncing` flag is taken with a single
//! compare-exchange, so concurrent triggers from the UI, the connectivity
//! listener and the background bridge collapse into one drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};

use crate::api::{ApiError, FailureClass, ReplayApi};
use crate::clock::now_millis;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::network::NetworkMonitor;
use crate::queue::{ActionPatch, DurableQueue, PendingAction};
use crate::state::{ErrorKind, LastError, StateHandle, SyncState};
use crate::storage::KeyValueStore;

/// Storage key of the last completed pass, in epoch milliseconds
pub const LAST_SYNC_KEY: &str = "last_sync_at";

/// Retry and timeout settings of the replay loop
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPolicy {
    /// Attempts per action, including the first
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
    /// Schedule a delayed pass after halting on a deferred action
    pub auto_retry: bool,
}

impl ReplayPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            request_timeout: config.request_timeout,
            auto_retry: config.auto_retry,
        }
    }

    /// Wait before the next attempt of an action that has now failed
    /// `retry_count` times: `min(base * 2^(retry_count - 1), max)`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry_count.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// What a completed pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub replayed: usize,
    pub dropped: usize,
    pub remaining: usize,
    /// The pass stopped before the end of the queue
    pub halted: bool,
    /// When the head action becomes due again, if the pass halted
    pub deferred_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass holds the syncing flag
    AlreadyRunning,
    /// The engine was shut down
    Closed,
    /// The monitor reports no connectivity; the queue was not touched
    Offline,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Default)]
struct RetryTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct EngineInner {
    queue: DurableQueue,
    api: Arc<dyn ReplayApi>,
    monitor: NetworkMonitor,
    state: StateHandle,
    store: Arc<dyn KeyValueStore>,
    policy: ReplayPolicy,
    syncing: AtomicBool,
    closed: AtomicBool,
    retry_timer: Mutex<RetryTimer>,
    /// Passes started in the background, aborted on shutdown
    tasks: Mutex<JoinSet<()>>,
}

/// Holds the syncing flag for the lifetime of a pass
struct SyncingGuard<'a> {
    inner: &'a EngineInner,
}

impl<'a> SyncingGuard<'a> {
    fn acquire(inner: &'a EngineInner) -> Option<Self> {
        inner
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        inner.state.update(|state| state.syncing = true);
        Some(Self { inner })
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.inner.syncing.store(false, Ordering::Release);
        self.inner.state.update(|state| state.syncing = false);
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        queue: DurableQueue,
        api: Arc<dyn ReplayApi>,
        monitor: NetworkMonitor,
        state: StateHandle,
        store: Arc<dyn KeyValueStore>,
        policy: ReplayPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                queue,
                api,
                monitor,
                state,
                store,
                policy,
                syncing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                retry_timer: Mutex::new(RetryTimer::default()),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Reloads the persisted last-sync time and the queue length into state.
    pub async fn restore(&self) -> SyncResult<()> {
        let last_sync_at = self
            .inner
            .store
            .get(LAST_SYNC_KEY)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis);
        let pending_count = self.inner.queue.len().await?;

        self.inner.state.update(|state| {
            state.last_sync_at = last_sync_at;
            state.pending_count = pending_count;
        });

        tracing::debug!(pending_count, ?last_sync_at, "Restored sync state");
        Ok(())
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SyncState {
        self.inner.state.snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn clear_last_error(&self) {
        self.inner.state.update(|state| state.last_error = None);
    }

    pub fn policy(&self) -> &ReplayPolicy {
        &self.inner.policy
    }

    /// Runs one replay pass over the queue.
    ///
    /// Individual action failures never surface here; they are folded into
    /// the action's retry bookkeeping and [`SyncState::last_error`]. An `Err`
    /// means local storage failed mid-pass.
    pub async fn sync(&self) -> SyncResult<SyncOutcome> {
        if self.is_closed() {
            return Ok(SyncOutcome::Closed);
        }

        let Some(_guard) = SyncingGuard::acquire(&self.inner) else {
            tracing::debug!("Sync already in progress, skipping");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        if !self.inner.monitor.is_online() {
            tracing::debug!("Offline, skipping sync");
            return Ok(SyncOutcome::Offline);
        }

        self.cancel_retry_timer();

        let report = self.drain().await?;

        if let Some(at) = report.deferred_until {
            self.schedule_retry(at);
        }

        tracing::info!(
            replayed = report.replayed,
            dropped = report.dropped,
            remaining = report.remaining,
            halted = report.halted,
            "Sync pass finished"
        );

        Ok(SyncOutcome::Completed(report))
    }

    async fn drain(&self) -> SyncResult<SyncReport> {
        let inner = &self.inner;
        let actions = inner.queue.list().await?;
        let mut report = SyncReport::default();

        for action in actions {
            let now = now_millis();
            if !action.is_due(now) {
                tracing::debug!(
                    action_id = %action.id,
                    next_attempt_at = ?action.next_attempt_at,
                    "Head action is backing off, halting"
                );
                report.halted = true;
                report.deferred_until = action.next_attempt_at;
                break;
            }

            let error = match self.replay(&action).await {
                Ok(()) => {
                    inner.queue.remove(&action.id).await?;
                    report.replayed += 1;
                    tracing::debug!(action_id = %action.id, action_type = %action.action_type, "Replayed action");
                    continue;
                }
                Err(error) => error,
            };

            let message = logger_redacted::redact(&error.to_string());
            let retry_count = action.retry_count.saturating_add(1);

            match error.class() {
                FailureClass::Transient if retry_count < inner.policy.max_retries => {
                    let next_attempt_at = chrono::Duration::from_std(inner.policy.backoff(retry_count))
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                        .unwrap_or(now);

                    inner
                        .queue
                        .update(
                            &action.id,
                            ActionPatch {
                                retry_count: Some(retry_count),
                                next_attempt_at: Some(next_attempt_at),
                                last_error: Some(message.clone()),
                            },
                        )
                        .await?;

                    tracing::warn!(
                        action_id = %action.id,
                        action_type = %action.action_type,
                        retry_count,
                        error = %message,
                        "Transient replay failure, halting pass"
                    );
                    self.record_error(ErrorKind::Transient, &action, message);

                    report.halted = true;
                    report.deferred_until = Some(next_attempt_at);
                    break;
                }
                FailureClass::Transient => {
                    inner.queue.remove(&action.id).await?;
                    report.dropped += 1;
                    tracing::error!(
                        action_id = %action.id,
                        action_type = %action.action_type,
                        retry_count,
                        error = %message,
                        "Retry budget exhausted, dropping action"
                    );
                    self.record_error(ErrorKind::Exhausted, &action, message);
                }
                FailureClass::Permanent => {
                    inner.queue.remove(&action.id).await?;
                    report.dropped += 1;
                    tracing::error!(
                        action_id = %action.id,
                        action_type = %action.action_type,
                        status = ?error.status(),
                        error = %message,
                        "Action rejected, dropping"
                    );
                    self.record_error(ErrorKind::Permanent, &action, message);
                }
            }
        }

        report.remaining = inner.queue.len().await?;

        // Local data may have been erased while the last call was in flight
        if self.is_closed() {
            tracing::debug!("Engine closed during pass, not recording it");
            return Ok(report);
        }

        let finished_at = now_millis();
        inner
            .store
            .set(LAST_SYNC_KEY, &finished_at.timestamp_millis().to_string())
            .await?;

        let clean = !report.halted && report.remaining == 0;
        let remaining = report.remaining;
        inner.state.update(|state| {
            state.last_sync_at = Some(finished_at);
            state.pending_count = remaining;
            let transient = matches!(&state.last_error, Some(e) if e.kind == ErrorKind::Transient);
            if clean && transient {
                state.last_error = None;
            }
        });

        Ok(report)
    }

    async fn replay(&self, action: &PendingAction) -> Result<(), ApiError> {
        let timeout = self.inner.policy.request_timeout;
        let call = self
            .inner
            .api
            .execute(action.action_type, &action.payload, &action.id);

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(ApiError::Timeout(timeout)),
        }
    }

    fn record_error(&self, kind: ErrorKind, action: &PendingAction, message: String) {
        let last_error = LastError {
            kind,
            action_id: action.id.clone(),
            action_type: action.action_type,
            message,
            at: now_millis(),
        };
        self.inner
            .state
            .update(|state| state.last_error = Some(last_error));
    }

    /// Arms a single delayed pass for when the head action becomes due.
    fn schedule_retry(&self, at: DateTime<Utc>) {
        if !self.inner.policy.auto_retry {
            return;
        }
        let Ok(delay) = (at - now_millis()).to_std() else {
            return;
        };
        if delay.is_zero() {
            return;
        }

        let mut timer = self.inner.retry_timer.lock();
        timer.generation += 1;
        let generation = timer.generation;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }

        let weak = Arc::downgrade(&self.inner);
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut timer = inner.retry_timer.lock();
                if timer.generation != generation {
                    return;
                }
                // Detach so the pass below does not abort its own task
                timer.handle = None;
            }

            tracing::debug!("Retry timer fired");
            SyncEngine { inner }.spawn_sync(&Handle::current(), "retry timer");
        }));

        tracing::debug!(?delay, "Scheduled retry pass");
    }

    fn cancel_retry_timer(&self) {
        let mut timer = self.inner.retry_timer.lock();
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
    }

    pub fn has_pending_retry(&self) -> bool {
        self.inner.retry_timer.lock().handle.is_some()
    }

    /// Runs a pass as a background task on `runtime`. The task is tracked so
    /// [`Self::shutdown`] can stop it.
    pub fn spawn_sync(&self, runtime: &Handle, trigger: &'static str) {
        if self.is_closed() {
            return;
        }

        let engine = self.clone();
        let mut tasks = self.inner.tasks.lock();
        // Reap finished passes
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(
            async move {
                if let Err(e) = engine.sync().await {
                    tracing::warn!(error = %e, trigger, "Background sync failed");
                }
            },
            runtime,
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Refuses further passes, cancels the retry timer and aborts background
    /// passes, waiting until they are gone. An in-flight API call may still
    /// land on the server.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.cancel_retry_timer();

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}
