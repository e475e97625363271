//! Connectivity state machine
//!
//! The host feeds platform connectivity signals into [`NetworkMonitor::report`].
//! Only genuine transitions are delivered: each subscriber sees every
//! ONLINE/OFFLINE change exactly once, in registration order. There is no
//! debounce; subscribers that react expensively to flapping must debounce
//! themselves.
//!
//! A listener may itself call `report`. The nested transition is queued and
//! delivered after the current one has reached every subscriber, so all
//! subscribers observe the same order and end on the current state.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }

    pub fn from_online(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

type Listener = Arc<dyn Fn(Connectivity) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

#[derive(Default)]
struct Dispatch {
    /// Transitions not yet delivered, oldest first
    pending: VecDeque<Connectivity>,
    /// Some `report` call is delivering; it drains `pending` before returning
    delivering: bool,
}

struct MonitorInner {
    state: watch::Sender<Connectivity>,
    registry: Mutex<Registry>,
    dispatch: Mutex<Dispatch>,
}

#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            inner: Arc::new(MonitorInner {
                state,
                registry: Mutex::new(Registry::default()),
                dispatch: Mutex::new(Dispatch::default()),
            }),
        }
    }

    pub fn current(&self) -> Connectivity {
        *self.inner.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Feed a platform connectivity signal. Returns whether it was a transition.
    ///
    /// If another call is already delivering (a listener reporting, or a
    /// racing thread) the transition is queued behind it and this call
    /// returns without waiting for delivery.
    pub fn report(&self, connectivity: Connectivity) -> bool {
        {
            // State change and enqueue under one lock keep both in the same order
            let mut dispatch = self.inner.dispatch.lock();
            let changed = self.inner.state.send_if_modified(|state| {
                if *state == connectivity {
                    false
                } else {
                    *state = connectivity;
                    true
                }
            });
            if !changed {
                return false;
            }

            tracing::info!(connectivity = ?connectivity, "Connectivity changed");
            dispatch.pending.push_back(connectivity);
            if dispatch.delivering {
                return true;
            }
            dispatch.delivering = true;
        }

        let _unwind = DeliveryUnwind(&self.inner.dispatch);
        loop {
            let next = {
                let mut dispatch = self.inner.dispatch.lock();
                let next = dispatch.pending.pop_front();
                if next.is_none() {
                    dispatch.delivering = false;
                }
                next
            };
            let Some(transition) = next else {
                break;
            };

            // Listeners run outside both locks so they may report, subscribe or unsubscribe
            let listeners: Vec<Listener> = self
                .inner
                .registry
                .lock()
                .listeners
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect();

            for listener in listeners {
                listener(transition);
            }
        }

        true
    }

    pub fn set_online(&self, online: bool) -> bool {
        self.report(Connectivity::from_online(online))
    }

    /// Registers `callback` for future transitions. Dropping the returned
    /// handle unsubscribes it.
    pub fn subscribe<F>(&self, callback: F) -> NetworkSubscription
    where
        F: Fn(Connectivity) + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(callback)));

        NetworkSubscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    /// Async view of the current state.
    pub fn watch(&self) -> watch::Receiver<Connectivity> {
        self.inner.state.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().listeners.len()
    }
}

/// Releases the delivering flag if a listener panics
struct DeliveryUnwind<'a>(&'a Mutex<Dispatch>);

impl Drop for DeliveryUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut dispatch = self.0.lock();
            dispatch.pending.clear();
            dispatch.delivering = false;
        }
    }
}

/// Unsubscribes its callback when dropped
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct NetworkSubscription {
    id: u64,
    monitor: Weak<MonitorInner>,
}

impl NetworkSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for NetworkSubscription {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor
                .registry
                .lock()
                .listeners
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<(&'static str, Connectivity)>>>, impl Fn(&'static str) -> Listener) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &'static str| -> Listener {
                let log = log.clone();
                Arc::new(move |c| log.lock().push((name, c)))
            }
        };
        (log, make)
    }

    #[test]
    fn test_fires_once_per_transition_in_order() {
        let monitor = NetworkMonitor::new(Connectivity::Online);
        let (log, make) = recorder();
        let a = make("a");
        let b = make("b");
        let _sa = monitor.subscribe(move |c| a(c));
        let _sb = monitor.subscribe(move |c| b(c));

        assert!(monitor.report(Connectivity::Offline));
        assert!(!monitor.report(Connectivity::Offline));
        assert!(!monitor.report(Connectivity::Offline));
        assert!(monitor.report(Connectivity::Online));
        assert!(!monitor.set_online(true));

        assert_eq!(
            *log.lock(),
            vec![
                ("a", Connectivity::Offline),
                ("b", Connectivity::Offline),
                ("a", Connectivity::Online),
                ("b", Connectivity::Online),
            ]
        );
    }

    #[test]
    fn test_drop_unsubscribes() {
        let monitor = NetworkMonitor::new(Connectivity::Offline);
        let (log, make) = recorder();
        let a = make("a");
        let sub = monitor.subscribe(move |c| a(c));
        assert_eq!(monitor.subscriber_count(), 1);

        sub.unsubscribe();
        assert_eq!(monitor.subscriber_count(), 0);

        monitor.set_online(true);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_listener_may_report_reentrantly() {
        let monitor = NetworkMonitor::new(Connectivity::Online);
        let inner = monitor.clone();
        let _sub = monitor.subscribe(move |c| {
            // a captive-portal check flipping straight back online
            if c == Connectivity::Offline {
                inner.report(Connectivity::Online);
            }
        });

        monitor.report(Connectivity::Offline);
        assert!(monitor.is_online());
    }

    #[test]
    fn test_nested_report_delivered_after_current_one() {
        let monitor = NetworkMonitor::new(Connectivity::Online);
        let (log, make) = recorder();

        let inner = monitor.clone();
        let a = make("a");
        let _sa = monitor.subscribe(move |c| {
            a(c);
            if c == Connectivity::Offline {
                inner.report(Connectivity::Online);
            }
        });
        let b = make("b");
        let _sb = monitor.subscribe(move |c| b(c));

        assert!(monitor.report(Connectivity::Offline));
        assert!(monitor.is_online());
        assert_eq!(
            *log.lock(),
            vec![
                ("a", Connectivity::Offline),
                ("b", Connectivity::Offline),
                ("a", Connectivity::Online),
                ("b", Connectivity::Online),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_sees_transitions() {
        let monitor = NetworkMonitor::new(Connectivity::Offline);
        let mut rx = monitor.watch();
        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connectivity::Online);
    }
}
