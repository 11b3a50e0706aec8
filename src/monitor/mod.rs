//! Store connectivity monitor
//!
//! Follows the store-managed `.info/connected` flag. Observers hear about
//! every transition; reconnect actions run when a link that was known to be
//! down comes back. A disconnect triggers nothing beyond notification.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::Result;
use crate::store::{SharedStore, path};

/// Work to redo after the store link comes back
#[async_trait]
pub trait ReconnectAction: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Run after a disconnected link reconnects
    async fn on_reconnect(&self);
}

type Observer = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Inner {
    observers: Vec<Observer>,
    actions: Vec<Arc<dyn ReconnectAction>>,
}

/// Watches store connectivity for one process
pub struct ConnectionMonitor {
    state: watch::Sender<Option<bool>>,
    inner: Mutex<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("connected", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ConnectionMonitor {
    /// Subscribe to the connectivity flag and start following it
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be created
    pub async fn start(store: Arc<dyn SharedStore>) -> Result<Arc<Self>> {
        let mut sub = store.subscribe(path::CONNECTED).await?;
        let (state, _) = watch::channel(None);
        let monitor = Arc::new(Self {
            state,
            inner: Mutex::new(Inner::default()),
            task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&monitor);
        let task = tokio::spawn(async move {
            while let Some(snapshot) = sub.recv().await {
                let connected = snapshot
                    .value
                    .as_ref()
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.apply(connected).await;
            }
        });
        *lock(&monitor.task) = Some(task);

        Ok(monitor)
    }

    /// Record an observed connectivity value
    async fn apply(&self, connected: bool) {
        let (observers, actions) = {
            let inner = lock(&self.inner);
            let previous = self.state.send_replace(Some(connected));
            if previous == Some(connected) {
                return;
            }

            let actions = if connected && previous == Some(false) {
                inner.actions.clone()
            } else {
                Vec::new()
            };
            (inner.observers.clone(), actions)
        };

        tracing::info!(connected, "store connectivity changed");
        for observer in &observers {
            observer(connected);
        }

        for action in actions {
            tracing::debug!(action = action.name(), "running reconnect action");
            action.on_reconnect().await;
        }
    }

    /// Register a connectivity observer
    ///
    /// Called right away with the current state when it is known, then on
    /// every transition.
    pub fn on_connectivity_change<F>(&self, observer: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let observer: Observer = Arc::new(observer);
        let current = {
            let mut inner = lock(&self.inner);
            inner.observers.push(Arc::clone(&observer));
            *self.state.borrow()
        };
        if let Some(connected) = current {
            observer(connected);
        }
    }

    /// Register work to run after each reconnect
    pub fn add_reconnect_action(&self, action: Arc<dyn ReconnectAction>) {
        tracing::debug!(action = action.name(), "reconnect action registered");
        lock(&self.inner).actions.push(action);
    }

    /// Last observed connectivity, `None` before the first report
    #[must_use]
    pub fn is_connected(&self) -> Option<bool> {
        *self.state.borrow()
    }

    /// Receiver following the connectivity state
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Option<bool>> {
        self.state.subscribe()
    }

    /// Stop following connectivity
    pub fn shutdown(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        let mut inner = lock(&self.inner);
        inner.observers.clear();
        inner.actions.clear();
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;

    struct Counting {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ReconnectAction for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn on_reconnect(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn settle(monitor: &ConnectionMonitor, expected: bool) {
        let mut rx = monitor.watch();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|state| *state == Some(expected)),
        )
        .await
        .expect("connectivity did not settle")
        .expect("monitor dropped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn observer_fires_immediately_then_on_transitions() {
        let store = MemoryStore::new();
        let monitor = ConnectionMonitor::start(Arc::new(store.clone()))
            .await
            .unwrap();
        settle(&monitor, true).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.on_connectivity_change(move |c| lock(&sink).push(c));
        assert_eq!(*lock(&seen), vec![true]);

        store.set_online(false);
        settle(&monitor, false).await;
        store.set_online(true);
        settle(&monitor, true).await;

        assert_eq!(*lock(&seen), vec![true, false, true]);
    }

    #[tokio::test]
    async fn reconnect_actions_run_only_after_disconnect() {
        let store = MemoryStore::new();
        let monitor = ConnectionMonitor::start(Arc::new(store.clone()))
            .await
            .unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        monitor.add_reconnect_action(Arc::new(Counting {
            runs: Arc::clone(&runs),
        }));

        // Initial connect is not a reconnect
        settle(&monitor, true).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        store.set_online(false);
        settle(&monitor, false).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        store.set_online(true);
        settle(&monitor, true).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn observers_may_register_from_a_callback() {
        let store = MemoryStore::new();
        let monitor = ConnectionMonitor::start(Arc::new(store.clone()))
            .await
            .unwrap();
        settle(&monitor, true).await;

        let runs = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&monitor);
        let counter = Arc::clone(&runs);
        monitor.on_connectivity_change(move |connected| {
            if connected {
                return;
            }
            if let Some(monitor) = weak.upgrade() {
                monitor.add_reconnect_action(Arc::new(Counting {
                    runs: Arc::clone(&counter),
                }));
                monitor.on_connectivity_change(|_| {});
            }
        });

        store.set_online(false);
        settle(&monitor, false).await;
        store.set_online(true);
        settle(&monitor, true).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_following() {
        let store = MemoryStore::new();
        let monitor = ConnectionMonitor::start(Arc::new(store.clone()))
            .await
            .unwrap();
        settle(&monitor, true).await;

        monitor.shutdown();
        store.set_online(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.is_connected(), Some(true));
    }
}
