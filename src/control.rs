//! Server-side control plane
//!
//! Owns the registry, gate, bus and monitor of one server process and the
//! background tasks that connect them. Handlers reach it through axum state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::Result;
use crate::commands::CommandBus;
use crate::config::Config;
use crate::devices::DeviceRegistry;
use crate::gate::{AccessControlGate, DeviceSeen};
use crate::monitor::ConnectionMonitor;
use crate::store::{MemoryStore, SharedStore, path};
use crate::telemetry::Telemetry;

/// Which store the control plane ended up running against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// The configured, shared store
    Shared,
    /// A private in-memory substitute; commands reach this process only
    Degraded,
}

/// Registry, gate, bus and monitor for one server process
pub struct ControlPlane {
    store: Arc<dyn SharedStore>,
    mode: StoreMode,
    registry: DeviceRegistry,
    bus: CommandBus,
    gate: Arc<AccessControlGate>,
    monitor: Arc<ConnectionMonitor>,
    telemetry: Telemetry,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("mode", &self.mode)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    /// Connect to `store` and start every background task
    ///
    /// If the store does not report connected within the configured timeout
    /// the control plane runs degraded: a fresh in-memory store, no gate
    /// subscription (every request is allowed).
    ///
    /// # Errors
    ///
    /// Returns error if a subscription on the chosen store fails
    pub async fn start(store: Arc<dyn SharedStore>, config: &Config) -> Result<Arc<Self>> {
        let telemetry = Telemetry::new();

        let (store, mode) = if wait_connected(&store, config.store.connect_timeout).await {
            (store, StoreMode::Shared)
        } else {
            tracing::warn!(
                timeout_ms = u64::try_from(config.store.connect_timeout.as_millis()).unwrap_or(u64::MAX),
                "shared store unreachable, running degraded with a local store"
            );
            let local: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
            (local, StoreMode::Degraded)
        };

        let bus = CommandBus::new(Arc::clone(&store), telemetry.clone());
        let registry = DeviceRegistry::new(Arc::clone(&store), bus.clone(), telemetry.clone());

        let (seen_tx, seen_rx) = mpsc::channel(config.gate.seen_queue);
        let gate = Arc::new(AccessControlGate::new(telemetry.clone()).with_seen_sink(seen_tx));
        if mode == StoreMode::Shared {
            gate.attach(Arc::clone(&store)).await?;
        }

        let monitor = ConnectionMonitor::start(Arc::clone(&store)).await?;

        let mut tasks = vec![tokio::spawn(record_seen(registry.clone(), seen_rx))];
        if let Some(ttl) = config.registry.session_ttl {
            tasks.push(tokio::spawn(sweep_sessions(
                registry.clone(),
                ttl,
                config.registry.sweep_interval,
            )));
        }

        tracing::info!(?mode, "control plane started");
        Ok(Arc::new(Self {
            store,
            mode,
            registry,
            bus,
            gate,
            monitor,
            telemetry,
            tasks: Mutex::new(tasks),
        }))
    }

    #[must_use]
    pub const fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Store the control plane is running against
    #[must_use]
    pub fn store(&self) -> Arc<dyn SharedStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub const fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn bus(&self) -> &CommandBus {
        &self.bus
    }

    #[must_use]
    pub const fn gate(&self) -> &Arc<AccessControlGate> {
        &self.gate
    }

    #[must_use]
    pub const fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    #[must_use]
    pub const fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Stop all background work
    pub fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.gate.shutdown();
        self.monitor.shutdown();
        tracing::info!("control plane stopped");
    }
}

/// Wait for the store to report connected
async fn wait_connected(store: &Arc<dyn SharedStore>, timeout: Duration) -> bool {
    let mut sub = match store.subscribe(path::CONNECTED).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::warn!(error = %e, "cannot watch store connectivity");
            return false;
        }
    };
    let connected = async {
        while let Some(snapshot) = sub.recv().await {
            if snapshot.value.as_ref().and_then(serde_json::Value::as_bool) == Some(true) {
                return true;
            }
        }
        false
    };
    tokio::time::timeout(timeout, connected)
        .await
        .unwrap_or(false)
}

/// Feed gate sightings into the registry
async fn record_seen(registry: DeviceRegistry, mut rx: mpsc::Receiver<DeviceSeen>) {
    while let Some(seen) = rx.recv().await {
        registry
            .register_or_update(&seen.device_id, seen.metadata)
            .await;
    }
}

/// Periodically evict sessions idle for longer than `ttl`
async fn sweep_sessions(registry: DeviceRegistry, ttl: Duration, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = registry.prune_stale(ttl).await {
            tracing::warn!(error = %e, "session sweep failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::gate::RequestInfo;

    fn config() -> Config {
        let mut config = Config::default();
        config.store.connect_timeout = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn starts_shared_when_store_is_online() {
        let store = MemoryStore::new();
        store
            .set("devices/dev1", json!({"status": "blocked"}))
            .await
            .unwrap();

        let plane = ControlPlane::start(Arc::new(store.clone()), &config())
            .await
            .unwrap();
        assert_eq!(plane.mode(), StoreMode::Shared);

        tokio::time::timeout(Duration::from_secs(2), plane.gate().wait_ready())
            .await
            .unwrap();
        assert!(plane.gate().is_blocked("dev1"));
        plane.shutdown();
    }

    #[tokio::test]
    async fn degrades_when_store_is_offline() {
        let store = MemoryStore::new();
        store
            .set("devices/dev1", json!({"status": "blocked"}))
            .await
            .unwrap();
        store.set_online(false);

        let plane = ControlPlane::start(Arc::new(store), &config())
            .await
            .unwrap();
        assert_eq!(plane.mode(), StoreMode::Degraded);
        assert!(!plane.gate().is_populated());
        assert!(!plane.gate().is_blocked("dev1"));
        plane.shutdown();
    }

    #[tokio::test]
    async fn allowed_requests_register_sessions() {
        let store = MemoryStore::new();
        let plane = ControlPlane::start(Arc::new(store.clone()), &config())
            .await
            .unwrap();

        let request = RequestInfo {
            device_id: Some("dev1".to_string()),
            endpoint: "/api/status".to_string(),
            ..RequestInfo::default()
        };
        assert!(plane.gate().check(&request).is_allowed());

        tokio::time::timeout(Duration::from_secs(2), async {
            while plane.registry().get("dev1").await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        plane.shutdown();
    }
}
