//! Access-control gate
//!
//! Keeps a local copy of the block-list, derived from `devices/{id}.status`
//! and refreshed by a single store subscription. Request-time checks only
//! read that copy.
//!
//! The gate fails open: a request without a device id, or any request
//! arriving before the first block-list snapshot, is allowed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::Result;
use crate::devices::DeviceStatus;
use crate::store::{SharedStore, path};
use crate::telemetry::{Failure, Telemetry};

/// Error code returned to blocked devices
pub const DEVICE_BLOCKED: &str = "DEVICE_BLOCKED";

/// Request facts the gate needs
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub device_id: Option<String>,
    pub endpoint: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl RequestInfo {
    /// Session metadata recorded for an allowed request
    fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("endpoint".to_string(), Value::from(self.endpoint.clone()));
        if let Some(ua) = &self.user_agent {
            metadata.insert("userAgent".to_string(), Value::from(ua.clone()));
        }
        if let Some(ip) = &self.ip_address {
            metadata.insert("ipAddress".to_string(), Value::from(ip.clone()));
        }
        metadata
    }
}

/// A known device passed the gate
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSeen {
    pub device_id: String,
    pub metadata: Map<String, Value>,
}

/// Body returned to a blocked device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeniedBody {
    pub success: bool,
    pub code: &'static str,
    pub error: String,
    pub admin_message: String,
    /// Truncated id of the requesting device
    pub device_id: String,
}

impl DeniedBody {
    fn new(device_id: &str) -> Self {
        Self {
            success: false,
            code: DEVICE_BLOCKED,
            error: "Device access denied".to_string(),
            admin_message: "Your device has been blocked by administrator for security reasons."
                .to_string(),
            device_id: truncate_device_id(device_id),
        }
    }
}

/// Outcome of a gate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DeniedBody),
}

impl Decision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// First eight characters of an id followed by `...`
#[must_use]
pub fn truncate_device_id(device_id: &str) -> String {
    let prefix: String = device_id.chars().take(8).collect();
    format!("{prefix}...")
}

/// Block-list cache with synchronous allow/deny
pub struct AccessControlGate {
    /// `None` until the first snapshot arrives
    cache: watch::Sender<Option<Arc<HashSet<String>>>>,
    seen: Option<mpsc::Sender<DeviceSeen>>,
    telemetry: Telemetry,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AccessControlGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessControlGate")
            .field("populated", &self.is_populated())
            .field("blocked", &self.blocked_count())
            .finish_non_exhaustive()
    }
}

impl AccessControlGate {
    /// Create a gate with an empty, unpopulated cache
    #[must_use]
    pub fn new(telemetry: Telemetry) -> Self {
        let (cache, _) = watch::channel(None);
        Self {
            cache,
            seen: None,
            telemetry,
            task: Mutex::new(None),
        }
    }

    /// Forward allowed, identified requests into `sink`
    #[must_use]
    pub fn with_seen_sink(mut self, sink: mpsc::Sender<DeviceSeen>) -> Self {
        self.seen = Some(sink);
        self
    }

    /// Subscribe to device status records and keep the cache current
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be created
    pub async fn attach(self: &Arc<Self>, store: Arc<dyn SharedStore>) -> Result<()> {
        let mut sub = store.subscribe(path::DEVICES).await?;
        let gate = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            while let Some(snapshot) = sub.recv_latest().await {
                let Some(gate) = gate.upgrade() else {
                    break;
                };
                gate.replace(blocked_ids(snapshot.value.as_ref()));
            }
        });

        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Swap in a new block-list
    fn replace(&self, blocked: HashSet<String>) {
        let count = blocked.len();
        let first = self.cache.send_replace(Some(Arc::new(blocked))).is_none();
        if first {
            tracing::info!(blocked = count, "block-list loaded");
        } else {
            tracing::debug!(blocked = count, "block-list updated");
        }
    }

    /// Whether the cached block-list contains `device_id`
    #[must_use]
    pub fn is_blocked(&self, device_id: &str) -> bool {
        if device_id.is_empty() {
            return false;
        }
        self.cache
            .borrow()
            .as_ref()
            .is_some_and(|blocked| blocked.contains(device_id))
    }

    /// Decide whether a request may proceed
    ///
    /// Allowed requests that carry a device id are reported to the seen
    /// sink without waiting.
    #[must_use]
    pub fn check(&self, request: &RequestInfo) -> Decision {
        let Some(device_id) = request
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            return Decision::Allow;
        };

        if self.is_blocked(device_id) {
            tracing::warn!(
                device_id = %truncate_device_id(device_id),
                endpoint = %request.endpoint,
                "blocked device denied"
            );
            return Decision::Deny(DeniedBody::new(device_id));
        }

        self.report_seen(device_id, request);
        Decision::Allow
    }

    fn report_seen(&self, device_id: &str, request: &RequestInfo) {
        let Some(sink) = &self.seen else {
            return;
        };
        let event = DeviceSeen {
            device_id: device_id.to_string(),
            metadata: request.metadata(),
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = sink.try_send(event) {
            tracing::debug!("device-seen queue full, dropping event");
            self.telemetry.record(Failure::SeenDropped);
        }
    }

    /// Resolve once the first block-list snapshot has been applied
    pub async fn wait_ready(&self) {
        let mut rx = self.cache.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(Option::is_some).await;
    }

    /// Whether a block-list snapshot has been applied
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.cache.borrow().is_some()
    }

    /// Number of blocked devices in the cache
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.cache.borrow().as_ref().map_or(0, |blocked| blocked.len())
    }

    /// Stop following the store; the last cache keeps serving
    pub fn shutdown(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

impl Drop for AccessControlGate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Ids whose status record says blocked
fn blocked_ids(devices: Option<&Value>) -> HashSet<String> {
    let blocked = DeviceStatus::Blocked.as_str();
    devices
        .and_then(Value::as_object)
        .map(|records| {
            records
                .iter()
                .filter(|(_, record)| record.get("status").and_then(Value::as_str) == Some(blocked))
                .map(|(id, _)| id.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    fn request(device_id: &str) -> RequestInfo {
        RequestInfo {
            device_id: Some(device_id.to_string()),
            endpoint: "/api/tools".to_string(),
            user_agent: Some("test-agent".to_string()),
            ip_address: Some("127.0.0.1".to_string()),
        }
    }

    async fn wait_until(gate: &AccessControlGate, predicate: impl Fn(&AccessControlGate) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !predicate(gate) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("gate did not converge");
    }

    #[test]
    fn truncates_to_eight_characters() {
        assert_eq!(truncate_device_id("web_1a2b3c4d5e"), "web_1a2b...");
        assert_eq!(truncate_device_id("abc"), "abc...");
    }

    #[test]
    fn unpopulated_gate_fails_open() {
        let gate = AccessControlGate::new(Telemetry::new());
        assert!(!gate.is_populated());
        assert!(!gate.is_blocked("dev1"));
        assert!(gate.check(&request("dev1")).is_allowed());
    }

    #[test]
    fn missing_device_id_is_allowed() {
        let gate = AccessControlGate::new(Telemetry::new());
        gate.replace(HashSet::from(["dev1".to_string()]));

        assert!(gate.check(&RequestInfo::default()).is_allowed());
        assert!(gate.check(&request("  ")).is_allowed());
        assert!(!gate.is_blocked(""));
    }

    #[test]
    fn denied_body_matches_wire_shape() {
        let gate = AccessControlGate::new(Telemetry::new());
        gate.replace(HashSet::from(["web_abcdef123".to_string()]));

        let Decision::Deny(body) = gate.check(&request("web_abcdef123")) else {
            panic!("expected deny");
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "success": false,
                "code": "DEVICE_BLOCKED",
                "error": "Device access denied",
                "adminMessage": "Your device has been blocked by administrator for security reasons.",
                "deviceId": "web_abcd..."
            })
        );
    }

    #[tokio::test]
    async fn follows_device_status_records() {
        let store = MemoryStore::new();
        store
            .set("devices/dev2", json!({"status": "active"}))
            .await
            .unwrap();

        let gate = Arc::new(AccessControlGate::new(Telemetry::new()));
        gate.attach(Arc::new(store.clone())).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), gate.wait_ready())
            .await
            .unwrap();
        assert!(!gate.is_blocked("dev2"));

        store
            .set("devices/dev1", json!({"status": "blocked", "blockReason": "policy"}))
            .await
            .unwrap();
        wait_until(&gate, |g| g.is_blocked("dev1")).await;
        assert_eq!(gate.blocked_count(), 1);

        store.set("devices/dev1/status", json!("active")).await.unwrap();
        wait_until(&gate, |g| !g.is_blocked("dev1")).await;
    }

    #[tokio::test]
    async fn cache_survives_disconnect() {
        let store = MemoryStore::new();
        store
            .set("devices/dev1", json!({"status": "blocked"}))
            .await
            .unwrap();
        let gate = Arc::new(AccessControlGate::new(Telemetry::new()));
        gate.attach(Arc::new(store.clone())).await.unwrap();
        wait_until(&gate, |g| g.is_blocked("dev1")).await;

        store.set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.is_blocked("dev1"));
    }

    #[tokio::test]
    async fn allowed_requests_report_seen() {
        let (tx, mut rx) = mpsc::channel(1);
        let telemetry = Telemetry::new();
        let gate = AccessControlGate::new(telemetry.clone()).with_seen_sink(tx);

        assert!(gate.check(&request("dev1")).is_allowed());
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.device_id, "dev1");
        assert_eq!(seen.metadata["endpoint"], "/api/tools");
        assert_eq!(seen.metadata["userAgent"], "test-agent");

        // Queue of one: the second event overflows and is counted
        assert!(gate.check(&request("dev1")).is_allowed());
        assert!(gate.check(&request("dev1")).is_allowed());
        assert_eq!(telemetry.count(Failure::SeenDropped), 1);
    }
}
