//! Registry of devices known to the fleet

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::types::{DeviceMetadata, DeviceRecord, DeviceSession, DeviceStatus, RESERVED_KEYS};
use crate::commands::{CommandBus, CommandKind};
use crate::store::{SharedStore, path};
use crate::telemetry::{Failure, Telemetry};
use crate::Result;

/// Reason recorded when an administrator gives none
pub const DEFAULT_REASON: &str = "Admin action";

/// Device sessions and administrative status, stored per device
///
/// Every write touches one device's records only, so different devices
/// never contend. Concurrent writes for the same device are last-write-wins.
#[derive(Clone)]
pub struct DeviceRegistry {
    store: Arc<dyn SharedStore>,
    bus: CommandBus,
    telemetry: Telemetry,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry").finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, bus: CommandBus, telemetry: Telemetry) -> Self {
        Self {
            store,
            bus,
            telemetry,
        }
    }

    /// Create or refresh a device's session
    ///
    /// Merges `metadata` into the stored session and stamps the access time.
    /// Failures are logged and counted; the caller is never interrupted.
    pub async fn register_or_update(&self, device_id: &str, metadata: DeviceMetadata) {
        if let Err(e) = path::validate_device_id(device_id) {
            tracing::warn!(error = %e, "refusing to register device");
            return;
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut fields: DeviceMetadata = metadata
            .into_iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .collect();
        fields.insert("lastAccess".to_string(), Value::from(now));
        fields.insert("lastUpdate".to_string(), Value::from(now));

        if let Err(e) = self
            .store
            .update(&path::session(device_id), Value::Object(fields))
            .await
        {
            tracing::warn!(device_id, error = %e, "failed to record device session");
            self.telemetry.record(Failure::RegistryWrite);
        }
    }

    /// All known sessions with their administrative status
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub async fn list(&self) -> Result<Vec<DeviceSession>> {
        let sessions = self.store.get(path::CONNECTED_DEVICES).await?;
        let records = self.store.get(path::DEVICES).await?;

        let mut devices: Vec<DeviceSession> = sessions
            .as_ref()
            .and_then(Value::as_object)
            .map(|sessions| {
                sessions
                    .iter()
                    .map(|(id, record)| {
                        let status = status_in(records.as_ref(), id);
                        DeviceSession::from_record(id, record, status)
                    })
                    .collect()
            })
            .unwrap_or_default();

        devices.sort_by(|a, b| b.last_seen().cmp(&a.last_seen()).then(a.id.cmp(&b.id)));
        Ok(devices)
    }

    /// One device's session, if it has ever been seen
    ///
    /// # Errors
    ///
    /// Returns error if the id is invalid or the store cannot be read
    pub async fn get(&self, device_id: &str) -> Result<Option<DeviceSession>> {
        path::validate_device_id(device_id)?;
        let Some(record) = self.store.get(&path::session(device_id)).await? else {
            return Ok(None);
        };
        let status = self.status_of(device_id).await?;
        Ok(Some(DeviceSession::from_record(device_id, &record, status)))
    }

    /// Administrative status of a device; unknown devices are active
    ///
    /// # Errors
    ///
    /// Returns error if the id is invalid or the store cannot be read
    pub async fn status_of(&self, device_id: &str) -> Result<DeviceStatus> {
        path::validate_device_id(device_id)?;
        let status = self
            .store
            .get(&format!("{}/status", path::device(device_id)))
            .await?;
        Ok(status
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default())
    }

    /// Block or unblock a device and tell it so
    ///
    /// Writes `devices/{id}` and sends a `block_device` or `unblock_device`
    /// command carrying the reason.
    ///
    /// # Errors
    ///
    /// Returns error if the id is invalid or either write fails
    pub async fn set_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        reason: Option<&str>,
    ) -> Result<DeviceRecord> {
        path::validate_device_id(device_id)?;
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REASON);

        let record = DeviceRecord {
            status,
            block_reason: Some(reason.to_string()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.store
            .set(&path::device(device_id), serde_json::to_value(&record)?)
            .await?;

        let kind = match status {
            DeviceStatus::Blocked => CommandKind::BlockDevice,
            DeviceStatus::Active => CommandKind::UnblockDevice,
        };
        self.bus
            .send_targeted(device_id, kind, Value::from(reason))
            .await?;

        tracing::info!(device_id, %status, reason, "device status changed");
        Ok(record)
    }

    /// Evict sessions not seen for longer than `max_age`
    ///
    /// Status records in `devices/` are left alone, so a blocked device
    /// stays blocked after its session is gone.
    ///
    /// # Errors
    ///
    /// Returns error if the sessions cannot be read
    pub async fn prune_stale(&self, max_age: Duration) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis()
            - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);

        let Some(sessions) = self.store.get(path::CONNECTED_DEVICES).await? else {
            return Ok(0);
        };
        let stale: Vec<String> = sessions
            .as_object()
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|(id, record)| {
                        DeviceSession::from_record(id, record, DeviceStatus::Active)
                            .last_seen()
                            .is_some_and(|seen| seen < cutoff)
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut evicted = 0;
        for id in stale {
            match self.store.remove(&path::session(&id)).await {
                Ok(()) => evicted += 1,
                Err(e) => tracing::warn!(device_id = %id, error = %e, "failed to evict session"),
            }
        }

        if evicted > 0 {
            tracing::info!(evicted, "evicted stale device sessions");
        }
        Ok(evicted)
    }
}

fn status_in(records: Option<&Value>, device_id: &str) -> DeviceStatus {
    records
        .and_then(|r| r.get(device_id))
        .and_then(|r| r.get("status"))
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}
