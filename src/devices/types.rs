//! Device registry types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Administrative status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Active,
    Blocked,
}

impl DeviceStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            other => Err(Error::Store(format!("unknown device status '{other}'"))),
        }
    }
}

/// Free-form session attributes (user agent, platform, endpoint, ...)
pub type DeviceMetadata = Map<String, Value>;

/// Keys owned by the registry, never taken from caller metadata
pub(crate) const RESERVED_KEYS: &[&str] = &["id", "deviceId", "status", "lastAccess", "lastUpdate"];

/// Last-seen record of a device, as shown to administrators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub id: String,
    pub last_access: Option<i64>,
    pub last_update: Option<i64>,
    pub status: DeviceStatus,
    #[serde(flatten)]
    pub metadata: DeviceMetadata,
}

impl DeviceSession {
    /// Build a session from its stored record
    #[must_use]
    pub fn from_record(id: &str, record: &Value, status: DeviceStatus) -> Self {
        let fields = record.as_object().cloned().unwrap_or_default();
        let timestamp = |key: &str| fields.get(key).and_then(Value::as_i64);
        let last_access = timestamp("lastAccess");
        let last_update = timestamp("lastUpdate");

        let metadata = fields
            .into_iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .collect();

        Self {
            id: id.to_string(),
            last_access,
            last_update,
            status,
            metadata,
        }
    }

    /// Most recent contact, falling back to the last update
    #[must_use]
    pub fn last_seen(&self) -> Option<i64> {
        self.last_access.or(self.last_update)
    }
}

/// Administrative record stored at `devices/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub status: DeviceStatus,
    #[serde(default)]
    pub block_reason: Option<String>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        assert_eq!("blocked".parse::<DeviceStatus>().unwrap(), DeviceStatus::Blocked);
        assert_eq!(DeviceStatus::Active.to_string(), "active");
        assert!("banned".parse::<DeviceStatus>().is_err());
    }

    #[test]
    fn session_flattens_metadata() {
        let record = json!({
            "lastAccess": 10,
            "lastUpdate": 12,
            "userAgent": "curl/8",
            "status": "active",
        });
        let session = DeviceSession::from_record("dev1", &record, DeviceStatus::Blocked);
        assert_eq!(session.last_seen(), Some(10));

        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["id"], "dev1");
        assert_eq!(value["status"], "blocked");
        assert_eq!(value["userAgent"], "curl/8");
        assert_eq!(value["lastUpdate"], 12);
    }

    #[test]
    fn record_uses_wire_names() {
        let record = DeviceRecord {
            status: DeviceStatus::Blocked,
            block_reason: Some("policy".to_string()),
            timestamp: 5,
        };
        assert_eq!(
            serde_json::to_value(record).unwrap(),
            json!({"status": "blocked", "blockReason": "policy", "timestamp": 5})
        );
    }
}
