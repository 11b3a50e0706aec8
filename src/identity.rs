//! Local device identity
//!
//! A device keeps one stable id across restarts and reconnects. The id is
//! generated once, from a random seed and the host name, and stored as JSON
//! under the data directory.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::devices::DeviceMetadata;
use crate::store::path;
use crate::{Error, Result};

/// Length of the hashed part of the id in hex characters
const DEVICE_ID_HASH_LENGTH: usize = 24;

/// Prefix of generated device ids
const DEVICE_ID_PREFIX: &str = "dev_";

/// Device identity stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable device identifier
    pub device_id: String,

    /// Human-readable device name
    pub name: String,

    /// Platform identifier (e.g., "linux-x86_64", "macos-aarch64")
    pub platform: String,

    /// When the identity was created
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Generate a fresh identity for this host
    #[must_use]
    pub fn generate(name: &str) -> Self {
        let seed = uuid::Uuid::new_v4();
        Self {
            device_id: compute_device_id(seed.as_bytes(), name),
            name: name.to_string(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            created_at: Utc::now(),
        }
    }

    /// Load identity from a file, or create a new one if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns error if file operations fail or the stored identity is invalid
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let identity: Self = serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("invalid device identity: {e}")))?;
            path::validate_device_id(&identity.device_id)?;
            tracing::debug!(device_id = %identity.device_id, "loaded device identity");
            return Ok(identity);
        }

        let identity = Self::generate(&host_name());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&identity)?)?;

        tracing::info!(device_id = %identity.device_id, "created new device identity");
        Ok(identity)
    }

    /// Registration metadata describing this device
    #[must_use]
    pub fn metadata(&self) -> DeviceMetadata {
        let mut metadata = DeviceMetadata::new();
        metadata.insert("name".to_string(), Value::from(self.name.clone()));
        metadata.insert("platform".to_string(), Value::from(self.platform.clone()));
        metadata.insert(
            "userAgent".to_string(),
            Value::from(concat!("fleet-agent/", env!("CARGO_PKG_VERSION"))),
        );
        if let Ok(language) = std::env::var("LANG") {
            metadata.insert("language".to_string(), Value::from(language));
        }
        metadata.insert(
            "timezone".to_string(),
            Value::from(chrono::Local::now().offset().to_string()),
        );
        metadata
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

fn compute_device_id(seed: &[u8], host: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(host.as_bytes());
    let hash = hex::encode(hasher.finalize());
    format!("{DEVICE_ID_PREFIX}{}", &hash[..DEVICE_ID_HASH_LENGTH])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let a = DeviceIdentity::generate("host");
        let b = DeviceIdentity::generate("host");

        assert!(a.device_id.starts_with(DEVICE_ID_PREFIX));
        assert_eq!(a.device_id.len(), DEVICE_ID_PREFIX.len() + DEVICE_ID_HASH_LENGTH);
        assert!(path::validate_device_id(&a.device_id).is_ok());
        assert_ne!(a.device_id, b.device_id);
    }

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("identity").join("device.json");

        let created = DeviceIdentity::load_or_create(&file).unwrap();
        let loaded = DeviceIdentity::load_or_create(&file).unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn corrupt_identity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("device.json");
        fs::write(&file, "not json").unwrap();

        assert!(matches!(
            DeviceIdentity::load_or_create(&file),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn metadata_describes_platform() {
        let identity = DeviceIdentity::generate("host");
        let metadata = identity.metadata();
        assert_eq!(metadata["name"], "host");
        assert!(metadata["userAgent"].as_str().unwrap().starts_with("fleet-agent/"));
    }
}
