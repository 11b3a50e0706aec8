//! Configuration management for the fleet gateway
//!
//! Precedence is env > TOML file > defaults, resolved once at startup.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use self::file::FleetConfigFile;
use crate::{Error, Result};

/// Default API port
pub const DEFAULT_PORT: u16 = 3000;

/// Default wait for the store to report connected at startup
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default session TTL (30 days)
const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Default interval between eviction sweeps (1 hour)
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;

/// Default device-seen queue capacity
const DEFAULT_SEEN_QUEUE: usize = 1024;

/// Fleet gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (identity, watermark database)
    pub data_dir: PathBuf,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// Shared store connection settings
    pub store: StoreConfig,

    /// Device registry maintenance
    pub registry: RegistryConfig,

    /// Access gate tuning
    pub gate: GateConfig,

    /// Run an in-process device agent alongside the server
    pub local_agent: bool,
}

/// HTTP API server configuration
#[derive(Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,

    /// API key for admin endpoints (from `FLEET_API_KEY` env)
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ApiServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiServerConfig")
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Shared store connection settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long to wait for the store to report connected before degrading
    pub connect_timeout: Duration,
}

/// Device registry maintenance
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Sessions idle for longer than this are evicted; `None` keeps them forever
    pub session_ttl: Option<Duration>,

    /// Interval between eviction sweeps
    pub sweep_interval: Duration,
}

/// Access gate tuning
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Capacity of the device-seen queue feeding the registry
    pub seen_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_server: ApiServerConfig {
                port: DEFAULT_PORT,
                api_key: None,
            },
            store: StoreConfig {
                connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            },
            registry: RegistryConfig {
                session_ttl: Some(Duration::from_secs(DEFAULT_SESSION_TTL_SECS)),
                sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            },
            gate: GateConfig {
                seen_queue: DEFAULT_SEEN_QUEUE,
            },
            local_agent: false,
        }
    }
}

/// Default data directory: `~/.local/share/fleet/gateway`
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/fleet/gateway"),
        |d| d.data_dir().join("fleet").join("gateway"),
    )
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but malformed
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::from_sources(fc, |key| std::env::var(key).ok())?;

        // Ensure data dir exists
        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            tracing::warn!(
                path = %config.data_dir.display(),
                error = %e,
                "failed to create data directory"
            );
        }

        Ok(config)
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but malformed
    pub fn from_sources<F>(fc: FleetConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = match env("FLEET_PORT").or_else(|| env("PORT")) {
            Some(raw) => parse_env("FLEET_PORT", &raw)?,
            None => fc.server.port.unwrap_or(defaults.api_server.port),
        };

        let data_dir = env("FLEET_DATA_DIR")
            .or(fc.server.data_dir)
            .map_or(defaults.data_dir, PathBuf::from);

        let connect_timeout_ms = match env("FLEET_STORE_CONNECT_TIMEOUT_MS") {
            Some(raw) => parse_env("FLEET_STORE_CONNECT_TIMEOUT_MS", &raw)?,
            None => fc
                .store
                .connect_timeout_ms
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        };

        let ttl_secs: u64 = match env("FLEET_SESSION_TTL_SECS") {
            Some(raw) => parse_env("FLEET_SESSION_TTL_SECS", &raw)?,
            None => fc
                .registry
                .session_ttl_secs
                .unwrap_or(DEFAULT_SESSION_TTL_SECS),
        };

        let sweep_secs: u64 = match env("FLEET_SWEEP_INTERVAL_SECS") {
            Some(raw) => parse_env("FLEET_SWEEP_INTERVAL_SECS", &raw)?,
            None => fc
                .registry
                .sweep_interval_secs
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        };
        if sweep_secs == 0 {
            return Err(Error::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        let seen_queue = fc.gate.seen_queue.unwrap_or(DEFAULT_SEEN_QUEUE).max(1);

        let local_agent = env("FLEET_LOCAL_AGENT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(fc.server.local_agent)
            .unwrap_or(false);

        Ok(Self {
            data_dir,
            api_server: ApiServerConfig {
                port,
                api_key: env("FLEET_API_KEY").filter(|k| !k.is_empty()),
            },
            store: StoreConfig {
                connect_timeout: Duration::from_millis(connect_timeout_ms),
            },
            registry: RegistryConfig {
                session_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
                sweep_interval: Duration::from_secs(sweep_secs),
            },
            gate: GateConfig { seen_queue },
            local_agent,
        })
    }

    /// Path of the local watermark database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("fleet.db")
    }

    /// Path of this host's device identity file
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity").join("device.json")
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} has invalid value '{raw}'")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::file::{RegistryFileConfig, ServerFileConfig};

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_sources() {
        let config = Config::from_sources(FleetConfigFile::default(), env_of(&[])).unwrap();
        assert_eq!(config.api_server.port, DEFAULT_PORT);
        assert!(config.api_server.api_key.is_none());
        assert_eq!(config.gate.seen_queue, DEFAULT_SEEN_QUEUE);
        assert!(config.registry.session_ttl.is_some());
        assert!(!config.local_agent);
    }

    #[test]
    fn debug_output_hides_api_key() {
        let config = Config::from_sources(
            FleetConfigFile::default(),
            env_of(&[("FLEET_API_KEY", "s3cret-admin-key")]),
        )
        .unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret-admin-key"));
        assert!(rendered.contains("[redacted]"));
    }

    #[test]
    fn env_overrides_file() {
        let fc = FleetConfigFile {
            server: ServerFileConfig {
                port: Some(8000),
                data_dir: Some("/tmp/from-file".to_string()),
                local_agent: Some(false),
            },
            ..FleetConfigFile::default()
        };
        let config = Config::from_sources(
            fc,
            env_of(&[("FLEET_PORT", "9100"), ("FLEET_LOCAL_AGENT", "true")]),
        )
        .unwrap();

        assert_eq!(config.api_server.port, 9100);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/from-file"));
        assert!(config.local_agent);
    }

    #[test]
    fn zero_ttl_disables_eviction() {
        let fc = FleetConfigFile {
            registry: RegistryFileConfig {
                session_ttl_secs: Some(0),
                sweep_interval_secs: None,
            },
            ..FleetConfigFile::default()
        };
        let config = Config::from_sources(fc, env_of(&[])).unwrap();
        assert!(config.registry.session_ttl.is_none());
    }

    #[test]
    fn malformed_env_is_rejected() {
        let result = Config::from_sources(
            FleetConfigFile::default(),
            env_of(&[("FLEET_PORT", "not-a-port")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn empty_api_key_means_unset() {
        let config =
            Config::from_sources(FleetConfigFile::default(), env_of(&[("FLEET_API_KEY", "")]))
                .unwrap();
        assert!(config.api_server.api_key.is_none());
    }
}
