//! TOML configuration file loading
//!
//! Supports `~/.config/fleet/gateway/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct FleetConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Shared store connection
    #[serde(default)]
    pub store: StoreFileConfig,

    /// Device registry maintenance
    #[serde(default)]
    pub registry: RegistryFileConfig,

    /// Access gate tuning
    #[serde(default)]
    pub gate: GateFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Directory for local state (identity, watermarks)
    pub data_dir: Option<String>,

    /// Run an in-process device agent next to the server
    pub local_agent: Option<bool>,
}

/// Shared store configuration
#[derive(Debug, Default, Deserialize)]
pub struct StoreFileConfig {
    /// How long to wait for the store to report connected at startup
    pub connect_timeout_ms: Option<u64>,
}

/// Device registry configuration
#[derive(Debug, Default, Deserialize)]
pub struct RegistryFileConfig {
    /// Evict sessions not seen for this long (0 disables eviction)
    pub session_ttl_secs: Option<u64>,

    /// Interval between eviction sweeps
    pub sweep_interval_secs: Option<u64>,
}

/// Access gate configuration
#[derive(Debug, Default, Deserialize)]
pub struct GateFileConfig {
    /// Capacity of the device-seen queue feeding the registry
    pub seen_queue: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `FleetConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> FleetConfigFile {
    config_file_path().map_or_else(FleetConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path with the same fallbacks
pub fn load_from(path: &Path) -> FleetConfigFile {
    if !path.exists() {
        return FleetConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                FleetConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            FleetConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/fleet/gateway/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("fleet")
            .join("gateway")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let fc = load_from(&dir.path().join("absent.toml"));
        assert!(fc.server.port.is_none());
    }

    #[test]
    fn partial_file_is_an_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9000\n\n[registry]\nsession_ttl_secs = 60\n",
        )
        .unwrap();

        let fc = load_from(&path);
        assert_eq!(fc.server.port, Some(9000));
        assert_eq!(fc.registry.session_ttl_secs, Some(60));
        assert!(fc.store.connect_timeout_ms.is_none());
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        let fc = load_from(&path);
        assert!(fc.server.port.is_none());
    }
}
