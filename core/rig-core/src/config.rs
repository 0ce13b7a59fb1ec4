//! Runtime configuration.
//!
//! Read from `~/.neurorig/rig.toml` unless a path is given. A missing file is
//! not an error: every field has a default pointing at a local rig.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RigError};

pub const CONFIG_ENV_VAR: &str = "NEURORIG_CONFIG";
const DATA_DIR_NAME: &str = ".neurorig";
const CONFIG_FILE_NAME: &str = "rig.toml";

/// Returns `~/.neurorig`.
pub fn data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DATA_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf> {
    data_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .ok_or_else(|| RigError::Config {
            path: PathBuf::from("~").join(DATA_DIR_NAME),
            details: "Home directory not found".to_string(),
        })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RigConfig {
    pub store: StoreConfig,
    pub bookings: BookingsConfig,
    pub hardware: HardwareConfig,
}

impl Default for RigConfig {
    fn default() -> Self {
        let base = data_dir().unwrap_or_else(|| PathBuf::from(DATA_DIR_NAME));
        Self {
            store: StoreConfig {
                path: base.join("rig.db"),
            },
            bookings: BookingsConfig {
                path: base.join("bookings.db"),
            },
            hardware: HardwareConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BookingsConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HardwareConfig {
    pub rpc_addr: String,
    pub trigger_addr: String,
    pub uv_addr: String,
    pub connect_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub trigger_timeout_ms: u64,
    pub uv_timeout_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            rpc_addr: "127.0.0.1:5051".to_string(),
            trigger_addr: "127.0.0.1:5010".to_string(),
            uv_addr: "127.0.0.1:5002".to_string(),
            connect_timeout_ms: 2_000,
            rpc_timeout_ms: 2_000,
            trigger_timeout_ms: 5_000,
            uv_timeout_ms: 300,
        }
    }
}

impl HardwareConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_timeout_ms)
    }

    pub fn uv_timeout(&self) -> Duration {
        Duration::from_millis(self.uv_timeout_ms)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
            ("trigger_timeout_ms", self.trigger_timeout_ms),
            ("uv_timeout_ms", self.uv_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(RigError::Config {
                path: path.to_path_buf(),
                details: format!("hardware.{} must be greater than zero", name),
            });
        }
        Ok(())
    }
}

/// Resolves the config path: explicit argument, then `NEURORIG_CONFIG`, then the default.
pub fn resolve_config_path(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => match std::env::var_os(CONFIG_ENV_VAR) {
            Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
            _ => default_config_path(),
        },
    }
}

pub fn load_config(path: Option<PathBuf>) -> Result<RigConfig> {
    let config_path = resolve_config_path(path)?;

    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "No config file; using defaults");
        return Ok(RigConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| RigError::Config {
        path: config_path.clone(),
        details: format!("Failed to read config: {}", err),
    })?;
    let config = toml::from_str::<RigConfig>(&content).map_err(|err| RigError::Config {
        path: config_path.clone(),
        details: format!("Failed to parse config: {}", err),
    })?;
    config.hardware.validate(&config_path)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(temp_dir.path().join("missing.toml"))).expect("load");
        assert_eq!(config.hardware, HardwareConfig::default());
        assert!(config.store.path.ends_with("rig.db"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("rig.toml");
        fs_err::write(
            &path,
            r#"
[store]
path = "/srv/rig/rig.db"

[hardware]
rpc_addr = "10.0.0.5:5051"
uv_timeout_ms = 450
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load");
        assert_eq!(config.store.path, PathBuf::from("/srv/rig/rig.db"));
        assert_eq!(config.hardware.rpc_addr, "10.0.0.5:5051");
        assert_eq!(config.hardware.uv_timeout(), Duration::from_millis(450));
        assert_eq!(config.hardware.trigger_addr, "127.0.0.1:5010");
        assert!(config.bookings.path.ends_with("bookings.db"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("rig.toml");
        fs_err::write(&path, "[hardware]\nrpc_adr = \"x\"\n").expect("write config");

        let err = load_config(Some(path)).expect_err("typo");
        assert_eq!(err.class(), ErrorClass::Configuration);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("rig.toml");
        fs_err::write(&path, "[hardware]\nrpc_timeout_ms = 0\n").expect("write config");

        let err = load_config(Some(path)).expect_err("zero timeout");
        assert!(err.to_string().contains("rpc_timeout_ms"));
    }
}
