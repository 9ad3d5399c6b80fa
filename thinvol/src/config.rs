//! Daemon configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::storage::thinpool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding every persisted record and the daemon lock file.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Control socket path.
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,
    #[serde(default)]
    pub driver: DriverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            socket: default_socket_path(),
            driver: DriverConfig::default(),
        }
    }
}

/// Storage driver selection and its option table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_driver_kind")]
    pub kind: String,
    #[serde(default)]
    pub opts: HashMap<String, String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: default_driver_kind(),
            opts: HashMap::new(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/thinvol")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/thinvol/thinvol.sock")
}

fn default_driver_kind() -> String {
    thinpool::DRIVER_NAME.to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver.kind.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "driver.kind",
                reason: "must not be empty".to_string(),
            });
        }
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "root",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pick_the_thinpool_driver() {
        let config = Config::default();
        assert_eq!(config.driver.kind, "thinpool");
        assert_eq!(config.root, PathBuf::from("/var/lib/thinvol"));
        config.validate().unwrap();
    }

    #[test]
    fn parses_driver_opts_table() {
        let config: Config = toml::from_str(
            r#"
root = "/data/thinvol"

[driver]
kind = "thinpool"

[driver.opts]
"dm.datadev" = "/dev/loop0"
"dm.metadatadev" = "/dev/loop1"
"#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/data/thinvol"));
        assert_eq!(config.driver.opts["dm.datadev"], "/dev/loop0");
        assert_eq!(config.socket, PathBuf::from("/run/thinvol/thinvol.sock"));
    }

    #[test]
    fn rejects_empty_driver_kind() {
        let config: Config = toml::from_str(
            r#"
[driver]
kind = ""
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "driver.kind", .. })
        ));
    }
}
