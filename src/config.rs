use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::{IoContext, PoolError, Result};
use crate::global::utils::{get_default_config_file, get_default_pool_root};

/// Environment variable that overrides [`PoolConfig::root`].
pub const ROOT_ENV_VAR: &str = "VENVPOOL_ROOT";

/// Settings of a pool, usually read from `config.toml` in the user config directory.
///
/// Every field has a default, so a partial file (or none at all) is fine.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Directory holding one subdirectory per runtime version.
    pub root: PathBuf,
    /// How many environments a read-only acquisition may provision before giving up.
    pub max_provision_attempts: u32,
    /// First pause between two scans of the pool, doubled on every further pass.
    pub initial_backoff_ms: u64,
    /// Upper bound of the pause between two scans.
    pub max_backoff_ms: u64,
    /// Program used to bootstrap an environment from a base interpreter.
    pub virtualenv: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            root: get_default_pool_root().unwrap_or_else(|_| PathBuf::from(".venvpool")),
            max_provision_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
            virtualenv: "virtualenv".to_string(),
        }
    }
}

impl PoolConfig {
    /// A default config rooted at `root`.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Loads the user config file if there is one, then applies `VENVPOOL_ROOT`.
    pub fn load() -> Result<Self> {
        let mut config = match get_default_config_file() {
            Ok(path) if path.exists() => Self::load_from(path)?,
            _ => Self::default(),
        };
        if let Some(root) = std::env::var_os(ROOT_ENV_VAR) {
            config.root = PathBuf::from(root);
        }
        Ok(config)
    }

    /// Loads a config from the given TOML file.
    ///
    /// # Errors
    /// Returns an error if the file can't be read or is not a valid config.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).at(path)?;
        toml::from_str(&content).map_err(|e| PoolError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Saves the config to the given file path in pretty TOML format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).map_err(|e| PoolError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).at(path)
    }

    /// Pause before scan number `pass` (0-based) of an acquisition loop.
    pub fn backoff(&self, pass: u32) -> Duration {
        if pass == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(pass - 1).unwrap_or(u64::MAX);
        let ms = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "root = \"/srv/pool\"\nmax_provision_attempts = 5\n").unwrap();

        let config = PoolConfig::load_from(&path).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/pool"));
        assert_eq!(config.max_provision_attempts, 5);
        assert_eq!(config.virtualenv, "virtualenv");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_provision_attempts = \"many\"").unwrap();

        let err = PoolConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, PoolError::Config { .. }));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = PoolConfig::with_root(dir.path().join("pool"));
        config.save(&path).unwrap();
        assert_eq!(PoolConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = PoolConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            ..PoolConfig::with_root("/tmp/pool")
        };
        assert_eq!(config.backoff(0), Duration::ZERO);
        assert_eq!(config.backoff(1), Duration::from_millis(10));
        assert_eq!(config.backoff(2), Duration::from_millis(20));
        assert_eq!(config.backoff(4), Duration::from_millis(50));
        assert_eq!(config.backoff(200), Duration::from_millis(50));
    }
}
