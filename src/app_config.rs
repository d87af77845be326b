//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use blob_fs::config::EngineConfig;

fn blob_fs_runtime_dir() -> Option<PathBuf> {
    let runtime_dir = dirs::runtime_dir();
    if let Some(path) = runtime_dir {
        return Some(path.join("blob-fs"));
    }

    let home_dir = dirs::home_dir();
    if let Some(path) = home_dir {
        return Some(path.join(".local").join("share").join("blob-fs"));
    }

    None
}

fn default_pid_file() -> PathBuf {
    blob_fs_runtime_dir().map_or_else(
        || PathBuf::from("/var/run/blob-fs.pid"),
        |rd| rd.join("blob-fs.pid"),
    )
}

fn default_mount_point() -> PathBuf {
    blob_fs_runtime_dir().map_or_else(|| PathBuf::from("/tmp/blob-fs/mnt"), |rd| rd.join("mnt"))
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

/// The cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// The maximum size of the cache. Without one, the cache's filesystem is measured instead.
    pub max_size: Option<ByteSize>,

    /// The path to the cache directory.
    pub path: PathBuf,

    /// Seconds a cached directory stays fresh before it is refreshed from the remote.
    pub freshness_window_secs: u64,

    /// Seconds after which an untouched clean file is evicted regardless of pressure.
    pub stale_after_secs: Option<u64>,

    pub high_water_percent: u8,
    pub low_water_percent: u8,
    pub evict_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            path: blob_fs_runtime_dir().map_or_else(
                || PathBuf::from("/tmp/blob-fs/cache"),
                |rd| rd.join("cache"),
            ),
            freshness_window_secs: 120,
            stale_after_secs: None,
            high_water_percent: 90,
            low_water_percent: 80,
            evict_interval_secs: 1,
        }
    }
}

/// Which remote store backs the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteKind {
    /// An in-process store, lost on unmount.
    Memory,
    /// A directory on the host.
    Local,
}

/// The remote store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RemoteConfig {
    pub kind: RemoteKind,

    /// Root directory of a `local` store.
    pub path: Option<PathBuf>,

    /// Serve a `memory` store with native directories and moves.
    pub hierarchical: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: RemoteKind::Memory,
            path: None,
            hierarchical: false,
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// The path to the PID file for the daemon. Uses /var/run/blob-fs.pid if not specified.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,

    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// The user to mount the filesystem as. If not specified, runs as the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group to mount the filesystem as. If not specified, runs as the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,

    /// Let other users reach the mount. Widens the default permission to 0o777.
    #[serde(default)]
    pub allow_other: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            remote: RemoteConfig::default(),
            daemon: DaemonConfig::default(),
            mount_point: default_mount_point(),
            uid: current_uid(),
            gid: current_gid(),
            allow_other: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parent directory does not exist.")]
    NoParentDir,

    #[error("No suitable configuration path found.")]
    NoSuitableConfigPath,
}

impl Config {
    /// The engine tunables this configuration describes.
    pub fn engine(&self) -> EngineConfig {
        let mut engine = EngineConfig::new(&self.cache.path).with_allow_other(self.allow_other);
        engine.freshness_window = Duration::from_secs(self.cache.freshness_window_secs);
        engine.stale_after = self.cache.stale_after_secs.map(Duration::from_secs);
        engine.high_water_percent = self.cache.high_water_percent;
        engine.low_water_percent = self.cache.low_water_percent;
        engine.evict_interval = Duration::from_secs(self.cache.evict_interval_secs);
        engine.cache_capacity = self.cache.max_size;
        engine.uid = self.uid;
        engine.gid = self.gid;
        engine
    }

    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages if the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.daemon.pid_file.parent().is_none() {
            errors.push(format!(
                "PID file path '{}' has no parent directory.",
                self.daemon.pid_file.display()
            ));
        }

        if self.remote.kind == RemoteKind::Local && self.remote.path.is_none() {
            errors.push("A local remote needs remote.path to be set.".to_owned());
        }

        if self.remote.kind == RemoteKind::Local && self.remote.hierarchical {
            debug!("local remotes are always hierarchical; ignoring remote.hierarchical");
        }

        if let Err(engine_errors) = self.engine().validate() {
            errors.extend(engine_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("blob-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("blob-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/blob-fs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config or creates a default if none exists.
    /// Errors if a config file exists but is malformed.
    pub fn load_or_create(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(res) = Self::load(external_config_path) {
            let config = res?;
            if let Err(validation_errors) = config.validate() {
                return Err(ConfigError::ValidationErrors(validation_errors));
            }
            debug!("Loaded configuration successfully.");
            return Ok(config);
        }

        // No config exists: write the defaults at the highest-priority path.
        let creation_path = Self::config_search_paths()
            .into_iter()
            .next()
            .ok_or(ConfigError::NoSuitableConfigPath)?;

        let config = Self::default();
        config.write_to_disk(&creation_path)?;
        info!(path = ?creation_path.display(), "Created configuration file.");
        Ok(config)
    }

    fn write_to_disk(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::create_dir_all(path.parent().ok_or(ConfigError::NoParentDir)?)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cache.high_water_percent, 90);
        assert_eq!(config.remote.kind, RemoteKind::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn kebab_case_sections_parse() {
        let config: Config = toml::from_str(
            r#"
            mount-point = "/mnt/blobs"
            allow-other = true

            [cache]
            path = "/var/cache/blob-fs"
            max-size = "2 GiB"
            stale-after-secs = 3600

            [remote]
            kind = "local"
            path = "/srv/container"
            "#,
        )
        .unwrap();
        let engine = config.engine();
        assert_eq!(engine.default_permission, 0o777);
        assert_eq!(engine.stale_after, Some(Duration::from_secs(3600)));
        assert_eq!(engine.cache_capacity, Some(ByteSize::gib(2)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn local_remote_requires_path() {
        let config: Config = toml::from_str("[remote]\nkind = \"local\"\n").unwrap();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1, "{errors:?}");
    }

    #[test]
    fn written_defaults_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        let config = Config::default();
        config.write_to_disk(&path).unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().unwrap(), config);
    }
}
