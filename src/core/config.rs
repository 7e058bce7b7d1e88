//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CbhError, Result};
use crate::core::size::StorageSize;

/// Full CBH configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub container: ContainerConfig,
    pub ballast: BallastConfig,
    pub runtime: RuntimeConfig,
    pub paths: PathsConfig,
}

/// How managed containers are created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    pub command: Vec<String>,
    /// Environment passed to every created container (`[container.env]`).
    pub env: BTreeMap<String, String>,
    /// Nominal root filesystem allocation before the ballast margin.
    pub base_size_bytes: u64,
    /// Label key recording `base + margin` on each managed container.
    pub threshold_label: String,
    /// Also pass `base + margin` as the runtime's `size` storage option.
    pub enforce_storage_quota: bool,
    /// Grace period handed to the runtime stop call; runtime default when unset.
    pub stop_timeout_secs: Option<u64>,
}

/// Ballast file placement and the stop-time shrink policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BallastConfig {
    /// Absolute path of the ballast file inside the container.
    pub path: String,
    /// Initial ballast size allocated at creation.
    pub margin_bytes: u64,
    /// Bytes released per stop once headroom is low.
    pub shrink_step_bytes: u64,
    /// Shrink when `capacity - used` (whole GB) is at or below this.
    pub headroom_trigger_gb: u64,
}

/// Container runtime client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime CLI binary (`docker`, `podman`, or an absolute path).
    pub binary: String,
    /// Deadline for in-container commands; 0 waits indefinitely.
    pub exec_timeout_secs: u64,
}

/// Filesystem paths used by cbh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub jsonl_log: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:latest".to_string(),
            command: vec!["sleep".to_string(), "3600".to_string()],
            env: BTreeMap::new(),
            base_size_bytes: 20_000_000_000,
            threshold_label: "threshold".to_string(),
            enforce_storage_quota: false,
            stop_timeout_secs: None,
        }
    }
}

impl Default for BallastConfig {
    fn default() -> Self {
        Self {
            path: "/ballast".to_string(),
            margin_bytes: 5_000_000_000,
            shrink_step_bytes: 500_000_000,
            headroom_trigger_gb: 1,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            exec_timeout_secs: 0,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[CBH-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        Self {
            config_file: home_dir.join(".config").join("cbh").join("config.toml"),
            jsonl_log: home_dir
                .join(".local")
                .join("share")
                .join("cbh")
                .join("activity.jsonl"),
        }
    }
}

impl ContainerConfig {
    /// Capacity recorded in the threshold label: nominal allocation plus margin.
    #[must_use]
    pub fn combined_quota(&self, ballast: &BallastConfig) -> StorageSize {
        StorageSize::from_bytes(self.base_size_bytes) + StorageSize::from_bytes(ballast.margin_bytes)
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_secs.map(Duration::from_secs)
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn exec_timeout(&self) -> Option<Duration> {
        (self.exec_timeout_secs > 0).then(|| Duration::from_secs(self.exec_timeout_secs))
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| CbhError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(CbhError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // container
        if let Some(raw) = lookup("CBH_CONTAINER_IMAGE") {
            self.container.image = raw;
        }
        if let Some(raw) = lookup("CBH_CONTAINER_BASE_SIZE_BYTES") {
            self.container.base_size_bytes = parse_env_u64("CBH_CONTAINER_BASE_SIZE_BYTES", &raw)?;
        }
        if let Some(raw) = lookup("CBH_CONTAINER_THRESHOLD_LABEL") {
            self.container.threshold_label = raw;
        }
        if let Some(raw) = lookup("CBH_CONTAINER_ENFORCE_STORAGE_QUOTA") {
            self.container.enforce_storage_quota =
                parse_env_bool("CBH_CONTAINER_ENFORCE_STORAGE_QUOTA", &raw)?;
        }
        if let Some(raw) = lookup("CBH_CONTAINER_STOP_TIMEOUT_SECS") {
            self.container.stop_timeout_secs =
                Some(parse_env_u64("CBH_CONTAINER_STOP_TIMEOUT_SECS", &raw)?);
        }

        // ballast
        if let Some(raw) = lookup("CBH_BALLAST_PATH") {
            self.ballast.path = raw;
        }
        if let Some(raw) = lookup("CBH_BALLAST_MARGIN_BYTES") {
            self.ballast.margin_bytes = parse_env_u64("CBH_BALLAST_MARGIN_BYTES", &raw)?;
        }
        if let Some(raw) = lookup("CBH_BALLAST_SHRINK_STEP_BYTES") {
            self.ballast.shrink_step_bytes = parse_env_u64("CBH_BALLAST_SHRINK_STEP_BYTES", &raw)?;
        }
        if let Some(raw) = lookup("CBH_BALLAST_HEADROOM_TRIGGER_GB") {
            self.ballast.headroom_trigger_gb =
                parse_env_u64("CBH_BALLAST_HEADROOM_TRIGGER_GB", &raw)?;
        }

        // runtime
        if let Some(raw) = lookup("CBH_RUNTIME_BINARY") {
            self.runtime.binary = raw;
        }
        if let Some(raw) = lookup("CBH_RUNTIME_EXEC_TIMEOUT_SECS") {
            self.runtime.exec_timeout_secs = parse_env_u64("CBH_RUNTIME_EXEC_TIMEOUT_SECS", &raw)?;
        }

        // paths
        if let Some(raw) = lookup("CBH_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.container.image.trim().is_empty() {
            return Err(CbhError::InvalidConfig {
                details: "container.image must not be empty".to_string(),
            });
        }
        if self.container.command.is_empty() {
            return Err(CbhError::InvalidConfig {
                details: "container.command must have at least one element".to_string(),
            });
        }
        if self.container.threshold_label.trim().is_empty() {
            return Err(CbhError::InvalidConfig {
                details: "container.threshold_label must not be empty".to_string(),
            });
        }
        if self.container.base_size_bytes == 0 {
            return Err(CbhError::InvalidConfig {
                details: "container.base_size_bytes must be > 0".to_string(),
            });
        }

        let path = Path::new(&self.ballast.path);
        if !path.is_absolute() || path.parent().is_none() {
            return Err(CbhError::InvalidConfig {
                details: format!(
                    "ballast.path must be an absolute file path, got {:?}",
                    self.ballast.path
                ),
            });
        }
        if self.ballast.margin_bytes == 0 || self.ballast.shrink_step_bytes == 0 {
            return Err(CbhError::InvalidConfig {
                details: "ballast.margin_bytes and ballast.shrink_step_bytes must be > 0"
                    .to_string(),
            });
        }
        if self
            .container
            .base_size_bytes
            .checked_add(self.ballast.margin_bytes)
            .is_none()
        {
            return Err(CbhError::InvalidConfig {
                details: "container.base_size_bytes + ballast.margin_bytes overflows".to_string(),
            });
        }

        if self.runtime.binary.trim().is_empty() {
            return Err(CbhError::InvalidConfig {
                details: "runtime.binary must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|error| CbhError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim()
        .parse::<bool>()
        .map_err(|error| CbhError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
