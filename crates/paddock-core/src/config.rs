//! Daemon configuration.
//!
//! Loaded from a TOML file at startup; every field has a default so an
//! absent file yields a fully working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Daemon process settings.
    #[serde(default)]
    pub daemon: DaemonSection,

    /// Key-value store settings.
    #[serde(default)]
    pub keyvalue: KeyValueSection,

    /// Container lifecycle settings.
    #[serde(default)]
    pub container: ContainerSection,

    /// Network shaper settings.
    #[serde(default)]
    pub network: NetworkSection,
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::invalid_value(format!("config parse error: {e}")))
    }
}

/// Daemon process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    /// Path to the pid file.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Reserve subtracted from total RAM when validating memory guarantees.
    #[serde(default = "default_memory_guarantee_reserve")]
    pub memory_guarantee_reserve: u64,
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/run/paddockd.pid")
}

const fn default_memory_guarantee_reserve() -> u64 {
    // 2 GiB held back for the host and the daemon itself.
    2 << 30
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            memory_guarantee_reserve: default_memory_guarantee_reserve(),
        }
    }
}

/// Key-value store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueSection {
    /// Mountpoint of the private tmpfs holding container records.
    #[serde(default = "default_kv_path")]
    pub path: PathBuf,

    /// Size of the tmpfs.
    #[serde(default = "default_kv_size")]
    pub size: u64,
}

fn default_kv_path() -> PathBuf {
    PathBuf::from("/run/paddock/kv")
}

const fn default_kv_size() -> u64 {
    32 << 20
}

impl Default for KeyValueSection {
    fn default() -> Self {
        Self {
            path: default_kv_path(),
            size: default_kv_size(),
        }
    }
}

/// Container lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSection {
    /// Cgroup path segment owned by the supervisor.
    #[serde(default = "default_cgroup_segment")]
    pub cgroup_segment: String,

    /// Directory for default stdio files of root-less containers.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// Grace period between SIGTERM and SIGKILL when stopping.
    #[serde(default = "default_kill_timeout")]
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,

    /// How long to wait for the freezer cgroup to empty after SIGKILL.
    #[serde(default = "default_stop_timeout")]
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Delay before a dead container is respawned.
    #[serde(default = "default_respawn_delay")]
    #[serde(with = "humantime_serde")]
    pub respawn_delay: Duration,

    /// Default time a dead container is kept before it may be collected.
    #[serde(default = "default_aging_time")]
    #[serde(with = "humantime_serde")]
    pub aging_time: Duration,

    /// Interval between log-rotation sweeps.
    #[serde(default = "default_rotate_interval")]
    #[serde(with = "humantime_serde")]
    pub rotate_interval: Duration,

    /// Stdio files larger than this are truncated during rotation.
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,

    /// Upper bound on bytes returned from stdout/stderr data.
    #[serde(default = "default_stdout_limit")]
    pub stdout_limit: u64,

    /// Maximum length of the free-form `private` property.
    #[serde(default = "default_private_max")]
    pub private_max: u64,

    /// Default value of the `cpu_priority` property.
    #[serde(default = "default_cpu_prio")]
    pub default_cpu_prio: u64,
}

fn default_cgroup_segment() -> String {
    "paddock".to_string()
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/place/paddock")
}

const fn default_kill_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_respawn_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_aging_time() -> Duration {
    Duration::from_secs(60 * 60 * 24)
}

const fn default_rotate_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_log_size() -> u64 {
    10 << 20
}

const fn default_stdout_limit() -> u64 {
    8 << 20
}

const fn default_private_max() -> u64 {
    1024
}

const fn default_cpu_prio() -> u64 {
    50
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            cgroup_segment: default_cgroup_segment(),
            tmp_dir: default_tmp_dir(),
            kill_timeout: default_kill_timeout(),
            stop_timeout: default_stop_timeout(),
            respawn_delay: default_respawn_delay(),
            aging_time: default_aging_time(),
            rotate_interval: default_rotate_interval(),
            max_log_size: default_max_log_size(),
            stdout_limit: default_stdout_limit(),
            private_max: default_private_max(),
            default_cpu_prio: default_cpu_prio(),
        }
    }
}

/// Network shaper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Whether traffic shaping and interface provisioning are enabled.
    #[serde(default = "default_network_enabled")]
    pub enabled: bool,

    /// Default class priority.
    #[serde(default = "default_net_prio")]
    pub default_prio: u64,

    /// Default per-container guarantee, bytes/s.
    #[serde(default = "default_net_guarantee")]
    pub default_guarantee: u64,

    /// Default per-container ceiling, bytes/s.
    #[serde(default = "default_net_limit")]
    pub default_limit: u64,

    /// Guarantee given to the root and default classes, bytes/s.
    #[serde(default = "default_net_max_guarantee")]
    pub default_max_guarantee: u64,
}

const fn default_network_enabled() -> bool {
    true
}

const fn default_net_prio() -> u64 {
    3
}

const fn default_net_guarantee() -> u64 {
    // 10 Mbit/s in bytes.
    1_250_000
}

const fn default_net_limit() -> u64 {
    // 32 Gbit/s in bytes, the HTB ceiling.
    4_000_000_000
}

const fn default_net_max_guarantee() -> u64 {
    4_000_000_000
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            enabled: default_network_enabled(),
            default_prio: default_net_prio(),
            default_guarantee: default_net_guarantee(),
            default_limit: default_net_limit(),
            default_max_guarantee: default_net_max_guarantee(),
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.keyvalue.size, 32 << 20);
        assert_eq!(config.container.kill_timeout, Duration::from_secs(10));
        assert!(config.network.enabled);
    }

    #[test]
    fn test_parse_partial_file() {
        let text = r#"
            [container]
            kill_timeout = "3s"

            [network]
            enabled = false
        "#;
        let config: DaemonConfig = toml::from_str(text).unwrap();
        assert_eq!(config.container.kill_timeout, Duration::from_secs(3));
        assert!(!config.network.enabled);
        // Untouched sections keep their defaults.
        assert_eq!(config.keyvalue.path, PathBuf::from("/run/paddock/kv"));
    }

    #[test]
    fn test_duration_round_trip() {
        let config = DaemonConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: DaemonConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.container.aging_time, config.container.aging_time);
    }
}
