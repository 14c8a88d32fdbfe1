use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tools::duration::serde_iso8601;
use crate::types::Host;

fn default_layer_ttl() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_poll_period() -> Duration {
    Duration::from_secs(10)
}

fn default_average_window() -> Duration {
    Duration::from_secs(60)
}

/// Core configuration consumed by the service manager subsystems.
///
/// The embedding binary owns parsing and file discovery; this struct is the
/// narrow surface the core needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub work_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub state_dir: PathBuf,
    #[serde(default)]
    pub host_binds: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub layers: LayerManagerConfig,
    #[serde(default)]
    pub monitoring: MonitorConfig,
}

impl Config {
    pub fn new(work_dir: impl Into<PathBuf>, storage_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            storage_dir: storage_dir.into(),
            state_dir: state_dir.into(),
            host_binds: Vec::new(),
            hosts: Vec::new(),
            launcher: LauncherConfig::default(),
            layers: LayerManagerConfig::default(),
            monitoring: MonitorConfig::default(),
        }
    }

    /// Runtime dir holding per-instance state (`<runtime_dir>/<instance_id>`).
    pub fn runtime_dir(&self) -> PathBuf {
        self.work_dir.join("runtime")
    }

    /// Directory with host whiteout files overlaid above `/`.
    pub fn host_whiteouts_dir(&self) -> PathBuf {
        self.work_dir.join("whiteouts")
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.storage_dir.join("layers")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.work_dir.join("download")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Number of concurrent start/stop workers per reconciliation.
    pub num_launch_workers: usize,
    /// Disk share of the work partition the launcher may use, in percent.
    pub work_limit_percent: u32,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self { num_launch_workers: 4, work_limit_percent: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerManagerConfig {
    /// Time a cached layer survives before the sweep removes it.
    #[serde(with = "serde_iso8601", default = "default_layer_ttl")]
    pub ttl: Duration,
    /// Disk share of the layers partition the cache may use, in percent.
    pub limit_percent: u32,
    /// Concurrent layer installs per desired-set batch.
    pub num_install_workers: usize,
}

impl Default for LayerManagerConfig {
    fn default() -> Self {
        Self { ttl: default_layer_ttl(), limit_percent: 0, num_install_workers: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(with = "serde_iso8601", default = "default_poll_period")]
    pub poll_period: Duration,
    #[serde(with = "serde_iso8601", default = "default_average_window")]
    pub average_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { poll_period: default_poll_period(), average_window: default_average_window() }
    }
}
