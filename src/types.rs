use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Globally unique identity of a service instance on this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceIdent {
    pub service_id: String,
    pub subject_id: String,
    pub instance: u64,
}

impl fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.service_id, self.subject_id, self.instance)
    }
}

/// Desired-state description of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub ident: InstanceIdent,
    pub uid: u32,
    pub priority: u64,
    #[serde(default)]
    pub state_path: String,
    #[serde(default)]
    pub storage_path: String,
    #[serde(default)]
    pub network_parameters: NetworkParameters,
}

/// Instance info plus the stable runtime handle assigned on first start.
///
/// The `instance_id` is used as runtime dirname, cgroup name and netns name
/// and survives node restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceData {
    pub info: InstanceInfo,
    pub instance_id: String,
}

/// Desired-state description of a service revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: String,
    pub provider_id: String,
    pub version: String,
    pub gid: u32,
    pub url: String,
    #[serde(default)]
    pub sha256: Vec<u8>,
    #[serde(default)]
    pub size: u64,
}

/// Installed service snapshot, owned by the service manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceData {
    pub service_id: String,
    pub provider_id: String,
    pub version: String,
    pub gid: u32,
    pub image_path: PathBuf,
}

/// Desired-state description of a filesystem layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub layer_id: String,
    pub layer_digest: String,
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub sha256: Vec<u8>,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerState {
    Active,
    Cached,
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerState::Active => f.write_str("active"),
            LayerState::Cached => f.write_str("cached"),
        }
    }
}

impl std::str::FromStr for LayerState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LayerState::Active),
            "cached" => Ok(LayerState::Cached),
            other => Err(crate::error::Error::invalid_argument(format!("unknown layer state: {other}"))),
        }
    }
}

/// Installed layer row; keyed by `layer_digest`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerData {
    pub layer_digest: String,
    pub layer_id: String,
    pub version: String,
    pub path: PathBuf,
    pub os_version: String,
    pub size: u64,
    pub state: LayerState,
    pub timestamp: DateTime<Utc>,
}

/// Provider network definition from the desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkParameters {
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub vlan_id: u64,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub firewall_rules: Vec<FirewallRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub dst_ip: String,
    pub dst_port: String,
    pub proto: String,
    pub src_ip: String,
}

/// Persisted provider network row; one per provider.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
    pub network_id: String,
    pub subnet: String,
    pub ip: String,
    pub vlan_id: u64,
    pub vlan_if_name: String,
}

/// A hosts-file entry supplied by configuration or resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub ip: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Active,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Active => f.write_str("active"),
            RunState::Failed => f.write_str("failed"),
        }
    }
}

/// Per-instance entry of a run-status report.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatus {
    pub ident: InstanceIdent,
    pub service_version: String,
    pub run_state: RunState,
    pub error: Option<ErrorKind>,
}

/// One resource sample: CPU in DMIPS points, RAM and partition use in bytes,
/// traffic counters in bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitoringData {
    pub cpu: f64,
    pub ram: u64,
    pub partitions: Vec<PartitionUsage>,
    pub download: u64,
    pub upload: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionUsage {
    pub name: String,
    pub path: PathBuf,
    pub total_size: u64,
    pub used_size: u64,
}

/// Static node description used for quota math and status reports.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub node_id: String,
    pub node_type: String,
    pub max_dmips: u64,
    pub total_ram: u64,
    pub num_cpu_cores: u64,
    pub partitions: Vec<PartitionUsage>,
}

/// Environment variable override targeting instances by ident filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVarsInstanceInfo {
    pub filter: InstanceFilter,
    pub variables: Vec<EnvVarInfo>,
}

/// Instance filter; `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceFilter {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub instance: Option<u64>,
}

impl InstanceFilter {
    pub fn matches(&self, ident: &InstanceIdent) -> bool {
        self.service_id.as_ref().map_or(true, |s| *s == ident.service_id)
            && self.subject_id.as_ref().map_or(true, |s| *s == ident.subject_id)
            && self.instance.map_or(true, |i| i == ident.instance)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVarInfo {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub ttl: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvVarsInstanceStatus {
    pub filter: InstanceFilter,
    pub statuses: Vec<EnvVarStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvVarStatus {
    pub name: String,
    pub error: Option<ErrorKind>,
}

/// Compares semver version strings the way service updates are decided:
/// prerelease sorts before release, build metadata is ignored.
pub fn compare_versions(left: &str, right: &str) -> crate::error::Result<std::cmp::Ordering> {
    let left = semver::Version::parse(left)
        .map_err(|err| crate::error::Error::invalid_argument(format!("bad version {left}: {err}")))?;
    let right = semver::Version::parse(right)
        .map_err(|err| crate::error::Error::invalid_argument(format!("bad version {right}: {err}")))?;

    Ok(left.cmp_precedence(&right))
}
