//! Node configuration file handling and host device/resource allocation.
//!
//! The node config lives in a single JSON file at a configured path. A
//! missing file is not an error: it reads as version "0.0.0" with empty
//! content. Updates replace the file atomically and notify subscribers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, ErrorKind, Result};
use crate::monitoring::alert::AlertRules;
use crate::tools::fs::write_file_atomic;
use crate::types::Host;

const EMPTY_VERSION: &str = "0.0.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    /// Maximum number of instances sharing the device; 0 means unlimited.
    #[serde(default)]
    pub shared_count: u64,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub host_devices: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<crate::oci::Mount>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<Host>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigData {
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    #[serde(default)]
    pub resources: Vec<ResourceInfo>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub alert_rules: Option<AlertRules>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub version: String,
    #[serde(default)]
    pub node_config: NodeConfigData,
}

/// Receives the new node config after a successful update.
#[async_trait]
pub trait NodeConfigObserver: Send + Sync {
    async fn receive_node_config(&self, config: &NodeConfig) -> Result<()>;
}

struct State {
    config: NodeConfig,
    config_error: Option<Error>,
    allocated_devices: HashMap<String, Vec<String>>,
}

pub struct ResourceManager {
    config_path: PathBuf,
    node_type: String,
    state: Mutex<State>,
    observers: Mutex<Vec<Arc<dyn NodeConfigObserver>>>,
}

impl ResourceManager {
    pub fn new(config_path: impl Into<PathBuf>, node_type: impl Into<String>) -> Self {
        let config_path = config_path.into();
        let node_type = node_type.into();

        let (config, config_error) = match load_config(&config_path) {
            Ok(config) => (config, None),
            Err(err) => {
                tracing::error!(%err, path = %config_path.display(), "failed to load node config");

                (empty_config(), Some(err))
            }
        };

        tracing::debug!(version = %config.version, "node config loaded");

        Self {
            config_path,
            node_type,
            state: Mutex::new(State { config, config_error, allocated_devices: HashMap::new() }),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub async fn subscribe(&self, observer: Arc<dyn NodeConfigObserver>) {
        self.observers.lock().await.push(observer);
    }

    pub async fn node_config_version(&self) -> String {
        self.state.lock().await.config.version.clone()
    }

    pub async fn node_config(&self) -> Result<NodeConfig> {
        let state = self.state.lock().await;

        match &state.config_error {
            Some(err) => Err(err.clone()),
            None => Ok(state.config.clone()),
        }
    }

    /// Validates a candidate config without applying it.
    pub async fn check_node_config(&self, version: &str, config_json: &str) -> Result<()> {
        let state = self.state.lock().await;

        if version == state.config.version {
            return Err(Error::invalid_argument(format!("node config version {version} is not new")));
        }

        let config: NodeConfig = serde_json::from_str(config_json)?;

        self.validate(&config)
    }

    /// Applies a new config: validates, writes the file atomically, updates
    /// the in-memory copy and notifies subscribers.
    pub async fn update_node_config(&self, version: &str, config_json: &str) -> Result<()> {
        let config = {
            let mut state = self.state.lock().await;

            if version == state.config.version {
                return Err(Error::invalid_argument(format!("node config version {version} is not new")));
            }

            let mut config: NodeConfig = serde_json::from_str(config_json)?;
            config.version = version.to_string();

            self.validate(&config)?;

            write_file_atomic(&self.config_path, &serde_json::to_vec_pretty(&config)?)?;

            state.config = config.clone();
            state.config_error = None;

            config
        };

        tracing::info!(version = %config.version, "node config updated");

        for observer in self.observers.lock().await.iter() {
            if let Err(err) = observer.receive_node_config(&config).await {
                tracing::error!(%err, "node config observer failed");
            }
        }

        Ok(())
    }

    pub async fn device_info(&self, name: &str) -> Result<DeviceInfo> {
        let state = self.state.lock().await;

        state
            .config
            .node_config
            .devices
            .iter()
            .find(|device| device.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("device {name} not found")))
    }

    pub async fn resource_info(&self, name: &str) -> Result<ResourceInfo> {
        let state = self.state.lock().await;

        state
            .config
            .node_config
            .resources
            .iter()
            .find(|resource| resource.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("resource {name} not found")))
    }

    /// Allocates a device for an instance, honoring the shared count.
    pub async fn allocate_device(&self, name: &str, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(err) = &state.config_error {
            return Err(err.clone());
        }

        let shared_count = state
            .config
            .node_config
            .devices
            .iter()
            .find(|device| device.name == name)
            .map(|device| device.shared_count)
            .ok_or_else(|| Error::not_found(format!("device {name} not found")))?;

        let instances = state.allocated_devices.entry(name.to_string()).or_default();

        if instances.iter().any(|id| id == instance_id) {
            tracing::warn!(device = name, instance = instance_id, "device already allocated by instance");

            return Ok(());
        }

        if shared_count != 0 && instances.len() as u64 >= shared_count {
            return Err(Error::no_memory(format!("no device {name} available")));
        }

        instances.push(instance_id.to_string());

        Ok(())
    }

    pub async fn release_device(&self, name: &str, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let instances = state
            .allocated_devices
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("device {name} not allocated")))?;

        let before = instances.len();
        instances.retain(|id| id != instance_id);

        if instances.len() == before {
            return Err(Error::not_found(format!("device {name} not allocated by instance {instance_id}")));
        }

        if instances.is_empty() {
            state.allocated_devices.remove(name);
        }

        Ok(())
    }

    /// Releases every device held by the instance.
    pub async fn release_instance_devices(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut released = false;

        state.allocated_devices.retain(|_, instances| {
            let before = instances.len();
            instances.retain(|id| id != instance_id);
            released |= instances.len() != before;

            !instances.is_empty()
        });

        if !released {
            return Err(Error::new(ErrorKind::NotFound, format!("instance {instance_id} holds no devices")));
        }

        Ok(())
    }

    pub async fn reset_allocated_devices(&self) {
        self.state.lock().await.allocated_devices.clear();
    }

    pub async fn device_instances(&self, name: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;

        state
            .allocated_devices
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("device {name} not allocated")))
    }

    fn validate(&self, config: &NodeConfig) -> Result<()> {
        if config.node_config.node_type != self.node_type {
            return Err(Error::invalid_argument(format!(
                "node config type {} does not match node type {}",
                config.node_config.node_type, self.node_type
            )));
        }

        Ok(())
    }
}

fn empty_config() -> NodeConfig {
    NodeConfig { version: EMPTY_VERSION.to_string(), node_config: NodeConfigData::default() }
}

fn load_config(path: &Path) -> Result<NodeConfig> {
    if !path.exists() {
        return Ok(empty_config());
    }

    let content = std::fs::read(path)?;

    Ok(serde_json::from_slice(&content)?)
}
