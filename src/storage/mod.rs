//! Narrow persistence traits consumed by the subsystems, plus the SQLite
//! implementation. Implementations must be internally synchronized.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{EnvVarsInstanceInfo, InstanceData, InstanceIdent, LayerData, NetworkInfo};

pub use sqlite::SqliteStorage;

/// Launcher persistence: current instance set plus a few singleton rows.
#[async_trait]
pub trait LauncherStorage: Send + Sync {
    async fn add_instance(&self, instance: &InstanceData) -> Result<()>;
    async fn update_instance(&self, instance: &InstanceData) -> Result<()>;
    async fn remove_instance(&self, ident: &InstanceIdent) -> Result<()>;
    async fn get_all_instances(&self) -> Result<Vec<InstanceData>>;

    async fn get_operation_version(&self) -> Result<Option<u64>>;
    async fn set_operation_version(&self, version: u64) -> Result<()>;

    async fn get_override_env_vars(&self) -> Result<Vec<EnvVarsInstanceInfo>>;
    async fn set_override_env_vars(&self, env_vars: &[EnvVarsInstanceInfo]) -> Result<()>;

    async fn get_online_time(&self) -> Result<Option<DateTime<Utc>>>;
    async fn set_online_time(&self, time: DateTime<Utc>) -> Result<()>;
}

/// Layer cache persistence, keyed by layer digest.
#[async_trait]
pub trait LayerStorage: Send + Sync {
    async fn add_layer(&self, layer: &LayerData) -> Result<()>;
    async fn update_layer(&self, layer: &LayerData) -> Result<()>;
    async fn remove_layer(&self, digest: &str) -> Result<()>;
    async fn get_layer(&self, digest: &str) -> Result<LayerData>;
    async fn get_all_layers(&self) -> Result<Vec<LayerData>>;
}

/// Network persistence: provider network rows and traffic counters.
#[async_trait]
pub trait NetworkStorage: Send + Sync {
    async fn add_network_info(&self, info: &NetworkInfo) -> Result<()>;
    async fn remove_network_info(&self, network_id: &str) -> Result<()>;
    async fn get_networks_info(&self) -> Result<Vec<NetworkInfo>>;

    async fn set_traffic_monitor_data(&self, chain: &str, time: DateTime<Utc>, value: u64) -> Result<()>;
    async fn get_traffic_monitor_data(&self, chain: &str) -> Result<(DateTime<Utc>, u64)>;
    async fn remove_traffic_monitor_data(&self, chain: &str) -> Result<()>;
}
