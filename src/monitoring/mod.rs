//! Periodic resource sampling, sliding-window averaging and quota alerts.

pub mod alert;
pub mod average;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::resourcemanager::{NodeConfig, NodeConfigObserver};
use crate::types::{InstanceIdent, MonitoringData, NodeInfo, PartitionUsage, RunState};

use alert::{
    Alert, AlertProcessor, AlertRules, AlertSender, InstanceQuotaAlert, ResourceIdentifier, ResourceType,
    SystemQuotaAlert,
};
use average::Average;

/// Parameters for monitoring one instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceMonitorParams {
    pub ident: InstanceIdent,
    pub uid: u32,
    pub gid: u32,
    /// State/storage partitions to watch, names plus paths.
    pub partitions: Vec<PartitionUsage>,
    pub alert_rules: Option<AlertRules>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceMonitoringData {
    pub instance_id: String,
    pub ident: InstanceIdent,
    pub run_state: Option<RunState>,
    pub data: MonitoringData,
}

#[derive(Debug, Clone, Default)]
pub struct NodeMonitoringData {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: MonitoringData,
    pub instances: Vec<InstanceMonitoringData>,
}

/// Supplies raw usage samples for the node and its instances.
#[async_trait]
pub trait ResourceUsageProvider: Send + Sync {
    async fn node_monitoring_data(&self, node_id: &str) -> Result<MonitoringData>;

    /// Samples one instance; `partitions` carries the paths to measure.
    async fn instance_monitoring_data(
        &self,
        instance_id: &str,
        partitions: &[PartitionUsage],
    ) -> Result<MonitoringData>;
}

/// Telemetry sink, active while the cloud connection is up.
#[async_trait]
pub trait MonitorSender: Send + Sync {
    async fn send_monitoring_data(&self, data: &NodeMonitoringData) -> Result<()>;
}

struct InstanceEntry {
    ident: InstanceIdent,
    partitions: Vec<PartitionUsage>,
    run_state: Option<RunState>,
    alerts: Vec<AlertProcessor>,
}

struct MonitorState {
    send_monitoring: bool,
    system_alerts: Vec<AlertProcessor>,
    instances: HashMap<String, InstanceEntry>,
    average: Average,
}

struct MonitorInner {
    config: MonitorConfig,
    node_info: NodeInfo,
    usage: Arc<dyn ResourceUsageProvider>,
    sender: Arc<dyn MonitorSender>,
    alert_sender: Arc<dyn AlertSender>,
    state: Mutex<MonitorState>,
}

/// Background resource monitor; one poll task per node.
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(
        config: MonitorConfig,
        node_info: NodeInfo,
        usage: Arc<dyn ResourceUsageProvider>,
        sender: Arc<dyn MonitorSender>,
        alert_sender: Arc<dyn AlertSender>,
    ) -> Self {
        let window =
            (config.average_window.as_secs() / config.poll_period.as_secs().max(1)).max(1) as usize;

        let inner = Arc::new(MonitorInner {
            config,
            node_info,
            usage,
            sender,
            alert_sender,
            state: Mutex::new(MonitorState {
                send_monitoring: false,
                system_alerts: Vec::new(),
                instances: HashMap::new(),
                average: Average::new(window),
            }),
        });

        Self { inner, task: parking_lot::Mutex::new(None) }
    }

    /// Installs the system alert processors from the node config and starts
    /// the poll loop.
    pub async fn start(&self, node_config: &NodeConfig) -> Result<()> {
        tracing::debug!("start monitoring");

        self.inner.apply_node_config(node_config).await;

        let inner = Arc::clone(&self.inner);
        let poll_period = inner.config.poll_period;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            // The first tick of a tokio interval fires immediately; skip it
            // so samples are spaced a full period apart.
            interval.tick().await;

            loop {
                interval.tick().await;
                inner.poll().await;
            }
        });

        *self.task.lock() = Some(handle);

        Ok(())
    }

    pub async fn stop(&self) {
        tracing::debug!("stop monitoring");

        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    pub async fn on_connect(&self) {
        self.inner.state.lock().await.send_monitoring = true;
    }

    pub async fn on_disconnect(&self) {
        self.inner.state.lock().await.send_monitoring = false;
    }

    pub async fn start_instance_monitoring(&self, instance_id: &str, params: InstanceMonitorParams) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        tracing::debug!(instance_id, "start instance monitoring");

        if state.instances.contains_key(instance_id) {
            return Err(Error::already_exist(format!("instance {instance_id} monitoring already started")));
        }

        let alerts = match &params.alert_rules {
            Some(rules) => self.inner.build_instance_alerts(instance_id, &params.ident, rules),
            None => Vec::new(),
        };

        state.average.start_instance(params.ident.clone())?;

        state.instances.insert(
            instance_id.to_string(),
            InstanceEntry { ident: params.ident, partitions: params.partitions, run_state: None, alerts },
        );

        Ok(())
    }

    pub async fn stop_instance_monitoring(&self, instance_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        tracing::debug!(instance_id, "stop instance monitoring");

        let Some(entry) = state.instances.remove(instance_id) else {
            tracing::warn!(instance_id, "instance monitoring not found");

            return Ok(());
        };

        state.average.stop_instance(&entry.ident)?;

        Ok(())
    }

    pub async fn update_instance_run_state(&self, instance_id: &str, run_state: RunState) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        let entry = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::not_found(format!("instance {instance_id} monitoring not found")))?;

        entry.run_state = Some(run_state);

        Ok(())
    }

    /// Averaged node and instance data over the configured window.
    pub async fn average_monitoring_data(&self) -> NodeMonitoringData {
        let state = self.inner.state.lock().await;

        let instances = state
            .instances
            .iter()
            .map(|(instance_id, entry)| InstanceMonitoringData {
                instance_id: instance_id.clone(),
                ident: entry.ident.clone(),
                run_state: entry.run_state,
                data: state.average.instance_data(&entry.ident).unwrap_or_default(),
            })
            .collect();

        NodeMonitoringData {
            node_id: self.inner.node_info.node_id.clone(),
            timestamp: Utc::now(),
            data: state.average.node_data(),
            instances,
        }
    }
}

#[async_trait]
impl NodeConfigObserver for ResourceMonitor {
    async fn receive_node_config(&self, config: &NodeConfig) -> Result<()> {
        tracing::debug!(version = %config.version, "receive node config");

        self.inner.apply_node_config(config).await;

        Ok(())
    }
}

impl MonitorInner {
    fn cpu_to_dmips(&self, cpu_percent: f64) -> f64 {
        cpu_percent * self.node_info.max_dmips as f64 / 100.0
    }

    fn partition_total_size(&self, name: &str) -> Result<u64> {
        self.node_info
            .partitions
            .iter()
            .find(|partition| partition.name == name)
            .map(|partition| partition.total_size)
            .ok_or_else(|| Error::not_found(format!("partition {name} not found")))
    }

    /// Rebuilds the system alert processors without restarting the loop.
    async fn apply_node_config(&self, node_config: &NodeConfig) {
        let mut state = self.state.lock().await;

        state.system_alerts.clear();

        let Some(rules) = &node_config.node_config.alert_rules else {
            return;
        };

        let system_template = |id: &ResourceIdentifier| {
            Alert::SystemQuota(SystemQuotaAlert {
                node_id: self.node_info.node_id.clone(),
                parameter: id.parameter_name(),
                value: 0,
                timestamp: Default::default(),
                status: alert::AlertStatus::Raise,
            })
        };

        if let Some(rule) = &rules.cpu {
            let id = ResourceIdentifier::system(ResourceType::Cpu);
            let template = system_template(&id);

            state.system_alerts.push(AlertProcessor::from_percents(
                id,
                self.node_info.max_dmips,
                rule,
                Arc::clone(&self.alert_sender),
                template,
            ));
        }

        if let Some(rule) = &rules.ram {
            let id = ResourceIdentifier::system(ResourceType::Ram);
            let template = system_template(&id);

            state.system_alerts.push(AlertProcessor::from_percents(
                id,
                self.node_info.total_ram,
                rule,
                Arc::clone(&self.alert_sender),
                template,
            ));
        }

        for partition_rule in &rules.partitions {
            let total_size = match self.partition_total_size(&partition_rule.name) {
                Ok(size) => size,
                Err(err) => {
                    tracing::warn!(name = %partition_rule.name, %err, "skipping partition alert rule");

                    continue;
                }
            };

            let id = ResourceIdentifier {
                level: alert::ResourceLevel::System,
                resource: ResourceType::Partition,
                partition_name: Some(partition_rule.name.clone()),
                instance_id: None,
            };
            let template = system_template(&id);

            state.system_alerts.push(AlertProcessor::from_percents(
                id,
                total_size,
                &partition_rule.rule,
                Arc::clone(&self.alert_sender),
                template,
            ));
        }

        if let Some(rule) = &rules.download {
            let id = ResourceIdentifier::system(ResourceType::Download);
            let template = system_template(&id);

            state
                .system_alerts
                .push(AlertProcessor::from_points(id, rule, Arc::clone(&self.alert_sender), template));
        }

        if let Some(rule) = &rules.upload {
            let id = ResourceIdentifier::system(ResourceType::Upload);
            let template = system_template(&id);

            state
                .system_alerts
                .push(AlertProcessor::from_points(id, rule, Arc::clone(&self.alert_sender), template));
        }
    }

    fn build_instance_alerts(
        &self,
        instance_id: &str,
        ident: &InstanceIdent,
        rules: &AlertRules,
    ) -> Vec<AlertProcessor> {
        let mut alerts = Vec::new();

        let template = |id: &ResourceIdentifier| {
            Alert::InstanceQuota(InstanceQuotaAlert {
                ident: ident.clone(),
                instance_id: instance_id.to_string(),
                parameter: id.parameter_name(),
                value: 0,
                timestamp: Default::default(),
                status: alert::AlertStatus::Raise,
            })
        };

        if let Some(rule) = &rules.cpu {
            let id = ResourceIdentifier::instance(ResourceType::Cpu, instance_id);
            let alert_template = template(&id);

            alerts.push(AlertProcessor::from_percents(
                id,
                self.node_info.max_dmips,
                rule,
                Arc::clone(&self.alert_sender),
                alert_template,
            ));
        }

        if let Some(rule) = &rules.ram {
            let id = ResourceIdentifier::instance(ResourceType::Ram, instance_id);
            let alert_template = template(&id);

            alerts.push(AlertProcessor::from_percents(
                id,
                self.node_info.total_ram,
                rule,
                Arc::clone(&self.alert_sender),
                alert_template,
            ));
        }

        for partition_rule in &rules.partitions {
            let total_size = match self.partition_total_size(&partition_rule.name) {
                Ok(size) => size,
                Err(err) => {
                    tracing::warn!(name = %partition_rule.name, %err, "skipping instance partition alert rule");

                    continue;
                }
            };

            let id = ResourceIdentifier {
                level: alert::ResourceLevel::Instance,
                resource: ResourceType::Partition,
                partition_name: Some(partition_rule.name.clone()),
                instance_id: Some(instance_id.to_string()),
            };
            let alert_template = template(&id);

            alerts.push(AlertProcessor::from_percents(
                id,
                total_size,
                &partition_rule.rule,
                Arc::clone(&self.alert_sender),
                alert_template,
            ));
        }

        if let Some(rule) = &rules.download {
            let id = ResourceIdentifier::instance(ResourceType::Download, instance_id);
            let alert_template = template(&id);

            alerts.push(AlertProcessor::from_points(id, rule, Arc::clone(&self.alert_sender), alert_template));
        }

        if let Some(rule) = &rules.upload {
            let id = ResourceIdentifier::instance(ResourceType::Upload, instance_id);
            let alert_template = template(&id);

            alerts.push(AlertProcessor::from_points(id, rule, Arc::clone(&self.alert_sender), alert_template));
        }

        alerts
    }

    async fn poll(&self) {
        let timestamp = Utc::now();
        let mut state = self.state.lock().await;

        let mut node_data = match self.usage.node_monitoring_data(&self.node_info.node_id).await {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(%err, "failed to get node monitoring data");

                MonitoringData::default()
            }
        };

        node_data.cpu = self.cpu_to_dmips(node_data.cpu);

        let mut instances_data = Vec::with_capacity(state.instances.len());

        let instance_ids: Vec<String> = state.instances.keys().cloned().collect();

        for instance_id in instance_ids {
            let partitions = state.instances[&instance_id].partitions.clone();

            let mut data = match self.usage.instance_monitoring_data(&instance_id, &partitions).await {
                Ok(data) => data,
                Err(err) => {
                    tracing::error!(%err, instance_id, "failed to get instance monitoring data");

                    continue;
                }
            };

            data.cpu = self.cpu_to_dmips(data.cpu);

            let entry = state.instances.get_mut(&instance_id).expect("instance entry exists");

            drive_alerts(&mut entry.alerts, &data, timestamp).await;

            let ident = entry.ident.clone();
            let run_state = entry.run_state;

            state.average.update_instance(&ident, &data);

            instances_data.push(InstanceMonitoringData {
                instance_id,
                ident,
                run_state,
                data,
            });
        }

        state.average.update_node(&node_data);

        drive_alerts(&mut state.system_alerts, &node_data, timestamp).await;

        if !state.send_monitoring {
            return;
        }

        let message = NodeMonitoringData {
            node_id: self.node_info.node_id.clone(),
            timestamp,
            data: node_data,
            instances: instances_data,
        };

        if let Err(err) = self.sender.send_monitoring_data(&message).await {
            tracing::error!(%err, "failed to send monitoring data");
        }
    }
}

async fn drive_alerts(alerts: &mut [AlertProcessor], data: &MonitoringData, time: DateTime<Utc>) {
    for processor in alerts {
        let Some(value) = current_usage(processor.id(), data) else {
            tracing::error!(id = %processor.id(), "failed to get resource usage");

            continue;
        };

        if let Err(err) = processor.check(value, time).await {
            tracing::error!(id = %processor.id(), %err, "failed to check alert detection");
        }
    }
}

fn current_usage(id: &ResourceIdentifier, data: &MonitoringData) -> Option<u64> {
    match id.resource {
        ResourceType::Cpu => Some((data.cpu + 0.5) as u64),
        ResourceType::Ram => Some(data.ram),
        ResourceType::Download => Some(data.download),
        ResourceType::Upload => Some(data.upload),
        ResourceType::Partition => {
            let name = id.partition_name.as_deref()?;

            data.partitions
                .iter()
                .find(|partition| partition.name == name)
                .map(|partition| partition.used_size)
        }
    }
}
