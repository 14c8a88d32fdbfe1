//! Quota alert rules and the hysteresis state machine driving them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tools::duration::serde_iso8601;
use crate::types::InstanceIdent;

/// Threshold pair in percent of a maximum value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRulePercents {
    #[serde(with = "serde_iso8601")]
    pub min_timeout: Duration,
    pub min_threshold: f64,
    pub max_threshold: f64,
}

/// Threshold pair in absolute points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRulePoints {
    #[serde(with = "serde_iso8601")]
    pub min_timeout: Duration,
    pub min_threshold: u64,
    pub max_threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionAlertRule {
    pub name: String,
    #[serde(flatten)]
    pub rule: AlertRulePercents,
}

/// Alert rule set from node or service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRules {
    #[serde(default)]
    pub cpu: Option<AlertRulePercents>,
    #[serde(default)]
    pub ram: Option<AlertRulePercents>,
    #[serde(default)]
    pub partitions: Vec<PartitionAlertRule>,
    #[serde(default)]
    pub download: Option<AlertRulePoints>,
    #[serde(default)]
    pub upload: Option<AlertRulePoints>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Raise,
    Continue,
    Fall,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Raise => f.write_str("raise"),
            AlertStatus::Continue => f.write_str("continue"),
            AlertStatus::Fall => f.write_str("fall"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLevel {
    System,
    Instance,
}

impl fmt::Display for ResourceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceLevel::System => f.write_str("system"),
            ResourceLevel::Instance => f.write_str("instance"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Cpu,
    Ram,
    Download,
    Upload,
    Partition,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cpu => f.write_str("cpu"),
            ResourceType::Ram => f.write_str("ram"),
            ResourceType::Download => f.write_str("download"),
            ResourceType::Upload => f.write_str("upload"),
            ResourceType::Partition => f.write_str("partition"),
        }
    }
}

/// Identifies which resource of which level an alert processor watches.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceIdentifier {
    pub level: ResourceLevel,
    pub resource: ResourceType,
    pub partition_name: Option<String>,
    pub instance_id: Option<String>,
}

impl ResourceIdentifier {
    pub fn system(resource: ResourceType) -> Self {
        Self { level: ResourceLevel::System, resource, partition_name: None, instance_id: None }
    }

    pub fn instance(resource: ResourceType, instance_id: &str) -> Self {
        Self {
            level: ResourceLevel::Instance,
            resource,
            partition_name: None,
            instance_id: Some(instance_id.to_string()),
        }
    }

    /// Parameter name stitched into outgoing alerts.
    pub fn parameter_name(&self) -> String {
        match &self.partition_name {
            Some(name) => name.clone(),
            None => self.resource.to_string(),
        }
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:{}", self.level, self.resource)?;

        if let Some(name) = &self.partition_name {
            write!(f, ":{name}")?;
        }

        if let Some(id) = &self.instance_id {
            write!(f, ":{id}")?;
        }

        f.write_str("}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemQuotaAlert {
    pub node_id: String,
    pub parameter: String,
    pub value: u64,
    pub timestamp: DateTime<Utc>,
    pub status: AlertStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceQuotaAlert {
    pub ident: InstanceIdent,
    pub instance_id: String,
    pub parameter: String,
    pub value: u64,
    pub timestamp: DateTime<Utc>,
    pub status: AlertStatus,
}

/// Closed alert variant; templates carry the identity fields and get the
/// current value, time and status stitched in when emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    SystemQuota(SystemQuotaAlert),
    InstanceQuota(InstanceQuotaAlert),
}

impl Alert {
    fn filled(&self, value: u64, timestamp: DateTime<Utc>, status: AlertStatus) -> Alert {
        match self {
            Alert::SystemQuota(alert) => {
                Alert::SystemQuota(SystemQuotaAlert { value, timestamp, status, ..alert.clone() })
            }
            Alert::InstanceQuota(alert) => {
                Alert::InstanceQuota(InstanceQuotaAlert { value, timestamp, status, ..alert.clone() })
            }
        }
    }

    pub fn status(&self) -> AlertStatus {
        match self {
            Alert::SystemQuota(alert) => alert.status,
            Alert::InstanceQuota(alert) => alert.status,
        }
    }

    pub fn value(&self) -> u64 {
        match self {
            Alert::SystemQuota(alert) => alert.value,
            Alert::InstanceQuota(alert) => alert.value,
        }
    }
}

/// Sink for emitted alerts.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send_alert(&self, alert: Alert) -> Result<()>;
}

/// Per-resource hysteresis state machine.
///
/// An alert raises after the value stays at or above the max threshold for
/// `min_timeout`, repeats `Continue` at the same cadence while the value
/// stays at or above the min threshold, and falls after the value stays
/// below the min threshold for `min_timeout`.
pub struct AlertProcessor {
    id: ResourceIdentifier,
    sender: Arc<dyn AlertSender>,
    template: Alert,
    min_timeout: chrono::Duration,
    min_threshold: u64,
    max_threshold: u64,
    min_threshold_time: Option<DateTime<Utc>>,
    max_threshold_time: Option<DateTime<Utc>>,
    alert_condition: bool,
}

impl AlertProcessor {
    pub fn from_percents(
        id: ResourceIdentifier,
        max_value: u64,
        rule: &AlertRulePercents,
        sender: Arc<dyn AlertSender>,
        template: Alert,
    ) -> Self {
        let min_threshold = (max_value as f64 * rule.min_threshold / 100.0) as u64;
        let max_threshold = (max_value as f64 * rule.max_threshold / 100.0) as u64;

        Self::new(id, rule.min_timeout, min_threshold, max_threshold, sender, template)
    }

    pub fn from_points(
        id: ResourceIdentifier,
        rule: &AlertRulePoints,
        sender: Arc<dyn AlertSender>,
        template: Alert,
    ) -> Self {
        Self::new(id, rule.min_timeout, rule.min_threshold, rule.max_threshold, sender, template)
    }

    fn new(
        id: ResourceIdentifier,
        min_timeout: Duration,
        min_threshold: u64,
        max_threshold: u64,
        sender: Arc<dyn AlertSender>,
        template: Alert,
    ) -> Self {
        tracing::debug!(id = %id, min_threshold, max_threshold, ?min_timeout, "alert processor created");

        Self {
            id,
            sender,
            template,
            min_timeout: chrono::Duration::from_std(min_timeout).unwrap_or(chrono::Duration::MAX),
            min_threshold,
            max_threshold,
            min_threshold_time: None,
            max_threshold_time: None,
            alert_condition: false,
        }
    }

    pub fn id(&self) -> &ResourceIdentifier {
        &self.id
    }

    /// Feeds one sample into the state machine, emitting alerts as needed.
    pub async fn check(&mut self, value: u64, time: DateTime<Utc>) -> Result<()> {
        if !self.alert_condition {
            self.handle_max_threshold(value, time).await
        } else {
            self.handle_min_threshold(value, time).await
        }
    }

    async fn handle_max_threshold(&mut self, value: u64, time: DateTime<Utc>) -> Result<()> {
        if value >= self.max_threshold && self.max_threshold_time.is_none() {
            tracing::info!(id = %self.id, value, threshold = self.max_threshold, "max threshold crossed");

            self.max_threshold_time = Some(time);
        }

        if let Some(crossed) = self.max_threshold_time {
            if value >= self.max_threshold && time - crossed >= self.min_timeout {
                tracing::info!(id = %self.id, value, status = %AlertStatus::Raise, "resource alert");

                self.alert_condition = true;
                self.max_threshold_time = Some(time);
                self.min_threshold_time = None;

                return self.send_alert(value, time, AlertStatus::Raise).await;
            }

            if value < self.max_threshold {
                self.max_threshold_time = None;
            }
        }

        Ok(())
    }

    async fn handle_min_threshold(&mut self, value: u64, time: DateTime<Utc>) -> Result<()> {
        if value >= self.min_threshold {
            self.min_threshold_time = None;

            let since_last = self.max_threshold_time.map(|last| time - last);

            if since_last.map_or(true, |elapsed| elapsed >= self.min_timeout) {
                self.max_threshold_time = Some(time);

                tracing::info!(id = %self.id, value, status = %AlertStatus::Continue, "resource alert");

                return self.send_alert(value, time, AlertStatus::Continue).await;
            }

            return Ok(());
        }

        let Some(crossed) = self.min_threshold_time else {
            tracing::info!(id = %self.id, value, threshold = self.min_threshold, "min threshold crossed");

            self.min_threshold_time = Some(time);

            return Ok(());
        };

        if time - crossed >= self.min_timeout {
            tracing::info!(id = %self.id, value, status = %AlertStatus::Fall, "resource alert");

            self.alert_condition = false;
            self.min_threshold_time = Some(time);
            self.max_threshold_time = None;

            return self.send_alert(value, time, AlertStatus::Fall).await;
        }

        Ok(())
    }

    async fn send_alert(&self, value: u64, time: DateTime<Utc>, status: AlertStatus) -> Result<()> {
        let alert = self.template.filled(value, time, status);

        if let Err(err) = self.sender.send_alert(alert).await {
            tracing::error!(id = %self.id, %err, "failed to send alert");

            return Err(err);
        }

        Ok(())
    }
}
