//! Sliding-window averaging of monitoring samples.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::{InstanceIdent, MonitoringData};

/// Incremental mean that behaves like a moving average once `window` samples
/// have been seen.
#[derive(Debug, Clone, Default)]
struct AverageField {
    count: usize,
    value: f64,
}

impl AverageField {
    fn update(&mut self, window: usize, sample: f64) {
        if self.count < window {
            self.value = (self.value * self.count as f64 + sample) / (self.count + 1) as f64;
            self.count += 1;
        } else {
            self.value += (sample - self.value) / window as f64;
        }
    }
}

#[derive(Debug, Clone, Default)]
struct AverageData {
    cpu: AverageField,
    ram: AverageField,
    download: AverageField,
    upload: AverageField,
    partitions: Vec<(String, AverageField)>,
}

impl AverageData {
    fn update(&mut self, window: usize, sample: &MonitoringData) {
        self.cpu.update(window, sample.cpu);
        self.ram.update(window, sample.ram as f64);
        self.download.update(window, sample.download as f64);
        self.upload.update(window, sample.upload as f64);

        for partition in &sample.partitions {
            match self.partitions.iter_mut().find(|(name, _)| *name == partition.name) {
                Some((_, field)) => field.update(window, partition.used_size as f64),
                None => {
                    let mut field = AverageField::default();
                    field.update(window, partition.used_size as f64);
                    self.partitions.push((partition.name.clone(), field));
                }
            }
        }
    }

    fn snapshot(&self, template: &MonitoringData) -> MonitoringData {
        let mut data = template.clone();

        data.cpu = self.cpu.value;
        data.ram = self.ram.value.round() as u64;
        data.download = self.download.value.round() as u64;
        data.upload = self.upload.value.round() as u64;

        for partition in &mut data.partitions {
            if let Some((_, field)) = self.partitions.iter().find(|(name, _)| *name == partition.name) {
                partition.used_size = field.value.round() as u64;
            }
        }

        data
    }
}

/// Averaged view over node and per-instance monitoring data.
pub struct Average {
    window: usize,
    node: AverageData,
    node_template: MonitoringData,
    instances: HashMap<InstanceIdent, (AverageData, MonitoringData)>,
}

impl Average {
    /// `window` is `average_window / poll_period` rounded down, at least one
    /// sample.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            node: AverageData::default(),
            node_template: MonitoringData::default(),
            instances: HashMap::new(),
        }
    }

    pub fn start_instance(&mut self, ident: InstanceIdent) -> Result<()> {
        if self.instances.contains_key(&ident) {
            return Err(Error::already_exist(format!("average for instance {ident} already tracked")));
        }

        self.instances.insert(ident, (AverageData::default(), MonitoringData::default()));

        Ok(())
    }

    pub fn stop_instance(&mut self, ident: &InstanceIdent) -> Result<()> {
        self.instances
            .remove(ident)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("average for instance {ident} not tracked")))
    }

    pub fn update_node(&mut self, sample: &MonitoringData) {
        self.node.update(self.window, sample);
        self.node_template = sample.clone();
    }

    pub fn update_instance(&mut self, ident: &InstanceIdent, sample: &MonitoringData) {
        if let Some((average, template)) = self.instances.get_mut(ident) {
            average.update(self.window, sample);
            *template = sample.clone();
        }
    }

    pub fn node_data(&self) -> MonitoringData {
        self.node.snapshot(&self.node_template)
    }

    pub fn instance_data(&self, ident: &InstanceIdent) -> Option<MonitoringData> {
        self.instances.get(ident).map(|(average, template)| average.snapshot(template))
    }
}
