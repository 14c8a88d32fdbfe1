//! Per-chain traffic accounting persisted across restarts.
//!
//! Byte counters come from a pluggable [`TrafficCounter`] (the firewall
//! chains of the CNI back-end). Totals accumulate per accounting window; the
//! window key is the current time truncated to the configured period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::storage::NetworkStorage;

const SYSTEM_IN_CHAIN: &str = "AOS_SYSTEM_IN";
const SYSTEM_OUT_CHAIN: &str = "AOS_SYSTEM_OUT";

/// Reads raw byte counters for a firewall chain.
#[async_trait]
pub trait TrafficCounter: Send + Sync {
    async fn chain_bytes(&self, chain: &str) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficPeriod {
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl TrafficPeriod {
    /// Truncates `time` to the start of the accounting window.
    fn window_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let base = Utc
            .with_ymd_and_hms(time.year(), 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(time);

        match self {
            TrafficPeriod::Year => base,
            TrafficPeriod::Month => base
                .with_month(time.month())
                .unwrap_or(base),
            TrafficPeriod::Day => base
                .with_month(time.month())
                .and_then(|t| t.with_day(time.day()))
                .unwrap_or(base),
            TrafficPeriod::Hour => base
                .with_month(time.month())
                .and_then(|t| t.with_day(time.day()))
                .and_then(|t| t.with_hour(time.hour()))
                .unwrap_or(base),
            TrafficPeriod::Minute => base
                .with_month(time.month())
                .and_then(|t| t.with_day(time.day()))
                .and_then(|t| t.with_hour(time.hour()))
                .and_then(|t| t.with_minute(time.minute()))
                .unwrap_or(base),
        }
    }
}

struct ChainData {
    /// Bytes accumulated in the current window, including persisted history.
    total: u64,
    /// Raw counter value at the last sample; deltas are added to the total.
    last_raw: u64,
    window_start: DateTime<Utc>,
    limit: Option<u64>,
}

struct InstanceChains {
    in_chain: String,
    out_chain: String,
}

struct TrafficState {
    period: TrafficPeriod,
    chains: HashMap<String, ChainData>,
    instances: HashMap<String, InstanceChains>,
}

pub struct TrafficMonitor {
    storage: Arc<dyn NetworkStorage>,
    counter: Arc<dyn TrafficCounter>,
    poll_period: Duration,
    state: Mutex<TrafficState>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TrafficMonitor {
    pub fn new(storage: Arc<dyn NetworkStorage>, counter: Arc<dyn TrafficCounter>, poll_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            storage,
            counter,
            poll_period,
            state: Mutex::new(TrafficState {
                period: TrafficPeriod::Day,
                chains: HashMap::new(),
                instances: HashMap::new(),
            }),
            task: parking_lot::Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;

            self.register_chain(&mut state, SYSTEM_IN_CHAIN, None).await;
            self.register_chain(&mut state, SYSTEM_OUT_CHAIN, None).await;
        }

        let monitor = Arc::clone(self);
        let poll_period = self.poll_period;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;

                if let Err(err) = monitor.update(Utc::now()).await {
                    tracing::error!(%err, "traffic update failed");
                }
            }
        });

        *self.task.lock() = Some(handle);

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }

        // Flush current totals so the next start resumes the window.
        let state = self.state.lock().await;

        for (chain, data) in &state.chains {
            if let Err(err) = self.storage.set_traffic_monitor_data(chain, data.window_start, data.total).await {
                tracing::warn!(chain, %err, "failed to persist traffic data");
            }
        }

        Ok(())
    }

    pub async fn set_period(&self, period: TrafficPeriod) {
        self.state.lock().await.period = period;
    }

    pub async fn start_instance_monitoring(
        &self,
        instance_id: &str,
        _ip: &str,
        download_limit: u64,
        upload_limit: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.instances.contains_key(instance_id) {
            return Ok(());
        }

        let in_chain = format!("AOS_{instance_id}_IN");
        let out_chain = format!("AOS_{instance_id}_OUT");

        self.register_chain(&mut state, &in_chain, (download_limit > 0).then_some(download_limit)).await;
        self.register_chain(&mut state, &out_chain, (upload_limit > 0).then_some(upload_limit)).await;

        state
            .instances
            .insert(instance_id.to_string(), InstanceChains { in_chain, out_chain });

        Ok(())
    }

    pub async fn stop_instance_monitoring(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let Some(chains) = state.instances.remove(instance_id) else {
            return Ok(());
        };

        for chain in [chains.in_chain, chains.out_chain] {
            state.chains.remove(&chain);

            if let Err(err) = self.storage.remove_traffic_monitor_data(&chain).await {
                tracing::warn!(chain, %err, "failed to remove traffic data");
            }
        }

        Ok(())
    }

    pub async fn system_traffic(&self) -> Result<(u64, u64)> {
        let state = self.state.lock().await;

        let input = state
            .chains
            .get(SYSTEM_IN_CHAIN)
            .map(|data| data.total)
            .ok_or_else(|| Error::not_found("system traffic not monitored"))?;
        let output = state
            .chains
            .get(SYSTEM_OUT_CHAIN)
            .map(|data| data.total)
            .ok_or_else(|| Error::not_found("system traffic not monitored"))?;

        Ok((input, output))
    }

    pub async fn instance_traffic(&self, instance_id: &str) -> Result<(u64, u64)> {
        let state = self.state.lock().await;

        let chains = state
            .instances
            .get(instance_id)
            .ok_or_else(|| Error::not_found(format!("instance {instance_id} traffic not monitored")))?;

        let input = state.chains.get(&chains.in_chain).map(|data| data.total).unwrap_or(0);
        let output = state.chains.get(&chains.out_chain).map(|data| data.total).unwrap_or(0);

        Ok((input, output))
    }

    /// Samples every chain once and persists the new totals.
    pub async fn update(&self, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let window_start = state.period.window_start(now);

        let chain_names: Vec<String> = state.chains.keys().cloned().collect();

        for chain in chain_names {
            let raw = match self.counter.chain_bytes(&chain).await {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(chain, %err, "failed to read traffic counter");

                    continue;
                }
            };

            let data = state.chains.get_mut(&chain).expect("chain data exists");

            if data.window_start != window_start {
                data.total = 0;
                data.window_start = window_start;
            }

            // A counter running backwards means the chain was recreated; the
            // raw value then counts in full.
            let delta = if raw >= data.last_raw { raw - data.last_raw } else { raw };
            data.total += delta;
            data.last_raw = raw;

            if let Some(limit) = data.limit {
                if data.total > limit {
                    tracing::warn!(chain, total = data.total, limit, "traffic limit exceeded");
                }
            }

            let (total, start) = (data.total, data.window_start);

            if let Err(err) = self.storage.set_traffic_monitor_data(&chain, start, total).await {
                tracing::warn!(chain, %err, "failed to persist traffic data");
            }
        }

        Ok(())
    }

    async fn register_chain(&self, state: &mut TrafficState, chain: &str, limit: Option<u64>) {
        let window_start = state.period.window_start(Utc::now());

        // Resume the persisted total when it belongs to the current window.
        let total = match self.storage.get_traffic_monitor_data(chain).await {
            Ok((stored_start, value)) if stored_start == window_start => value,
            _ => 0,
        };

        state
            .chains
            .insert(chain.to_string(), ChainData { total, last_raw: 0, window_start, limit });
    }
}
