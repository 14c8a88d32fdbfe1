//! Per-instance networking: provider networks (bridge + VLAN), the CNI
//! pipeline, hosts/resolv.conf materialization and traffic accounting.

pub mod cni;
pub mod traffic;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, ErrorKind, Result};
use crate::storage::NetworkStorage;
use crate::tools::fs::write_file_atomic;
use crate::types::{Host, InstanceIdent, NetworkInfo, NetworkParameters};

use cni::{
    BandwidthPluginConf, BridgePluginConf, Cni, CniResult, DnsPluginCapabilities, DnsPluginConf, FirewallPluginConf,
    InputAccessRule, IpamConfig, IpamRange, NetworkConfigList, OutputAccessRule, Router, RuntimeConf,
    ADMIN_CHAIN_PREFIX, BANDWIDTH_BURST, BRIDGE_PREFIX, CNI_VERSION, INSTANCE_INTERFACE_NAME,
};
pub use traffic::{TrafficCounter, TrafficMonitor, TrafficPeriod};

const VLAN_IF_PREFIX: &str = "veth-";
const VLAN_NAME_RETRIES: usize = 10;
const FALLBACK_DNS: &str = "8.8.8.8";

/// Network namespace lifecycle, one namespace per instance.
#[async_trait]
pub trait NetnsManager: Send + Sync {
    async fn create_namespace(&self, instance_id: &str) -> Result<()>;
    async fn delete_namespace(&self, instance_id: &str) -> Result<()>;
    fn namespace_path(&self, instance_id: &str) -> PathBuf;
}

/// Host link management for bridges and VLAN sub-interfaces.
#[async_trait]
pub trait InterfaceManager: Send + Sync {
    async fn create_bridge(&self, name: &str, ip: &str, subnet: &str) -> Result<()>;
    async fn create_vlan(&self, name: &str, vlan_id: u64) -> Result<()>;
    async fn set_master(&self, link: &str, master: &str) -> Result<()>;
    async fn delete_link(&self, name: &str) -> Result<()>;
}

/// Everything the launcher knows about one instance's networking.
#[derive(Debug, Clone, Default)]
pub struct InstanceNetworkParams {
    pub ident: InstanceIdent,
    pub network: NetworkParameters,
    pub hostname: String,
    pub aliases: Vec<String>,
    pub exposed_ports: Vec<String>,
    pub ingress_kbit: u64,
    pub egress_kbit: u64,
    pub download_limit: u64,
    pub upload_limit: u64,
    pub hosts: Vec<Host>,
    pub hosts_file_path: Option<PathBuf>,
    pub resolv_conf_file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
struct InstanceNetwork {
    ip: String,
    hosts: Vec<String>,
}

#[derive(Default)]
struct NetState {
    providers: HashMap<String, NetworkInfo>,
    networks: HashMap<String, HashMap<String, InstanceNetwork>>,
}

pub struct NetworkManager {
    storage: Arc<dyn NetworkStorage>,
    cni: Arc<dyn Cni>,
    netns: Arc<dyn NetnsManager>,
    netif: Arc<dyn InterfaceManager>,
    traffic: Arc<TrafficMonitor>,
    cache_dir: PathBuf,
    state: Mutex<NetState>,
}

impl NetworkManager {
    /// Recreates the CNI config dir and restores persisted provider networks
    /// (bridge plus VLAN sub-interface each).
    pub async fn new(
        work_dir: &Path,
        storage: Arc<dyn NetworkStorage>,
        cni: Arc<dyn Cni>,
        netns: Arc<dyn NetnsManager>,
        netif: Arc<dyn InterfaceManager>,
        traffic: Arc<TrafficMonitor>,
    ) -> Result<Self> {
        tracing::debug!("init network manager");

        let cni_dir = work_dir.join("cni");

        crate::tools::fs::clear_dir(&cni_dir)?;

        let manager = Self {
            storage,
            cni,
            netns,
            netif,
            traffic,
            cache_dir: cni_dir.join("networks"),
            state: Mutex::new(NetState::default()),
        };

        let persisted = manager.storage.get_networks_info().await?;
        let mut state = manager.state.lock().await;

        for info in persisted {
            manager.create_network(&info).await?;
            state.providers.insert(info.network_id.clone(), info);
        }

        drop(state);

        Ok(manager)
    }

    pub async fn start(&self) -> Result<()> {
        self.traffic.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.traffic.stop().await
    }

    /// Applies the desired provider network set: absent networks are torn
    /// down, new ones created. A changed gateway IP is remove+create.
    pub async fn update_networks(&self, desired: &[NetworkParameters]) -> Result<()> {
        tracing::debug!(count = desired.len(), "update networks");

        self.remove_networks(desired).await?;

        let to_create: Vec<NetworkParameters> = {
            let state = self.state.lock().await;

            desired
                .iter()
                .filter(|network| !state.providers.contains_key(&network.network_id))
                .cloned()
                .collect()
        };

        for network in to_create {
            let vlan_if_name = self.generate_vlan_if_name().await?;

            let info = NetworkInfo {
                network_id: network.network_id.clone(),
                subnet: network.subnet.clone(),
                ip: network.ip.clone(),
                vlan_id: network.vlan_id,
                vlan_if_name,
            };

            self.create_network(&info).await?;
            self.storage.add_network_info(&info).await?;

            self.state.lock().await.providers.insert(info.network_id.clone(), info);
        }

        Ok(())
    }

    /// Joins an instance to a provider network. The whole pipeline is atomic:
    /// on any failure every prior step is rolled back and the first error is
    /// returned.
    pub async fn add_instance_to_network(
        &self,
        instance_id: &str,
        network_id: &str,
        params: &InstanceNetworkParams,
    ) -> Result<()> {
        tracing::debug!(instance_id, network_id, "add instance to network");

        {
            let mut state = self.state.lock().await;

            let network = state.networks.entry(network_id.to_string()).or_default();

            if network.contains_key(instance_id) {
                return Err(Error::already_exist(format!(
                    "instance {instance_id} already in network {network_id}"
                )));
            }

            network.insert(instance_id.to_string(), InstanceNetwork::default());
        }

        if let Err(err) = self.netns.create_namespace(instance_id).await {
            self.remove_instance_from_cache(instance_id, network_id).await;

            return Err(err);
        }

        let prepared = self.prepare_cni_config(instance_id, network_id, params).await;

        let (config, rt, hosts) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.rollback(instance_id, network_id, None, None, false, params).await;

                return Err(err);
            }
        };

        let result = match self.cni.add_network_list(&config, &rt).await {
            Ok(result) => result,
            Err(err) => {
                self.rollback(instance_id, network_id, None, None, false, params).await;

                return Err(err);
            }
        };

        if let Err(err) = self
            .traffic
            .start_instance_monitoring(instance_id, &params.network.ip, params.download_limit, params.upload_limit)
            .await
        {
            self.rollback(instance_id, network_id, Some(&config), Some(&rt), false, params).await;

            return Err(err);
        }

        if let Err(err) = self.write_instance_files(network_id, params, &result) {
            self.rollback(instance_id, network_id, Some(&config), Some(&rt), true, params).await;

            return Err(err);
        }

        {
            let mut state = self.state.lock().await;

            if let Some(entry) = state
                .networks
                .get_mut(network_id)
                .and_then(|network| network.get_mut(instance_id))
            {
                entry.ip = params.network.ip.clone();
                entry.hosts = hosts;
            }
        }

        tracing::info!(instance_id, network_id, "instance added to network");

        Ok(())
    }

    pub async fn remove_instance_from_network(&self, instance_id: &str, network_id: &str) -> Result<()> {
        tracing::debug!(instance_id, network_id, "remove instance from network");

        {
            let state = self.state.lock().await;

            if !state.providers.contains_key(network_id) && !state.networks.contains_key(network_id) {
                tracing::warn!(network_id, "network not found");

                return Ok(());
            }

            let in_network = state
                .networks
                .get(network_id)
                .is_some_and(|network| network.contains_key(instance_id));

            if !in_network {
                return Err(Error::not_found(format!(
                    "instance {instance_id} not in network {network_id}"
                )));
            }
        }

        self.traffic.stop_instance_monitoring(instance_id).await?;

        let rt = self.runtime_conf(instance_id, Vec::new());

        match self.cni.cached_network_list(network_id, &rt).await {
            Ok(config) => {
                self.cni.delete_network_list(&config, &rt).await?;
            }
            Err(err) => {
                tracing::warn!(instance_id, network_id, %err, "no cached CNI config");
            }
        }

        self.netns.delete_namespace(instance_id).await?;

        self.remove_instance_from_cache(instance_id, network_id).await;

        tracing::info!(instance_id, network_id, "instance removed from network");

        Ok(())
    }

    pub async fn instance_ip(&self, instance_id: &str, network_id: &str) -> Result<String> {
        let state = self.state.lock().await;

        state
            .networks
            .get(network_id)
            .and_then(|network| network.get(instance_id))
            .map(|entry| entry.ip.clone())
            .ok_or_else(|| Error::not_found(format!("instance {instance_id} not in network {network_id}")))
    }

    pub fn netns_path(&self, instance_id: &str) -> PathBuf {
        self.netns.namespace_path(instance_id)
    }

    pub async fn system_traffic(&self) -> Result<(u64, u64)> {
        self.traffic.system_traffic().await
    }

    pub async fn instance_traffic(&self, instance_id: &str) -> Result<(u64, u64)> {
        self.traffic.instance_traffic(instance_id).await
    }

    pub async fn set_traffic_period(&self, period: TrafficPeriod) {
        self.traffic.set_period(period).await;
    }

    async fn remove_networks(&self, desired: &[NetworkParameters]) -> Result<()> {
        let to_remove: Vec<String> = {
            let state = self.state.lock().await;

            state
                .providers
                .values()
                .filter(|info| {
                    match desired.iter().find(|network| network.network_id == info.network_id) {
                        // Gateway change is remove+create.
                        Some(network) => network.ip != info.ip,
                        None => true,
                    }
                })
                .map(|info| info.network_id.clone())
                .collect()
        };

        let mut first_err = None;

        for network_id in to_remove {
            if let Err(err) = self.remove_network_instances(&network_id).await {
                if !err.is(ErrorKind::NotFound) && first_err.is_none() {
                    first_err = Some(err);
                }
            }

            if let Err(err) = self.clear_network(&network_id).await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }

            self.state.lock().await.providers.remove(&network_id);

            if let Err(err) = self.storage.remove_network_info(&network_id).await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn remove_network_instances(&self, network_id: &str) -> Result<()> {
        tracing::debug!(network_id, "remove network instances");

        let instance_ids: Vec<String> = {
            let state = self.state.lock().await;

            match state.networks.get(network_id) {
                Some(network) => network.keys().cloned().collect(),
                None => return Err(Error::not_found(format!("network {network_id} has no instances"))),
            }
        };

        let mut first_err = None;

        for instance_id in instance_ids {
            if let Err(err) = self.remove_instance_from_network(&instance_id, network_id).await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn clear_network(&self, network_id: &str) -> Result<()> {
        tracing::debug!(network_id, "clear network");

        self.netif.delete_link(&format!("{BRIDGE_PREFIX}{network_id}")).await?;

        let vlan_if_name = {
            let state = self.state.lock().await;

            state.providers.get(network_id).map(|info| info.vlan_if_name.clone())
        };

        if let Some(vlan_if_name) = vlan_if_name {
            if !vlan_if_name.is_empty() {
                self.netif.delete_link(&vlan_if_name).await?;
            }
        }

        std::fs::remove_dir_all(self.cache_dir.join(network_id)).or_else(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(err)
            }
        })?;

        Ok(())
    }

    async fn create_network(&self, info: &NetworkInfo) -> Result<()> {
        tracing::debug!(
            network_id = %info.network_id,
            subnet = %info.subnet,
            ip = %info.ip,
            vlan_id = info.vlan_id,
            "create network"
        );

        let bridge_name = format!("{BRIDGE_PREFIX}{}", info.network_id);

        self.netif.create_bridge(&bridge_name, &info.ip, &info.subnet).await?;
        self.netif.create_vlan(&info.vlan_if_name, info.vlan_id).await?;
        self.netif.set_master(&info.vlan_if_name, &bridge_name).await?;

        Ok(())
    }

    async fn generate_vlan_if_name(&self) -> Result<String> {
        let state = self.state.lock().await;

        for _ in 0..VLAN_NAME_RETRIES {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            let candidate = format!("{VLAN_IF_PREFIX}{}", &suffix[..4]);

            if !state.providers.values().any(|info| info.vlan_if_name == candidate) {
                return Ok(candidate);
            }
        }

        Err(Error::not_found("can't generate unique vlan interface name"))
    }

    async fn remove_instance_from_cache(&self, instance_id: &str, network_id: &str) {
        let (clear, drop_entry) = {
            let mut state = self.state.lock().await;

            let Some(network) = state.networks.get_mut(network_id) else {
                return;
            };

            network.remove(instance_id);

            let empty = network.is_empty();
            let provider_present = state.providers.contains_key(network_id);

            (empty && !provider_present, empty)
        };

        if clear {
            if let Err(err) = self.clear_network(network_id).await {
                tracing::error!(network_id, %err, "failed to clear network");
            }
        }

        if drop_entry {
            self.state.lock().await.networks.remove(network_id);
        }
    }

    /// Unwinds a partially-completed add in reverse step order.
    async fn rollback(
        &self,
        instance_id: &str,
        network_id: &str,
        config: Option<&NetworkConfigList>,
        rt: Option<&RuntimeConf>,
        stop_traffic: bool,
        params: &InstanceNetworkParams,
    ) {
        if stop_traffic {
            if let Err(err) = self.traffic.stop_instance_monitoring(instance_id).await {
                tracing::error!(instance_id, %err, "rollback: failed to stop traffic monitoring");
            }
        }

        if let (Some(config), Some(rt)) = (config, rt) {
            if let Err(err) = self.cni.delete_network_list(config, rt).await {
                tracing::error!(instance_id, %err, "rollback: failed to delete network list");
            }
        }

        if let Err(err) = self.netns.delete_namespace(instance_id).await {
            tracing::error!(instance_id, %err, "rollback: failed to delete network namespace");
        }

        for path in [&params.hosts_file_path, &params.resolv_conf_file_path].into_iter().flatten() {
            let _ = std::fs::remove_file(path);
        }

        self.remove_instance_from_cache(instance_id, network_id).await;
    }

    async fn prepare_cni_config(
        &self,
        instance_id: &str,
        network_id: &str,
        params: &InstanceNetworkParams,
    ) -> Result<(NetworkConfigList, RuntimeConf, Vec<String>)> {
        let hosts = self.prepare_hosts(instance_id, network_id, params).await?;

        let config = NetworkConfigList {
            name: network_id.to_string(),
            version: CNI_VERSION.to_string(),
            bridge: Some(self.bridge_plugin_conf(network_id, params).await),
            firewall: Some(firewall_plugin_conf(instance_id, params)?),
            bandwidth: bandwidth_plugin_conf(params),
            dns: Some(dns_plugin_conf(network_id, params)),
        };

        let rt = self.runtime_conf(instance_id, hosts.clone());

        Ok((config, rt, hosts))
    }

    /// Builds the instance's hosts vector in alias, hostname, ident order,
    /// deduped, with `<host>.<network>` variants for plain names. Collisions
    /// with other instances' hosts in the same network fail.
    async fn prepare_hosts(
        &self,
        instance_id: &str,
        network_id: &str,
        params: &InstanceNetworkParams,
    ) -> Result<Vec<String>> {
        let mut hosts: Vec<String> = Vec::new();

        for alias in &params.aliases {
            push_host_with_domain(&mut hosts, alias, network_id);
        }

        if !params.hostname.is_empty() {
            push_host_with_domain(&mut hosts, &params.hostname, network_id);
        }

        let ident = &params.ident;

        if !ident.service_id.is_empty() && !ident.subject_id.is_empty() {
            push_host_with_domain(
                &mut hosts,
                &format!("{}.{}.{}", ident.instance, ident.subject_id, ident.service_id),
                network_id,
            );

            if ident.instance == 0 {
                push_host_with_domain(&mut hosts, &format!("{}.{}", ident.subject_id, ident.service_id), network_id);
            }
        }

        let state = self.state.lock().await;

        if let Some(network) = state.networks.get(network_id) {
            for (other_id, other) in network {
                if other_id == instance_id {
                    continue;
                }

                if let Some(host) = hosts.iter().find(|host| other.hosts.contains(host)) {
                    return Err(Error::already_exist(format!(
                        "host {host} already taken in network {network_id}"
                    )));
                }
            }
        }

        Ok(hosts)
    }

    async fn bridge_plugin_conf(&self, network_id: &str, params: &InstanceNetworkParams) -> BridgePluginConf {
        let gateway = {
            let state = self.state.lock().await;

            state.providers.get(network_id).map(|info| info.ip.clone()).unwrap_or_default()
        };

        BridgePluginConf {
            plugin_type: "bridge".to_string(),
            bridge: format!("{BRIDGE_PREFIX}{network_id}"),
            is_gateway: true,
            ip_masq: true,
            hairpin_mode: true,
            ipam: IpamConfig {
                ipam_type: "host-local".to_string(),
                data_dir: self.cache_dir.to_string_lossy().into_owned(),
                range: IpamRange {
                    range_start: params.network.ip.clone(),
                    range_end: params.network.ip.clone(),
                    subnet: params.network.subnet.clone(),
                    gateway,
                },
                routes: vec![Router { dst: "0.0.0.0/0".to_string() }],
            },
        }
    }

    fn runtime_conf(&self, instance_id: &str, hosts: Vec<String>) -> RuntimeConf {
        RuntimeConf {
            container_id: instance_id.to_string(),
            netns_path: self.netns.namespace_path(instance_id).to_string_lossy().into_owned(),
            if_name: INSTANCE_INTERFACE_NAME.to_string(),
            args: vec![
                ("IgnoreUnknown".to_string(), "1".to_string()),
                ("K8S_POD_NAME".to_string(), instance_id.to_string()),
            ],
            hosts,
        }
    }

    fn write_instance_files(
        &self,
        network_id: &str,
        params: &InstanceNetworkParams,
        result: &CniResult,
    ) -> Result<()> {
        if let Some(path) = &params.hosts_file_path {
            write_hosts_file(path, network_id, params)?;
        }

        if let Some(path) = &params.resolv_conf_file_path {
            write_resolv_conf_file(path, params, result)?;
        }

        Ok(())
    }
}

fn push_host_with_domain(hosts: &mut Vec<String>, host: &str, network_id: &str) {
    if !hosts.iter().any(|existing| existing == host) {
        hosts.push(host.to_string());
    }

    if !host.contains('.') {
        let with_domain = format!("{host}.{network_id}");

        if !hosts.iter().any(|existing| *existing == with_domain) {
            hosts.push(with_domain);
        }
    }
}

fn firewall_plugin_conf(instance_id: &str, params: &InstanceNetworkParams) -> Result<FirewallPluginConf> {
    let mut input_access = Vec::new();

    for port in &params.exposed_ports {
        let (port, protocol) = match port.split_once('/') {
            Some((port, protocol)) => (port, protocol),
            None => (port.as_str(), "tcp"),
        };

        if port.is_empty() {
            return Err(Error::invalid_argument("empty exposed port"));
        }

        input_access.push(InputAccessRule { port: port.to_string(), protocol: protocol.to_string() });
    }

    let output_access = params
        .network
        .firewall_rules
        .iter()
        .map(|rule| OutputAccessRule {
            dst_ip: rule.dst_ip.clone(),
            dst_port: rule.dst_port.clone(),
            proto: rule.proto.clone(),
            src_ip: rule.src_ip.clone(),
        })
        .collect();

    Ok(FirewallPluginConf {
        plugin_type: "aos-firewall".to_string(),
        uuid: instance_id.to_string(),
        iptables_admin_chain_name: format!("{ADMIN_CHAIN_PREFIX}{instance_id}"),
        allow_public_connections: true,
        input_access,
        output_access,
    })
}

fn bandwidth_plugin_conf(params: &InstanceNetworkParams) -> Option<BandwidthPluginConf> {
    if params.ingress_kbit == 0 && params.egress_kbit == 0 {
        return None;
    }

    let mut config = BandwidthPluginConf { plugin_type: "bandwidth".to_string(), ..Default::default() };

    if params.ingress_kbit > 0 {
        config.ingress_rate = Some(params.ingress_kbit * 1000);
        config.ingress_burst = Some(BANDWIDTH_BURST);
    }

    if params.egress_kbit > 0 {
        config.egress_rate = Some(params.egress_kbit * 1000);
        config.egress_burst = Some(BANDWIDTH_BURST);
    }

    Some(config)
}

fn dns_plugin_conf(network_id: &str, params: &InstanceNetworkParams) -> DnsPluginConf {
    DnsPluginConf {
        plugin_type: "dnsname".to_string(),
        multi_domain: true,
        domain_name: network_id.to_string(),
        capabilities: DnsPluginCapabilities { aliases: true },
        remote_servers: params.network.dns_servers.clone(),
    }
}

fn write_hosts_file(path: &Path, network_id: &str, params: &InstanceNetworkParams) -> Result<()> {
    let mut content = String::new();

    content.push_str("127.0.0.1\tlocalhost\n");
    content.push_str("::1\tlocalhost ip6-localhost ip6-loopback\n");

    let mut own_hosts = network_id.to_string();

    if !params.hostname.is_empty() {
        own_hosts.push(' ');
        own_hosts.push_str(&params.hostname);
    }

    content.push_str(&format!("{}\t{own_hosts}\n", params.network.ip));

    for host in &params.hosts {
        content.push_str(&format!("{}\t{}\n", host.ip, host.hostname));
    }

    write_file_atomic(path, content.as_bytes())
}

fn write_resolv_conf_file(path: &Path, params: &InstanceNetworkParams, result: &CniResult) -> Result<()> {
    let mut servers: Vec<&str> = if result.dns_servers.is_empty() {
        vec![FALLBACK_DNS]
    } else {
        result.dns_servers.iter().map(String::as_str).collect()
    };

    servers.extend(params.network.dns_servers.iter().map(String::as_str));

    let mut content = String::new();

    for server in servers {
        content.push_str(&format!("nameserver\t{server}\n"));
    }

    write_file_atomic(path, content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    #[derive(Default)]
    struct StubCni {
        added: parking_lot::Mutex<Vec<(NetworkConfigList, RuntimeConf)>>,
        deleted: parking_lot::Mutex<Vec<String>>,
        fail_add: std::sync::atomic::AtomicBool,
        dns_servers: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Cni for StubCni {
        async fn add_network_list(&self, config: &NetworkConfigList, rt: &RuntimeConf) -> Result<CniResult> {
            if self.fail_add.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::failed("cni add failed"));
            }

            self.added.lock().push((config.clone(), rt.clone()));

            Ok(CniResult { ips: Vec::new(), dns_servers: self.dns_servers.lock().clone() })
        }

        async fn delete_network_list(&self, _config: &NetworkConfigList, rt: &RuntimeConf) -> Result<()> {
            self.deleted.lock().push(rt.container_id.clone());

            Ok(())
        }

        async fn cached_network_list(&self, network_name: &str, rt: &RuntimeConf) -> Result<NetworkConfigList> {
            let added = self.added.lock();

            added
                .iter()
                .rev()
                .find(|(config, added_rt)| config.name == network_name && added_rt.container_id == rt.container_id)
                .map(|(config, _)| config.clone())
                .ok_or_else(|| Error::not_found("no cached config"))
        }
    }

    #[derive(Default)]
    struct StubNetns {
        namespaces: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NetnsManager for StubNetns {
        async fn create_namespace(&self, instance_id: &str) -> Result<()> {
            self.namespaces.lock().push(instance_id.to_string());

            Ok(())
        }

        async fn delete_namespace(&self, instance_id: &str) -> Result<()> {
            self.namespaces.lock().retain(|id| id != instance_id);

            Ok(())
        }

        fn namespace_path(&self, instance_id: &str) -> PathBuf {
            PathBuf::from("/run/netns").join(instance_id)
        }
    }

    #[derive(Default)]
    struct StubNetIf {
        links: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InterfaceManager for StubNetIf {
        async fn create_bridge(&self, name: &str, _ip: &str, _subnet: &str) -> Result<()> {
            self.links.lock().push(name.to_string());

            Ok(())
        }

        async fn create_vlan(&self, name: &str, _vlan_id: u64) -> Result<()> {
            self.links.lock().push(name.to_string());

            Ok(())
        }

        async fn set_master(&self, _link: &str, _master: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_link(&self, name: &str) -> Result<()> {
            self.links.lock().retain(|link| link != name);

            Ok(())
        }
    }

    struct NullCounter;

    #[async_trait]
    impl TrafficCounter for NullCounter {
        async fn chain_bytes(&self, _chain: &str) -> Result<u64> {
            Ok(0)
        }
    }

    struct Fixture {
        manager: NetworkManager,
        cni: Arc<StubCni>,
        netns: Arc<StubNetns>,
        netif: Arc<StubNetIf>,
        dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
        let cni = Arc::new(StubCni::default());
        let netns = Arc::new(StubNetns::default());
        let netif = Arc::new(StubNetIf::default());
        let traffic = TrafficMonitor::new(storage.clone(), Arc::new(NullCounter), std::time::Duration::from_secs(60));

        let manager = NetworkManager::new(
            dir.path(),
            storage,
            cni.clone(),
            netns.clone(),
            netif.clone(),
            traffic,
        )
        .await
        .unwrap();

        Fixture { manager, cni, netns, netif, dir }
    }

    fn network_params(network_id: &str) -> NetworkParameters {
        NetworkParameters {
            network_id: network_id.to_string(),
            subnet: "10.0.0.0/24".to_string(),
            ip: "10.0.0.1".to_string(),
            vlan_id: 100,
            dns_servers: Vec::new(),
            firewall_rules: Vec::new(),
        }
    }

    fn instance_params(fixture: &Fixture, service: &str, index: u64, ip: &str, hostname: &str) -> InstanceNetworkParams {
        InstanceNetworkParams {
            ident: InstanceIdent {
                service_id: service.to_string(),
                subject_id: "subject1".to_string(),
                instance: index,
            },
            network: NetworkParameters { ip: ip.to_string(), subnet: "10.0.0.0/24".to_string(), ..Default::default() },
            hostname: hostname.to_string(),
            hosts_file_path: Some(fixture.dir.path().join(format!("hosts-{service}-{index}"))),
            resolv_conf_file_path: Some(fixture.dir.path().join(format!("resolv-{service}-{index}"))),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn update_networks_creates_and_removes() {
        let fixture = fixture().await;

        fixture.manager.update_networks(&[network_params("net1")]).await.unwrap();

        {
            let links = fixture.netif.links.lock();
            assert!(links.iter().any(|link| link == "br-net1"));
            assert!(links.iter().any(|link| link.starts_with(VLAN_IF_PREFIX)));
        }

        // Unchanged network is kept on a second update.
        fixture.manager.update_networks(&[network_params("net1")]).await.unwrap();
        assert_eq!(fixture.netif.links.lock().len(), 2);

        // Gateway change recreates the network.
        let mut changed = network_params("net1");
        changed.ip = "10.0.0.254".to_string();
        fixture.manager.update_networks(&[changed]).await.unwrap();

        let state = fixture.manager.state.lock().await;
        assert_eq!(state.providers["net1"].ip, "10.0.0.254");
        drop(state);

        fixture.manager.update_networks(&[]).await.unwrap();
        assert!(fixture.netif.links.lock().is_empty());
    }

    #[tokio::test]
    async fn add_remove_instance_roundtrip() {
        let fixture = fixture().await;
        fixture.manager.update_networks(&[network_params("net1")]).await.unwrap();

        let params = instance_params(&fixture, "service1", 0, "10.0.0.2", "hostA");

        fixture.manager.add_instance_to_network("instance0", "net1", &params).await.unwrap();

        assert_eq!(fixture.manager.instance_ip("instance0", "net1").await.unwrap(), "10.0.0.2");

        let err = fixture
            .manager
            .add_instance_to_network("instance0", "net1", &params)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExist);

        // The bridge plugin pins the IPAM range to the instance IP.
        {
            let added = fixture.cni.added.lock();
            let bridge = added[0].0.bridge.as_ref().unwrap();
            assert_eq!(bridge.ipam.range.range_start, "10.0.0.2");
            assert_eq!(bridge.ipam.range.range_end, "10.0.0.2");
            assert_eq!(bridge.ipam.range.gateway, "10.0.0.1");
            assert_eq!(added[0].1.hosts, vec![
                "hostA".to_string(),
                "hostA.net1".to_string(),
                "0.subject1.service1".to_string(),
                "subject1.service1".to_string(),
            ]);
        }

        fixture.manager.remove_instance_from_network("instance0", "net1").await.unwrap();

        assert!(fixture.manager.instance_ip("instance0", "net1").await.is_err());
        assert!(fixture.netns.namespaces.lock().is_empty());
        // Provider network stays up while it is in the desired state.
        assert!(fixture.netif.links.lock().iter().any(|link| link == "br-net1"));
    }

    #[tokio::test]
    async fn ip_reuse_after_removal() {
        let fixture = fixture().await;
        fixture.manager.update_networks(&[network_params("net1")]).await.unwrap();

        let params_a = instance_params(&fixture, "serviceA", 0, "10.0.0.2", "hostnameA");
        fixture.manager.add_instance_to_network("instanceA", "net1", &params_a).await.unwrap();
        fixture.manager.remove_instance_from_network("instanceA", "net1").await.unwrap();

        let params_b = instance_params(&fixture, "serviceB", 0, "10.0.0.2", "hostnameB");
        fixture.manager.add_instance_to_network("instanceB", "net1", &params_b).await.unwrap();

        let hosts = std::fs::read_to_string(params_b.hosts_file_path.as_ref().unwrap()).unwrap();
        let matching: Vec<&str> = hosts.lines().filter(|line| line.starts_with("10.0.0.2")).collect();

        assert_eq!(matching, vec!["10.0.0.2\tnet1 hostnameB"]);
    }

    #[tokio::test]
    async fn hostname_collision_fails() {
        let fixture = fixture().await;
        fixture.manager.update_networks(&[network_params("net1")]).await.unwrap();

        let params_a = instance_params(&fixture, "serviceA", 0, "10.0.0.2", "shared");
        fixture.manager.add_instance_to_network("instanceA", "net1", &params_a).await.unwrap();

        let params_b = instance_params(&fixture, "serviceB", 0, "10.0.0.3", "shared");
        let err = fixture
            .manager
            .add_instance_to_network("instanceB", "net1", &params_b)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AlreadyExist);

        // Rollback left no trace of instanceB.
        assert_eq!(fixture.netns.namespaces.lock().len(), 1);
        let state = fixture.manager.state.lock().await;
        assert!(!state.networks["net1"].contains_key("instanceB"));
    }

    #[tokio::test]
    async fn cni_failure_rolls_back() {
        let fixture = fixture().await;
        fixture.manager.update_networks(&[network_params("net1")]).await.unwrap();

        fixture.cni.fail_add.store(true, std::sync::atomic::Ordering::SeqCst);

        let params = instance_params(&fixture, "serviceA", 0, "10.0.0.2", "hostA");
        let err = fixture
            .manager
            .add_instance_to_network("instanceA", "net1", &params)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Failed);
        assert!(fixture.netns.namespaces.lock().is_empty());

        let state = fixture.manager.state.lock().await;
        assert!(!state.networks.contains_key("net1") || !state.networks["net1"].contains_key("instanceA"));
    }

    #[tokio::test]
    async fn last_instance_clears_unprovisioned_network() {
        let fixture = fixture().await;

        // "ghost" was never in the desired provider set: the manager creates
        // no bridge for it, but instances may still join.
        let params = instance_params(&fixture, "serviceA", 0, "10.0.0.2", "hostA");
        fixture.manager.add_instance_to_network("instanceA", "ghost", &params).await.unwrap();

        fixture.manager.remove_instance_from_network("instanceA", "ghost").await.unwrap();

        let state = fixture.manager.state.lock().await;
        assert!(!state.networks.contains_key("ghost"));
    }

    #[tokio::test]
    async fn resolv_conf_fallback_and_params_servers() {
        let fixture = fixture().await;
        fixture.manager.update_networks(&[network_params("net1")]).await.unwrap();

        let mut params = instance_params(&fixture, "serviceA", 0, "10.0.0.2", "hostA");
        params.network.dns_servers = vec!["1.1.1.1".to_string()];

        fixture.manager.add_instance_to_network("instanceA", "net1", &params).await.unwrap();

        let resolv = std::fs::read_to_string(params.resolv_conf_file_path.as_ref().unwrap()).unwrap();
        assert_eq!(resolv, "nameserver\t8.8.8.8\nnameserver\t1.1.1.1\n");
    }
}
