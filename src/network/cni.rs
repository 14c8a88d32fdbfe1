//! CNI configuration documents handed to the pluggable CNI back-end.
//!
//! The service manager builds one `NetworkConfigList` per instance out of
//! four plugins (bridge, aos-firewall, bandwidth, dnsname) and a runtime
//! configuration carrying the netns, args and the hosts capability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;

pub const CNI_VERSION: &str = "0.4.0";
pub const INSTANCE_INTERFACE_NAME: &str = "eth0";
pub const BRIDGE_PREFIX: &str = "br-";
pub const ADMIN_CHAIN_PREFIX: &str = "INSTANCE_";

/// Ingress/egress burst in bits used by the bandwidth plugin.
pub const BANDWIDTH_BURST: u64 = 12_800;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub dst: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamRange {
    pub range_start: String,
    pub range_end: String,
    pub subnet: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub gateway: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConfig {
    #[serde(rename = "type")]
    pub ipam_type: String,
    pub data_dir: String,
    #[serde(flatten)]
    pub range: IpamRange,
    pub routes: Vec<Router>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgePluginConf {
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub bridge: String,
    pub is_gateway: bool,
    #[serde(rename = "ipMasq")]
    pub ip_masq: bool,
    pub hairpin_mode: bool,
    pub ipam: IpamConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputAccessRule {
    pub port: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputAccessRule {
    pub dst_ip: String,
    pub dst_port: String,
    pub proto: String,
    pub src_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallPluginConf {
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub uuid: String,
    pub iptables_admin_chain_name: String,
    pub allow_public_connections: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub input_access: Vec<InputAccessRule>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub output_access: Vec<OutputAccessRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthPluginConf {
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ingress_rate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ingress_burst: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub egress_rate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub egress_burst: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsPluginCapabilities {
    pub aliases: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsPluginConf {
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub multi_domain: bool,
    pub domain_name: String,
    pub capabilities: DnsPluginCapabilities,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub remote_servers: Vec<String>,
}

/// Ordered plugin list for one provider network, serialized as a CNI
/// conflist document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkConfigList {
    pub name: String,
    pub version: String,
    pub bridge: Option<BridgePluginConf>,
    pub firewall: Option<FirewallPluginConf>,
    pub bandwidth: Option<BandwidthPluginConf>,
    pub dns: Option<DnsPluginConf>,
}

impl NetworkConfigList {
    /// CNI conflist document: `{name, cniVersion, plugins: [...]}` with the
    /// plugins in bridge, firewall, bandwidth, dnsname order.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        let mut plugins = Vec::new();

        if let Some(bridge) = &self.bridge {
            plugins.push(serde_json::to_value(bridge)?);
        }

        if let Some(firewall) = &self.firewall {
            plugins.push(serde_json::to_value(firewall)?);
        }

        if let Some(bandwidth) = &self.bandwidth {
            plugins.push(serde_json::to_value(bandwidth)?);
        }

        if let Some(dns) = &self.dns {
            plugins.push(serde_json::to_value(dns)?);
        }

        Ok(json!({
            "name": self.name,
            "cniVersion": self.version,
            "plugins": plugins,
        }))
    }
}

/// Runtime configuration accompanying every CNI invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConf {
    pub container_id: String,
    pub netns_path: String,
    pub if_name: String,
    pub args: Vec<(String, String)>,
    pub hosts: Vec<String>,
}

/// Subset of the CNI result the manager consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CniResult {
    pub ips: Vec<String>,
    pub dns_servers: Vec<String>,
}

/// Pluggable CNI back-end.
#[async_trait]
pub trait Cni: Send + Sync {
    async fn add_network_list(&self, config: &NetworkConfigList, rt: &RuntimeConf) -> Result<CniResult>;

    async fn delete_network_list(&self, config: &NetworkConfigList, rt: &RuntimeConf) -> Result<()>;

    /// Returns the config list cached by a former add for `network_name`.
    async fn cached_network_list(&self, network_name: &str, rt: &RuntimeConf) -> Result<NetworkConfigList>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflist_document_shape() {
        let config = NetworkConfigList {
            name: "provider1".to_string(),
            version: CNI_VERSION.to_string(),
            bridge: Some(BridgePluginConf {
                plugin_type: "bridge".to_string(),
                bridge: "br-provider1".to_string(),
                is_gateway: true,
                ip_masq: true,
                hairpin_mode: true,
                ipam: IpamConfig {
                    ipam_type: "host-local".to_string(),
                    data_dir: "/var/edged/cni/networks".to_string(),
                    range: IpamRange {
                        range_start: "10.0.0.2".to_string(),
                        range_end: "10.0.0.2".to_string(),
                        subnet: "10.0.0.0/24".to_string(),
                        gateway: "10.0.0.1".to_string(),
                    },
                    routes: vec![Router { dst: "0.0.0.0/0".to_string() }],
                },
            }),
            firewall: Some(FirewallPluginConf {
                plugin_type: "aos-firewall".to_string(),
                uuid: "instance0".to_string(),
                iptables_admin_chain_name: "INSTANCE_instance0".to_string(),
                allow_public_connections: true,
                input_access: vec![InputAccessRule { port: "8080".to_string(), protocol: "tcp".to_string() }],
                output_access: Vec::new(),
            }),
            bandwidth: None,
            dns: Some(DnsPluginConf {
                plugin_type: "dnsname".to_string(),
                multi_domain: true,
                domain_name: "provider1".to_string(),
                capabilities: DnsPluginCapabilities { aliases: true },
                remote_servers: Vec::new(),
            }),
        };

        let value = config.to_value().unwrap();

        assert_eq!(value["cniVersion"], CNI_VERSION);
        assert_eq!(value["name"], "provider1");

        let plugins = value["plugins"].as_array().unwrap();
        assert_eq!(plugins.len(), 3);
        assert_eq!(plugins[0]["type"], "bridge");
        assert_eq!(plugins[0]["ipam"]["rangeStart"], "10.0.0.2");
        assert_eq!(plugins[0]["ipam"]["routes"][0]["dst"], "0.0.0.0/0");
        assert_eq!(plugins[1]["type"], "aos-firewall");
        assert_eq!(plugins[1]["inputAccess"][0]["port"], "8080");
        assert_eq!(plugins[2]["type"], "dnsname");
    }
}
