//! Declarative topology configuration.
//!
//! A topology file describes the emulated deployment: hosts (with their
//! interfaces, bridges, routes, forwarding rules, and applications) and
//! the wiring between host/interface pairs. Files are accepted as JSON
//! or TOML, chosen by extension.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ip::Cidr;

/// Root of a topology description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub hosts: Vec<HostDef>,
    #[serde(default)]
    pub wiring: Vec<WiringDef>,
}

/// Execution context for a host: the root OS, or a named network
/// namespace created for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    Root,
    Netns,
}

impl Default for HostKind {
    fn default() -> Self {
        HostKind::Netns
    }
}

/// One emulated machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDef {
    pub name: String,
    #[serde(default)]
    pub kind: HostKind,
    /// Bring-up priority: lower starts earlier. Hosts with equal priority
    /// start in declaration order.
    #[serde(default)]
    pub start_priority: u32,
    #[serde(default)]
    pub bridges: Vec<BridgeDef>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceDef>,
    #[serde(default)]
    pub ip_forward_rules: Vec<IpForwardDef>,
    #[serde(default)]
    pub route_rules: Vec<RouteDef>,
    #[serde(default)]
    pub applications: Vec<ApplicationDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDef {
    pub name: String,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<Cidr>,
    #[serde(default)]
    pub linked_bridge: Option<String>,
    #[serde(default)]
    pub vlans: Vec<VlanDef>,
}

/// An 802.1Q sub-interface (`<parent>.<id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlanDef {
    pub id: u16,
    #[serde(default)]
    pub ip_addresses: Vec<Cidr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeDef {
    pub name: String,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<Cidr>,
    /// Free-form bridge options; `stp` enables spanning tree.
    #[serde(default)]
    pub options: Vec<String>,
}

/// A NAT/forwarding rule pair: MASQUERADE out of `exterior`, ACCEPT
/// between `interior` and `exterior`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpForwardDef {
    pub exterior: String,
    pub interior: String,
}

/// A static route. At least one of `gateway` and `device` must be set;
/// this is validated when the route is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDef {
    /// Destination in CIDR form, or the literal `default`.
    pub dest: String,
    #[serde(default)]
    pub gateway: Option<Cidr>,
    #[serde(default)]
    pub device: Option<String>,
}

/// The fixed, enumerable set of application types. Selection happens via
/// this tag, not via runtime class resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    /// A coordination/quorum service probed for readiness over TCP.
    Coordinator,
    /// A per-hypervisor network agent probed for readiness via pidfile.
    Agent,
}

impl AppKind {
    /// Whether a host may run more than one application of this kind.
    pub fn multi_allowed(self) -> bool {
        false
    }
}

impl std::fmt::Display for AppKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppKind::Coordinator => write!(f, "coordinator"),
            AppKind::Agent => write!(f, "agent"),
        }
    }
}

/// An application to run on a host, with free-form options consumed by
/// that application kind's `configure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationDef {
    pub kind: AppKind,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

/// A veth link: `host`/`interface` is the near end, `far_host`/
/// `far_interface` the identity the peer end assumes in the far host's
/// namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WiringDef {
    pub host: String,
    pub interface: String,
    pub far_host: String,
    pub far_interface: String,
}

impl TopologyConfig {
    /// Load a topology description from a JSON or TOML file.
    pub fn load(path: &Path) -> Result<TopologyConfig> {
        let text = fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match ext {
            "json" => serde_json::from_str(&text).map_err(|e| {
                Error::Configuration(format!("{}: {}", path.display(), e))
            }),
            "toml" => toml::from_str(&text).map_err(|e| {
                Error::Configuration(format!("{}: {}", path.display(), e))
            }),
            other => Err(Error::Configuration(format!(
                "unsupported topology file extension `{other}` (expected json or toml)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_topology() {
        let text = r#"
            [[hosts]]
            name = "root"
            kind = "root"

            [[hosts.bridges]]
            name = "br0"
            ip_addresses = ["10.0.0.240/24"]
            options = ["stp"]

            [[hosts.interfaces]]
            name = "zoo1eth0"
            linked_bridge = "br0"

            [[hosts]]
            name = "zoo1"
            start_priority = 10

            [[hosts.interfaces]]
            name = "eth0"
            ip_addresses = ["10.0.0.2/24"]

            [[hosts.applications]]
            kind = "coordinator"
            options = { id = "1", port = 2181 }

            [[wiring]]
            host = "root"
            interface = "zoo1eth0"
            far_host = "zoo1"
            far_interface = "eth0"
        "#;
        let cfg: TopologyConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.hosts.len(), 2);
        assert_eq!(cfg.hosts[0].kind, HostKind::Root);
        assert_eq!(cfg.hosts[1].kind, HostKind::Netns);
        assert_eq!(cfg.hosts[0].bridges[0].options, vec!["stp"]);
        assert_eq!(
            cfg.hosts[1].applications[0].kind,
            AppKind::Coordinator
        );
        assert_eq!(cfg.wiring.len(), 1);
        assert_eq!(cfg.wiring[0].far_interface, "eth0");
    }

    #[test]
    fn parses_json_topology() {
        let text = r#"{
            "hosts": [
                {
                    "name": "edge1",
                    "interfaces": [
                        {"name": "eth0", "ip_addresses": ["172.16.2.1/24"]}
                    ],
                    "route_rules": [
                        {"dest": "default", "gateway": "172.16.2.254"}
                    ],
                    "ip_forward_rules": [
                        {"exterior": "eth0", "interior": "eth1"}
                    ]
                }
            ]
        }"#;
        let cfg: TopologyConfig = serde_json::from_str(text).unwrap();
        assert_eq!(cfg.hosts[0].route_rules[0].dest, "default");
        assert_eq!(
            cfg.hosts[0].route_rules[0].gateway.unwrap().to_string(),
            "172.16.2.254/32"
        );
        assert!(cfg.wiring.is_empty());
    }

    #[test]
    fn unknown_app_kind_is_rejected() {
        let text = r#"{"hosts": [{"name": "h", "applications": [{"kind": "mystery"}]}]}"#;
        assert!(serde_json::from_str::<TopologyConfig>(text).is_err());
    }
}
