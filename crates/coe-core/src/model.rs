//! Workload and network binding model
//!
//! Orchestration-side entities ([`WorkloadEndpoint`]) and their network-side
//! realization ([`NetworkBinding`]). Field names on the network side follow
//! the kebab-case naming of the controller's `coe` data model
//! (`ip-address`, `network-id`, `segmentation-id`, ...).

use crate::error::{Error, Result};
use crate::traits::datastore::DataPath;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

/// Kind of orchestration workload an endpoint represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Pod,
    Service,
    /// Cluster node, registered with the controller as node info
    Node,
}

impl WorkloadKind {
    /// Path segment / display name
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Pod => "pod",
            WorkloadKind::Service => "service",
            WorkloadKind::Node => "node",
        }
    }

    /// Parse a path segment back into a kind
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "pod" => Some(WorkloadKind::Pod),
            "service" => Some(WorkloadKind::Service),
            "node" => Some(WorkloadKind::Node),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace placeholder for cluster-scoped objects (nodes)
pub const CLUSTER_NAMESPACE: &str = "cluster";

/// Identity of a workload endpoint
///
/// The kind is part of the identity so a pod and a service with the same
/// name in one namespace map to distinct entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl EndpointId {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of a pod
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(WorkloadKind::Pod, namespace, name)
    }

    /// Identity of a service
    pub fn service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(WorkloadKind::Service, namespace, name)
    }

    /// Identity of a cluster node
    pub fn node(name: impl Into<String>) -> Self {
        Self::new(WorkloadKind::Node, CLUSTER_NAMESPACE, name)
    }

    /// Datastore path of this endpoint's binding under `root`
    ///
    /// Layout: `<root>/<kind>/<namespace>/<name>`
    pub fn binding_path(&self, root: &DataPath) -> DataPath {
        root.child(self.kind.as_str())
            .child(&self.namespace)
            .child(&self.name)
    }

    /// Recover the identity from a binding path, if `path` is one
    pub fn from_binding_path(root: &DataPath, path: &DataPath) -> Option<Self> {
        match path.relative_to(root)?.as_slice() {
            [kind, namespace, name] => Some(Self::new(
                WorkloadKind::parse(kind)?,
                *namespace,
                *name,
            )),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Lifecycle phase reported by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointPhase {
    Pending,
    Active,
    Terminating,
    Deleted,
}

impl EndpointPhase {
    /// Endpoints in these phases must not keep a network binding
    pub fn is_terminal(&self) -> bool {
        matches!(self, EndpointPhase::Terminating | EndpointPhase::Deleted)
    }
}

/// Orchestration-side workload with its network attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkloadEndpoint {
    pub id: EndpointId,

    /// Orchestrator-assigned unique id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    pub phase: EndpointPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_id: Option<String>,

    /// Node hosting the workload (the hostname, for a node itself)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Externally reachable address (nodes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl WorkloadEndpoint {
    /// Create an endpoint in the `Pending` phase with no network attributes
    pub fn new(id: EndpointId) -> Self {
        Self {
            id,
            uid: None,
            phase: EndpointPhase::Pending,
            ip_address: None,
            mac_address: None,
            interface_id: None,
            node: None,
            external_ip: None,
            labels: BTreeMap::new(),
        }
    }

    /// Create an `Active` endpoint
    pub fn active(id: EndpointId) -> Self {
        Self::new(id).with_phase(EndpointPhase::Active)
    }

    pub fn with_phase(mut self, phase: EndpointPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = Some(mac.into());
        self
    }

    pub fn with_interface(mut self, interface_id: impl Into<String>) -> Self {
        self.interface_id = Some(interface_id.into());
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_external_ip(mut self, ip: IpAddr) -> Self {
        self.external_ip = Some(ip);
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.phase == EndpointPhase::Active
    }
}

/// Overlay network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkType {
    Flat,
    Vlan,
    Vxlan,
}

impl NetworkType {
    /// Largest segmentation id valid for this network type
    pub fn max_segmentation_id(&self) -> u32 {
        match self {
            NetworkType::Flat => 0,
            NetworkType::Vlan => 4094,
            NetworkType::Vxlan => 16_777_215,
        }
    }
}

/// One network-side entity derived from a workload endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "intent",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum BindingIntent {
    /// Overlay port for the workload interface
    Port {
        port_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mac_address: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<String>,
    },

    /// Address binding on a network segment
    Address {
        ip_address: IpAddr,
        network_id: String,
        network_type: NetworkType,
        segmentation_id: u32,
    },

    /// Policy attached to the port
    Policy { name: String },

    /// Node registration
    NodeInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
        hostname: String,
        internal_ip_address: IpAddr,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_ip_address: Option<IpAddr>,
    },
}

/// Node-info record carried by the binding of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub hostname: String,
    pub internal_ip_address: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip_address: Option<IpAddr>,
}

/// Network-side realization of a workload endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkBinding {
    pub endpoint: EndpointId,
    pub port_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub ip_address: IpAddr,
    pub network_id: String,
    pub network_type: NetworkType,
    pub segmentation_id: u32,
    #[serde(default)]
    pub policies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_info: Option<NodeInfo>,
}

impl NetworkBinding {
    /// Assemble a binding from translated intents
    ///
    /// Exactly one `Port` and one `Address` intent are required; policies
    /// are optional and accumulate. At most one `NodeInfo` is allowed.
    pub fn from_intents(endpoint: &EndpointId, intents: &[BindingIntent]) -> Result<Self> {
        let mut port = None;
        let mut address = None;
        let mut policies = BTreeSet::new();
        let mut node_info = None;

        for intent in intents {
            match intent {
                BindingIntent::Port { .. } if port.is_some() => {
                    return Err(Error::translation(endpoint, "more than one port intent"));
                }
                BindingIntent::Port { .. } => port = Some(intent),
                BindingIntent::Address { .. } if address.is_some() => {
                    return Err(Error::translation(endpoint, "more than one address intent"));
                }
                BindingIntent::Address { .. } => address = Some(intent),
                BindingIntent::Policy { name } => {
                    policies.insert(name.clone());
                }
                BindingIntent::NodeInfo { .. } if node_info.is_some() => {
                    return Err(Error::translation(endpoint, "more than one node-info intent"));
                }
                BindingIntent::NodeInfo {
                    uid,
                    hostname,
                    internal_ip_address,
                    external_ip_address,
                } => {
                    node_info = Some(NodeInfo {
                        uid: uid.clone(),
                        hostname: hostname.clone(),
                        internal_ip_address: *internal_ip_address,
                        external_ip_address: *external_ip_address,
                    });
                }
            }
        }

        match (port, address) {
            (
                Some(BindingIntent::Port {
                    port_id,
                    mac_address,
                    node,
                }),
                Some(BindingIntent::Address {
                    ip_address,
                    network_id,
                    network_type,
                    segmentation_id,
                }),
            ) => Ok(Self {
                endpoint: endpoint.clone(),
                port_id: port_id.clone(),
                mac_address: mac_address.clone(),
                node: node.clone(),
                ip_address: *ip_address,
                network_id: network_id.clone(),
                network_type: *network_type,
                segmentation_id: *segmentation_id,
                policies,
                node_info,
            }),
            _ => Err(Error::translation(
                endpoint,
                "intents must contain one port and one address",
            )),
        }
    }
}

/// Datastore representation of a binding
///
/// The endpoint is stored next to its binding so the mapping table can be
/// rebuilt from the datastore after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBinding {
    pub endpoint: WorkloadEndpoint,
    pub binding: NetworkBinding,
}

impl StoredBinding {
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intents() -> Vec<BindingIntent> {
        vec![
            BindingIntent::Port {
                port_id: "tap1".to_string(),
                mac_address: None,
                node: Some("node-1".to_string()),
            },
            BindingIntent::Address {
                ip_address: "10.0.0.5".parse().unwrap(),
                network_id: "00000000-0000-0000-0000-000000000000".to_string(),
                network_type: NetworkType::Flat,
                segmentation_id: 0,
            },
            BindingIntent::Policy {
                name: "web".to_string(),
            },
        ]
    }

    #[test]
    fn binding_path_roundtrip() {
        let root = DataPath::new("coe/bindings");
        let id = EndpointId::pod("a", "w1");
        let path = id.binding_path(&root);

        assert_eq!(path.as_str(), "coe/bindings/pod/a/w1");
        assert_eq!(EndpointId::from_binding_path(&root, &path), Some(id));
    }

    #[test]
    fn node_identity_is_cluster_scoped() {
        let root = DataPath::new("coe/bindings");
        let id = EndpointId::node("worker-1");
        let path = id.binding_path(&root);

        assert_eq!(path.as_str(), "coe/bindings/node/cluster/worker-1");
        assert_eq!(EndpointId::from_binding_path(&root, &path), Some(id));
    }

    #[test]
    fn foreign_paths_are_not_bindings() {
        let root = DataPath::new("coe/bindings");

        assert_eq!(
            EndpointId::from_binding_path(&root, &DataPath::new("coe/nodes/n1")),
            None
        );
        assert_eq!(
            EndpointId::from_binding_path(&root, &DataPath::new("coe/bindings/vm/a/w1")),
            None
        );
        assert_eq!(
            EndpointId::from_binding_path(&root, &DataPath::new("coe/bindings/pod/a")),
            None
        );
    }

    #[test]
    fn from_intents_assembles_binding() {
        let id = EndpointId::pod("a", "w1");
        let binding = NetworkBinding::from_intents(&id, &intents()).unwrap();

        assert_eq!(binding.port_id, "tap1");
        assert_eq!(binding.ip_address, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(binding.network_type, NetworkType::Flat);
        assert!(binding.policies.contains("web"));
    }

    #[test]
    fn from_intents_requires_address() {
        let id = EndpointId::pod("a", "w1");
        let only_port = vec![intents().remove(0)];

        let err = NetworkBinding::from_intents(&id, &only_port).unwrap_err();
        assert!(matches!(err, Error::Translation { .. }));
    }

    #[test]
    fn intent_wire_names_are_kebab_case() {
        let json = serde_json::to_value(&intents()[1]).unwrap();

        assert_eq!(json["intent"], "address");
        assert_eq!(json["ip-address"], "10.0.0.5");
        assert_eq!(json["network-type"], "FLAT");
        assert_eq!(json["segmentation-id"], 0);
    }

    #[test]
    fn from_intents_carries_node_info() {
        let id = EndpointId::node("worker-1");
        let mut node_intents = intents();
        node_intents.pop();
        node_intents.push(BindingIntent::NodeInfo {
            uid: Some("uid-1".to_string()),
            hostname: "worker-1".to_string(),
            internal_ip_address: "192.168.0.11".parse().unwrap(),
            external_ip_address: None,
        });

        let binding = NetworkBinding::from_intents(&id, &node_intents).unwrap();
        let info = binding.node_info.as_ref().unwrap();
        assert_eq!(info.hostname, "worker-1");
        assert_eq!(info.internal_ip_address, "192.168.0.11".parse::<IpAddr>().unwrap());

        let json = serde_json::to_value(&binding).unwrap();
        assert_eq!(json["node-info"]["internal-ip-address"], "192.168.0.11");
        assert!(json["node-info"].get("external-ip-address").is_none());

        node_intents.push(node_intents[2].clone());
        assert!(NetworkBinding::from_intents(&id, &node_intents).is_err());
    }
}
