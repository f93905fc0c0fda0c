//! Workload → network binding translation
//!
//! [`Translator::translate`] is a pure function: the same endpoint and the
//! same configuration always produce the same intent sequence, in the same
//! order, so serialized intents are byte-identical across calls.

use crate::config::TranslatorConfig;
use crate::error::{Error, Result};
use crate::model::{BindingIntent, NetworkBinding, WorkloadEndpoint, WorkloadKind};
use std::collections::BTreeSet;

/// Outcome of translating one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    /// The endpoint can be bound with these intents
    Ready(Vec<BindingIntent>),
    /// Not enough information yet (no IP, not running); nothing to bind
    Deferred { missing: String },
}

/// Maps workload endpoints to binding intents
#[derive(Debug, Clone, Default)]
pub struct Translator {
    config: TranslatorConfig,
}

impl Translator {
    pub fn new(config: TranslatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// Translate one endpoint
    ///
    /// # Errors
    ///
    /// `Error::Translation` when the endpoint is malformed: empty or
    /// slash-containing name/namespace, malformed MAC, an IPv6 address on an
    /// IPv4-only network, or an invalid policy name.
    pub fn translate(&self, endpoint: &WorkloadEndpoint) -> Result<Translation> {
        let id = &endpoint.id;
        validate_segment(endpoint, "namespace", &id.namespace)?;
        validate_segment(endpoint, "name", &id.name)?;

        if let Some(mac) = &endpoint.mac_address {
            if !is_valid_mac(mac) {
                return Err(Error::translation(
                    id,
                    format!("malformed MAC address '{}'", mac),
                ));
            }
        }

        if !endpoint.is_active() {
            return Ok(Translation::Deferred {
                missing: format!("phase is {:?}", endpoint.phase),
            });
        }

        let Some(ip_address) = endpoint.ip_address else {
            return Ok(Translation::Deferred {
                missing: "ip-address".to_string(),
            });
        };

        if self.config.ipv4_only && ip_address.is_ipv6() {
            return Err(Error::translation(
                id,
                format!("IPv6 address {} on an IPv4-only network", ip_address),
            ));
        }

        let port_id = endpoint
            .interface_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}-{}", id.kind, id.namespace, id.name));

        let segmentation_id = self
            .config
            .namespace_segments
            .get(&id.namespace)
            .copied()
            .unwrap_or(self.config.segmentation_id);

        let mut intents = vec![
            BindingIntent::Port {
                port_id,
                mac_address: endpoint.mac_address.as_ref().map(|m| m.to_ascii_lowercase()),
                node: endpoint.node.clone(),
            },
            BindingIntent::Address {
                ip_address,
                network_id: self.config.network_id.clone(),
                network_type: self.config.network_type,
                segmentation_id,
            },
        ];

        // Nodes register themselves instead of attaching policies
        if id.kind == WorkloadKind::Node {
            intents.push(BindingIntent::NodeInfo {
                uid: endpoint.uid.clone(),
                hostname: endpoint.node.clone().unwrap_or_else(|| id.name.clone()),
                internal_ip_address: ip_address,
                external_ip_address: endpoint.external_ip,
            });
            return Ok(Translation::Ready(intents));
        }

        for name in self.policies(endpoint)? {
            intents.push(BindingIntent::Policy { name });
        }

        Ok(Translation::Ready(intents))
    }

    /// Translate and assemble the binding in one step
    ///
    /// Returns `Ok(None)` for deferred endpoints.
    pub fn binding_for(&self, endpoint: &WorkloadEndpoint) -> Result<Option<NetworkBinding>> {
        match self.translate(endpoint)? {
            Translation::Ready(intents) => {
                Ok(Some(NetworkBinding::from_intents(&endpoint.id, &intents)?))
            }
            Translation::Deferred { .. } => Ok(None),
        }
    }

    fn policies(&self, endpoint: &WorkloadEndpoint) -> Result<BTreeSet<String>> {
        let mut policies = BTreeSet::new();

        if let Some(value) = endpoint.labels.get(&self.config.policy_label) {
            for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if !is_valid_policy_name(name) {
                    return Err(Error::translation(
                        &endpoint.id,
                        format!("invalid policy name '{}'", name),
                    ));
                }
                policies.insert(name.to_string());
            }
        }

        if self.config.isolate_namespaces {
            policies.insert(format!("isolate-{}", endpoint.id.namespace));
        }

        Ok(policies)
    }
}

fn validate_segment(endpoint: &WorkloadEndpoint, what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::translation(&endpoint.id, format!("empty {}", what)));
    }
    if value.contains('/') {
        return Err(Error::translation(
            &endpoint.id,
            format!("{} '{}' contains '/'", what, value),
        ));
    }
    Ok(())
}

/// Six colon-separated hex octets
fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_valid_policy_name(name: &str) -> bool {
    name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EndpointId, EndpointPhase, NetworkType};

    fn pod() -> WorkloadEndpoint {
        WorkloadEndpoint::active(EndpointId::pod("a", "w1")).with_ip("10.0.0.5".parse().unwrap())
    }

    #[test]
    fn missing_ip_is_deferred() {
        let translator = Translator::default();
        let endpoint = WorkloadEndpoint::active(EndpointId::pod("a", "w1"));

        assert!(matches!(
            translator.translate(&endpoint).unwrap(),
            Translation::Deferred { .. }
        ));
    }

    #[test]
    fn non_active_phase_is_deferred() {
        let translator = Translator::default();
        let endpoint = pod().with_phase(EndpointPhase::Pending);

        assert!(translator.binding_for(&endpoint).unwrap().is_none());
    }

    #[test]
    fn default_binding_is_flat_zero_network() {
        let binding = Translator::default().binding_for(&pod()).unwrap().unwrap();

        assert_eq!(binding.port_id, "pod-a-w1");
        assert_eq!(binding.network_type, NetworkType::Flat);
        assert_eq!(binding.network_id, "00000000-0000-0000-0000-000000000000");
        assert_eq!(binding.segmentation_id, 0);
        assert!(binding.policies.is_empty());
    }

    #[test]
    fn interface_id_becomes_port_id() {
        let endpoint = pod().with_interface("tap0a1b");
        let binding = Translator::default().binding_for(&endpoint).unwrap().unwrap();

        assert_eq!(binding.port_id, "tap0a1b");
    }

    #[test]
    fn namespace_segment_overrides_default() {
        let mut config = TranslatorConfig {
            network_type: NetworkType::Vxlan,
            segmentation_id: 100,
            ..TranslatorConfig::default()
        };
        config.namespace_segments.insert("a".to_string(), 2001);

        let binding = Translator::new(config).binding_for(&pod()).unwrap().unwrap();
        assert_eq!(binding.segmentation_id, 2001);
    }

    #[test]
    fn policies_are_sorted_and_deduplicated() {
        let config = TranslatorConfig {
            isolate_namespaces: true,
            ..TranslatorConfig::default()
        };
        let endpoint = pod().with_label("coe.opendaylight.org/policies", "web, db,web");

        let binding = Translator::new(config).binding_for(&endpoint).unwrap().unwrap();
        let names: Vec<_> = binding.policies.iter().cloned().collect();
        assert_eq!(names, vec!["db", "isolate-a", "web"]);
    }

    #[test]
    fn translation_is_deterministic() {
        let config = TranslatorConfig {
            isolate_namespaces: true,
            ..TranslatorConfig::default()
        };
        let translator = Translator::new(config);
        let endpoint = pod()
            .with_mac("0A:58:0A:00:00:05")
            .with_node("node-1")
            .with_label("coe.opendaylight.org/policies", "z,a,m");

        let first = serde_json::to_vec(&translator.translate(&endpoint).unwrap_ready()).unwrap();
        for _ in 0..10 {
            let again =
                serde_json::to_vec(&translator.translate(&endpoint).unwrap_ready()).unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn node_translates_to_node_info() {
        let config = TranslatorConfig {
            isolate_namespaces: true,
            ..TranslatorConfig::default()
        };
        let node = WorkloadEndpoint::active(EndpointId::node("worker-1"))
            .with_uid("uid-n1")
            .with_ip("192.168.0.11".parse().unwrap())
            .with_external_ip("203.0.113.7".parse().unwrap());

        let binding = Translator::new(config).binding_for(&node).unwrap().unwrap();
        assert_eq!(binding.port_id, "node-cluster-worker-1");
        assert!(binding.policies.is_empty());

        let info = binding.node_info.unwrap();
        assert_eq!(info.uid.as_deref(), Some("uid-n1"));
        assert_eq!(info.hostname, "worker-1");
        assert_eq!(info.internal_ip_address, "192.168.0.11".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(info.external_ip_address, Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn node_without_internal_ip_is_deferred() {
        let node = WorkloadEndpoint::active(EndpointId::node("worker-1")).with_node("w1.local");
        assert!(Translator::default().binding_for(&node).unwrap().is_none());
    }

    #[test]
    fn pods_carry_no_node_info() {
        let binding = Translator::default().binding_for(&pod()).unwrap().unwrap();
        assert!(binding.node_info.is_none());
    }

    #[test]
    fn malformed_input_is_a_translation_error() {
        let translator = Translator::new(TranslatorConfig {
            ipv4_only: true,
            ..TranslatorConfig::default()
        });

        let cases = vec![
            WorkloadEndpoint::active(EndpointId::pod("a", "")),
            WorkloadEndpoint::active(EndpointId::pod("a/b", "w1")),
            pod().with_mac("not-a-mac"),
            pod().with_ip("fd00::5".parse().unwrap()),
            pod().with_label("coe.opendaylight.org/policies", "bad policy"),
        ];

        for endpoint in cases {
            let err = translator.translate(&endpoint).unwrap_err();
            assert!(matches!(err, Error::Translation { .. }), "{:?}", endpoint);
        }
    }

    trait UnwrapReady {
        fn unwrap_ready(self) -> Vec<BindingIntent>;
    }

    impl UnwrapReady for Translation {
        fn unwrap_ready(self) -> Vec<BindingIntent> {
            match self {
                Translation::Ready(intents) => intents,
                other => panic!("expected ready translation, got {:?}", other),
            }
        }
    }

    impl UnwrapReady for Result<Translation> {
        fn unwrap_ready(self) -> Vec<BindingIntent> {
            self.unwrap().unwrap_ready()
        }
    }
}
