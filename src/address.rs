//! Broadcast address resolution.
//!
//! With host-network exposure disabled, members advertise their pod address.
//! With it enabled, they advertise the internal or external address of the
//! node hosting them, as configured on the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::crd::HostPort;
use crate::error::{Error, Result};
use crate::membership::{Member, MembershipView};

pub const TOPOLOGY_ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Addresses and zone of a kubernetes node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
    pub zone: Option<String>,
}

impl HostInfo {
    pub fn from_node(node: &Node) -> Self {
        let addresses = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .cloned()
            .unwrap_or_default();
        let address_of = |kind: &str| {
            addresses
                .iter()
                .find(|a| a.type_ == kind)
                .map(|a| a.address.clone())
        };

        Self {
            internal_ip: address_of("InternalIP"),
            external_ip: address_of("ExternalIP"),
            zone: node.labels().get(TOPOLOGY_ZONE_LABEL).cloned(),
        }
    }
}

/// Maps members to the address other nodes and regions use to reach them.
#[derive(Debug, Clone, Default)]
pub struct AddressResolver {
    host_port: HostPort,
    hosts: BTreeMap<String, HostInfo>,
}

impl AddressResolver {
    pub fn new(host_port: HostPort, hosts: BTreeMap<String, HostInfo>) -> Self {
        Self { host_port, hosts }
    }

    pub fn from_nodes(host_port: HostPort, nodes: &[Node]) -> Self {
        let hosts = nodes
            .iter()
            .map(|n| (n.name_any(), HostInfo::from_node(n)))
            .collect();
        Self::new(host_port, hosts)
    }

    pub fn host_network(&self) -> bool {
        self.host_port.enabled
    }

    /// Broadcast address of a member.
    pub fn resolve(&self, member: &Member) -> Result<String> {
        if !self.host_port.enabled {
            return member
                .pod_ip
                .clone()
                .ok_or_else(|| Error::PodNotScheduled(member.name.clone()));
        }

        let host = self.host(member)?;
        let address = if self.host_port.use_external_host_ip {
            host.external_ip.clone()
        } else {
            host.internal_ip.clone()
        };

        address.ok_or_else(|| {
            Error::ConfigInvariant(format!(
                "node {} of pod {} has no {} address",
                member.node_name.as_deref().unwrap_or_default(),
                member.name,
                if self.host_port.use_external_host_ip { "external" } else { "internal" }
            ))
        })
    }

    /// Zone of the member's host, if known.
    pub fn zone(&self, member: &Member) -> Result<Option<String>> {
        Ok(self.host(member)?.zone.clone())
    }

    fn host(&self, member: &Member) -> Result<&HostInfo> {
        let node_name = member
            .node_name
            .as_deref()
            .ok_or_else(|| Error::PodNotScheduled(member.name.clone()))?;

        // A node missing from the cached list is treated as not yet observed.
        self.hosts
            .get(node_name)
            .ok_or_else(|| Error::PodNotScheduled(format!("{} (node {} unknown)", member.name, node_name)))
    }

    /// Broadcast addresses of every member, keyed by pod name.
    pub fn resolve_all(&self, view: &MembershipView) -> Result<BTreeMap<String, String>> {
        view.members()
            .iter()
            .map(|m| Ok((m.name.clone(), self.resolve(m)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::tests::member;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str, internal: &str, external: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: internal.to_string(),
                    },
                    NodeAddress {
                        type_: "ExternalIP".to_string(),
                        address: external.to_string(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_address() {
        let resolver = AddressResolver::default();
        let m = member("dc1", 0, true, true);
        assert_eq!(resolver.resolve(&m).unwrap(), m.pod_ip.clone().unwrap());

        let unscheduled = Member {
            pod_ip: None,
            ..m
        };
        assert!(matches!(
            resolver.resolve(&unscheduled),
            Err(Error::PodNotScheduled(_))
        ));
    }

    #[test]
    fn test_host_address() {
        let nodes = vec![node("node1", "12.43.22.143", "54.32.141.231")];
        let m = member("dc1", 0, true, true);

        let internal = AddressResolver::from_nodes(
            HostPort {
                enabled: true,
                use_external_host_ip: false,
            },
            &nodes,
        );
        assert_eq!(internal.resolve(&m).unwrap(), "12.43.22.143");

        let external = AddressResolver::from_nodes(
            HostPort {
                enabled: true,
                use_external_host_ip: true,
            },
            &nodes,
        );
        assert_eq!(external.resolve(&m).unwrap(), "54.32.141.231");

        let no_node = Member {
            node_name: None,
            ..m
        };
        assert!(matches!(external.resolve(&no_node), Err(Error::PodNotScheduled(_))));
    }
}
