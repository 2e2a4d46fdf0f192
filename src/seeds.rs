//! Seed selection.
//!
//! The first `seedCount` ordinals of every datacenter are seeds. The full
//! seed list a node starts with is, in order: local datacenters in declared
//! order, managed regions in declared order, unmanaged regions in declared
//! order. The order is stable so that an unchanged topology produces an
//! unchanged per-node configuration.

use std::collections::BTreeMap;

use tracing::debug;

use crate::crd::CassandraClusterSpec;
use crate::error::Result;
use crate::gateway::{regions_seeds, CrossRegionGateway};
use crate::names;

/// Number of seeds of a datacenter: never every node, unless the
/// datacenter has a single node (or none).
pub fn dc_num_seeds(target: i32, replicas: i32) -> i32 {
    if replicas <= 1 {
        return replicas.max(0);
    }
    target.min(replicas - 1)
}

/// Identity of the cluster across regions.
#[derive(Debug, Clone)]
pub struct ClusterIdentity {
    pub name: String,
    pub namespace: String,
}

impl ClusterIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// This region's identifier.
    pub fn local_region(&self, spec: &CassandraClusterSpec) -> String {
        names::prober_ingress_host(&self.name, &self.namespace, &spec.ingress.domain)
    }

    /// Identifiers of managed peer regions, in declared order.
    pub fn managed_regions(&self, spec: &CassandraClusterSpec) -> Vec<String> {
        spec.external_regions
            .managed
            .iter()
            .filter(|r| !r.domain.is_empty())
            .map(|r| {
                let namespace = r.namespace.as_deref().unwrap_or(&self.namespace);
                names::prober_ingress_host(&self.name, namespace, &r.domain)
            })
            .collect()
    }
}

/// Seeds of the local datacenters. Pod DNS names are used unless nodes are
/// exposed on the host network, in which case the resolved addresses are.
/// Seed ordinals whose pod doesn't exist yet, as during a scale-up, have
/// no address and are left out.
pub fn local_seeds(
    spec: &CassandraClusterSpec,
    cluster: &ClusterIdentity,
    broadcast_addresses: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut seeds = Vec::new();
    for dc in &spec.dcs {
        for i in 0..dc_num_seeds(spec.cassandra.num_seeds, dc.replicas) {
            if spec.host_port.enabled {
                let pod = names::dc_pod(&cluster.name, &dc.name, i);
                match broadcast_addresses.get(&pod) {
                    Some(address) => seeds.push(address.clone()),
                    None => debug!(pod = %pod, "Seed pod has no address yet, skipping"),
                }
            } else {
                seeds.push(names::dc_pod_fqdn(&cluster.name, &cluster.namespace, &dc.name, i));
            }
        }
    }

    seeds
}

/// Full seed list for the pass. Local seeds are always published first so
/// that peers see them even while local bring-up is incomplete.
pub async fn compute_seeds(
    spec: &CassandraClusterSpec,
    cluster: &ClusterIdentity,
    broadcast_addresses: &BTreeMap<String, String>,
    gateway: &dyn CrossRegionGateway,
) -> Result<Vec<String>> {
    let mut seeds = local_seeds(spec, cluster, broadcast_addresses);

    gateway.publish_local_seeds(&seeds).await?;

    if !spec.host_port.enabled {
        return Ok(seeds);
    }

    let managed = cluster.managed_regions(spec);
    for region_seeds in regions_seeds(gateway, &managed).await? {
        seeds.extend(region_seeds);
    }

    for unmanaged in &spec.external_regions.unmanaged {
        seeds.extend(unmanaged.seeds.iter().cloned());
    }

    debug!(cluster = %cluster.name, seeds = ?seeds, "Seeds computed");
    Ok(seeds)
}
