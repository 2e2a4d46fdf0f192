// Test fixtures for integration tests

use std::collections::BTreeMap;

use cassandra_operator::address::{AddressResolver, HostInfo};
use cassandra_operator::crd::CassandraClusterSpec;
use cassandra_operator::membership::{DatacenterStatus, Member, MembershipView};
use cassandra_operator::names;
use cassandra_operator::seeds::{dc_num_seeds, ClusterIdentity};

pub const CLUSTER: &str = "test-cluster";
pub const NAMESPACE: &str = "default";

pub fn identity() -> ClusterIdentity {
    ClusterIdentity::new(CLUSTER, NAMESPACE)
}

pub fn spec(value: serde_json::Value) -> CassandraClusterSpec {
    serde_json::from_value(value).expect("invalid cluster spec")
}

/// Simulated cluster: every declared pod exists and is scheduled, readiness
/// is flipped by the test.
#[derive(Debug, Clone)]
pub struct SimCluster {
    pub spec: CassandraClusterSpec,
    pub ready: BTreeMap<String, bool>,
}

impl SimCluster {
    pub fn new(spec: CassandraClusterSpec) -> Self {
        let mut ready = BTreeMap::new();
        for dc in &spec.dcs {
            for i in 0..dc.replicas {
                ready.insert(names::dc_pod(CLUSTER, &dc.name, i), false);
            }
        }
        Self { spec, ready }
    }

    pub fn all_ready(spec: CassandraClusterSpec) -> Self {
        let mut sim = Self::new(spec);
        sim.ready.values_mut().for_each(|r| *r = true);
        sim
    }

    pub fn set_ready(&mut self, pod: &str) {
        self.ready.insert(pod.to_string(), true);
    }

    pub fn member(&self, dc: &str, ordinal: i32) -> Member {
        let name = names::dc_pod(CLUSTER, dc, ordinal);
        let dc_index = self.spec.dcs.iter().position(|d| d.name == dc).unwrap_or(0);
        let num_seeds = self
            .spec
            .dc(dc)
            .map(|d| dc_num_seeds(self.spec.cassandra.num_seeds, d.replicas))
            .unwrap_or(0);

        Member {
            uid: format!("uid-{}", name),
            ready: self.ready.get(&name).copied().unwrap_or(false),
            name,
            dc: dc.to_string(),
            ordinal,
            pod_ip: Some(format!("10.1.{}.{}", dc_index + 1, ordinal + 3)),
            node_name: Some(format!("node-{}-{}", dc, ordinal)),
            seed: ordinal < num_seeds,
        }
    }

    pub fn view(&self) -> MembershipView {
        let mut members = Vec::new();
        let mut datacenters = Vec::new();

        for dc in &self.spec.dcs {
            let dc_members: Vec<Member> = (0..dc.replicas).map(|i| self.member(&dc.name, i)).collect();
            datacenters.push(DatacenterStatus {
                name: dc.name.clone(),
                desired_replicas: dc.replicas,
                ready_replicas: Some(dc_members.iter().filter(|m| m.ready).count() as i32),
            });
            members.extend(dc_members);
        }

        MembershipView::new(members, datacenters)
    }

    /// Resolver knowing every host of the simulated cluster. Hosts get
    /// `192.168.<dc>.<ordinal>` internal and `34.0.<dc>.<ordinal>` external
    /// addresses and are spread over three zones.
    pub fn resolver(&self) -> AddressResolver {
        let mut hosts = BTreeMap::new();
        for (i, dc) in self.spec.dcs.iter().enumerate() {
            for ordinal in 0..dc.replicas {
                hosts.insert(
                    format!("node-{}-{}", dc.name, ordinal),
                    HostInfo {
                        internal_ip: Some(format!("192.168.{}.{}", i + 1, ordinal)),
                        external_ip: Some(format!("34.0.{}.{}", i + 1, ordinal)),
                        zone: Some(format!("zone-{}", ordinal % 3)),
                    },
                );
            }
        }
        AddressResolver::new(self.spec.host_port.clone(), hosts)
    }
}
