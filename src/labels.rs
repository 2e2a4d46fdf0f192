//! Label keys and seed-label reconciliation.

use std::collections::{BTreeMap, BTreeSet};

use crate::crd::CassandraClusterSpec;
use crate::membership::Member;
use crate::names;
use crate::seeds::dc_num_seeds;

pub const CASSANDRA_CLUSTER_INSTANCE: &str = "cassandra-cluster-instance";
pub const CASSANDRA_CLUSTER_COMPONENT: &str = "cassandra-cluster-component";
pub const CASSANDRA_CLUSTER_DC: &str = "cassandra-cluster-dc";
pub const CASSANDRA_CLUSTER_SEED: &str = "cassandra-cluster-seed";
pub const CASSANDRA_CLUSTER_JOB: &str = "cassandra-cluster-job";

pub const COMPONENT_CASSANDRA: &str = "cassandra";
pub const MANAGED_BY: &str = "cassandra-operator";

/// Labels shared by every object of a cluster component.
pub fn component_labels(cluster_name: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(CASSANDRA_CLUSTER_INSTANCE.to_string(), cluster_name.to_string());
    labels.insert(CASSANDRA_CLUSTER_COMPONENT.to_string(), component.to_string());
    labels.insert("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string());
    labels
}

/// Label selector string matching the cassandra pods of a cluster.
pub fn cassandra_selector(cluster_name: &str) -> String {
    format!(
        "{}={},{}={}",
        CASSANDRA_CLUSTER_INSTANCE, cluster_name, CASSANDRA_CLUSTER_COMPONENT, COMPONENT_CASSANDRA
    )
}

/// Required change to a pod's seed label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedLabelChange {
    Add,
    Remove,
}

/// Pods whose seed label disagrees with their ordinal, in name order.
pub fn seed_label_changes(
    spec: &CassandraClusterSpec,
    cluster_name: &str,
    members: &[Member],
) -> Vec<(String, SeedLabelChange)> {
    let seed_pods: BTreeSet<String> = spec
        .dcs
        .iter()
        .flat_map(|dc| {
            (0..dc_num_seeds(spec.cassandra.num_seeds, dc.replicas))
                .map(move |i| names::dc_pod(cluster_name, &dc.name, i))
        })
        .collect();

    members
        .iter()
        .filter_map(|m| match (m.seed, seed_pods.contains(&m.name)) {
            (true, false) => Some((m.name.clone(), SeedLabelChange::Remove)),
            (false, true) => Some((m.name.clone(), SeedLabelChange::Add)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::tests::member;

    #[test]
    fn test_seed_label_changes_after_scale_down() {
        // dc1 scaled from 3 to 2: seedCount drops from 2 to 1
        let spec: CassandraClusterSpec = serde_json::from_value(serde_json::json!({
            "dcs": [{"name": "dc1", "replicas": 2}]
        }))
        .unwrap();

        let members = vec![
            member("dc1", 0, true, true),
            member("dc1", 1, true, true),
            member("dc1", 2, false, true),
        ];

        assert_eq!(
            seed_label_changes(&spec, "test-cluster", &members),
            vec![("test-cluster-cassandra-dc1-1".to_string(), SeedLabelChange::Remove)]
        );
    }

    #[test]
    fn test_seed_label_added_to_new_pod() {
        let spec: CassandraClusterSpec = serde_json::from_value(serde_json::json!({
            "dcs": [{"name": "dc1", "replicas": 4}]
        }))
        .unwrap();

        let members = vec![member("dc1", 0, true, true), member("dc1", 1, false, false)];

        assert_eq!(
            seed_label_changes(&spec, "test-cluster", &members),
            vec![("test-cluster-cassandra-dc1-1".to_string(), SeedLabelChange::Add)]
        );
    }
}
