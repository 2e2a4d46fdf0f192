// Hand-written fakes of the operator's external collaborators

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use cassandra_operator::error::{Error, Result};
use cassandra_operator::gateway::CrossRegionGateway;
use cassandra_operator::nodectl::{ClusterView, NodeControl, OperationMode};
use cassandra_operator::scaling::ReplicaStore;

/// Prober of peer regions. Regions missing from the maps are unreachable.
#[derive(Default)]
pub struct FakeGateway {
    pub seeds: Mutex<HashMap<String, Vec<String>>>,
    pub readiness: Mutex<HashMap<String, bool>>,
    pub published_seeds: Mutex<Vec<Vec<String>>>,
    pub published_readiness: Mutex<Vec<bool>>,
}

impl FakeGateway {
    pub fn with_region(self, region: &str, ready: bool, seeds: &[&str]) -> Self {
        self.readiness.lock().unwrap().insert(region.to_string(), ready);
        self.seeds
            .lock()
            .unwrap()
            .insert(region.to_string(), seeds.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn set_ready(&self, region: &str, ready: bool) {
        self.readiness.lock().unwrap().insert(region.to_string(), ready);
    }
}

fn unreachable(host: &str) -> Error {
    Error::Gateway {
        host: host.to_string(),
        reason: "connection refused".to_string(),
    }
}

#[async_trait]
impl CrossRegionGateway for FakeGateway {
    async fn publish_local_seeds(&self, seeds: &[String]) -> Result<()> {
        self.published_seeds.lock().unwrap().push(seeds.to_vec());
        Ok(())
    }

    async fn fetch_seeds(&self, region: &str) -> Result<Vec<String>> {
        self.seeds
            .lock()
            .unwrap()
            .get(region)
            .cloned()
            .ok_or_else(|| unreachable(region))
    }

    async fn is_region_ready(&self, region: &str) -> Result<bool> {
        self.readiness
            .lock()
            .unwrap()
            .get(region)
            .copied()
            .ok_or_else(|| unreachable(region))
    }

    async fn publish_local_readiness(&self, ready: bool) -> Result<()> {
        self.published_readiness.lock().unwrap().push(ready);
        Ok(())
    }
}

/// Cassandra nodes reachable over JMX. A node without a mode is down.
#[derive(Default)]
pub struct FakeNodes {
    pub modes: Mutex<HashMap<String, OperationMode>>,
    /// Live nodes as seen by each node.
    pub live: Mutex<HashMap<String, Vec<String>>>,
    pub decommissioned: Mutex<Vec<String>>,
}

impl FakeNodes {
    /// Every address is up and sees every other one.
    pub fn ring(addresses: &[String]) -> Self {
        let nodes = Self::default();
        for address in addresses {
            nodes.modes.lock().unwrap().insert(address.clone(), OperationMode::Normal);
            nodes.live.lock().unwrap().insert(address.clone(), addresses.to_vec());
        }
        nodes
    }

    /// The node left the ring and its process is gone.
    pub fn remove(&self, address: &str) {
        self.modes.lock().unwrap().remove(address);
        self.live.lock().unwrap().remove(address);
        for live in self.live.lock().unwrap().values_mut() {
            live.retain(|a| a != address);
        }
    }
}

#[async_trait]
impl NodeControl for FakeNodes {
    async fn operation_mode(&self, address: &str) -> Result<OperationMode> {
        self.modes
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .ok_or_else(|| Error::NodeControl {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            })
    }

    async fn cluster_view(&self, address: &str) -> Result<ClusterView> {
        let live_nodes = self
            .live
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::NodeControl {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            })?;
        Ok(ClusterView {
            live_nodes,
            ..Default::default()
        })
    }

    async fn decommission(&self, address: &str) -> Result<()> {
        self.modes
            .lock()
            .unwrap()
            .insert(address.to_string(), OperationMode::Leaving);
        self.decommissioned.lock().unwrap().push(address.to_string());
        Ok(())
    }
}

/// StatefulSet replica counts.
#[derive(Default)]
pub struct FakeReplicas {
    pub replicas: Mutex<HashMap<String, i32>>,
    pub deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl ReplicaStore for FakeReplicas {
    async fn set_replicas(&self, statefulset: &str, replicas: i32, _version: &str) -> Result<()> {
        self.replicas
            .lock()
            .unwrap()
            .insert(statefulset.to_string(), replicas);
        Ok(())
    }

    async fn delete(&self, statefulset: &str, _version: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(statefulset.to_string());
        Ok(())
    }
}
