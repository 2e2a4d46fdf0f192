//! Datacenter scaling.
//!
//! Scale-up only raises the replica count; bootstrap ordering takes care of
//! the new nodes. Scale-down removes the highest ordinal of a datacenter
//! through an orchestrated decommission, one node and one datacenter at a
//! time, and lowers the replica count only once the node is confirmed gone.
//! Datacenters removed from the cluster are drained the same way and their
//! StatefulSet is deleted once empty.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, DeleteParams, Patch, PatchParams, Preconditions};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::CassandraClusterSpec;
use crate::error::{is_not_found, Error, Result};
use crate::jobs::DecommissionJobTracker;
use crate::labels;
use crate::membership::MembershipView;
use crate::metrics;
use crate::names;
use crate::nodectl::{NodeControl, OperationMode};

/// Replica counts of one datacenter StatefulSet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingIntent {
    pub dc: String,
    pub statefulset: String,
    pub current_replicas: i32,
    /// `None` when the datacenter is no longer declared.
    pub desired_replicas: Option<i32>,
    /// Store version the current count was read at.
    pub version: String,
}

impl ScalingIntent {
    /// Intents of every cassandra StatefulSet: declared datacenters in
    /// declared order, then removed ones by name.
    pub fn from_statefulsets(spec: &CassandraClusterSpec, statefulsets: &[StatefulSet]) -> Vec<Self> {
        let by_dc: BTreeMap<String, &StatefulSet> = statefulsets
            .iter()
            .filter_map(|sts| Some((sts.labels().get(labels::CASSANDRA_CLUSTER_DC)?.clone(), sts)))
            .collect();

        let intent = |dc: &str, sts: &StatefulSet, desired: Option<i32>| ScalingIntent {
            dc: dc.to_string(),
            statefulset: sts.name_any(),
            current_replicas: sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            desired_replicas: desired,
            version: sts.resource_version().unwrap_or_default(),
        };

        let mut intents: Vec<Self> = spec
            .dcs
            .iter()
            .filter_map(|dc| Some(intent(&dc.name, by_dc.get(&dc.name).copied()?, Some(dc.replicas))))
            .collect();

        intents.extend(
            by_dc
                .iter()
                .filter(|(dc, _)| spec.dc(dc).is_none())
                .map(|(dc, sts)| intent(dc, *sts, None)),
        );

        intents
    }

    fn removed(&self) -> bool {
        self.desired_replicas.is_none()
    }
}

/// Result of one scaling step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleOutcome {
    /// Every datacenter has its desired replica count.
    Idle,
    ScaledUp { dc: String, replicas: i32 },
    /// A decommission is in progress.
    Waiting { pod: String },
    DecommissionStarted { pod: String },
    ScaledDown { dc: String, replicas: i32 },
    DcRemoved { dc: String },
}

/// Replica count field of datacenter StatefulSets, written with
/// compare-and-set semantics.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Fails with a conflict if the StatefulSet changed since `version`.
    async fn set_replicas(&self, statefulset: &str, replicas: i32, version: &str) -> Result<()>;

    async fn delete(&self, statefulset: &str, version: &str) -> Result<()>;
}

pub struct KubeReplicaStore {
    api: Api<StatefulSet>,
}

impl KubeReplicaStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ReplicaStore for KubeReplicaStore {
    async fn set_replicas(&self, statefulset: &str, replicas: i32, version: &str) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": version },
            "spec": { "replicas": replicas }
        });
        self.api
            .patch(statefulset, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, statefulset: &str, version: &str) -> Result<()> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: Some(version.to_string()),
                uid: None,
            }),
            ..Default::default()
        };

        match self.api.delete(statefulset, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Drives replica counts towards the declared ones, one action per pass.
pub struct ScaleCoordinator {
    cluster_name: String,
    replicas: Arc<dyn ReplicaStore>,
    nodectl: Arc<dyn NodeControl>,
    jobs: DecommissionJobTracker,
}

impl ScaleCoordinator {
    pub fn new(
        cluster_name: &str,
        replicas: Arc<dyn ReplicaStore>,
        nodectl: Arc<dyn NodeControl>,
        jobs: DecommissionJobTracker,
    ) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            replicas,
            nodectl,
            jobs,
        }
    }

    /// Act on the first datacenter whose replica count differs from the
    /// declared one, if any.
    pub async fn reconcile(
        &self,
        spec: &CassandraClusterSpec,
        intents: &[ScalingIntent],
        view: &MembershipView,
        broadcast_addresses: &BTreeMap<String, String>,
    ) -> Result<ScaleOutcome> {
        for intent in intents {
            match intent.desired_replicas {
                Some(desired) if desired == intent.current_replicas => continue,
                Some(desired) if desired > intent.current_replicas => {
                    info!(
                        dc = %intent.dc,
                        from = intent.current_replicas,
                        to = desired,
                        "Scaling up datacenter"
                    );
                    self.replicas
                        .set_replicas(&intent.statefulset, desired, &intent.version)
                        .await?;
                    return Ok(ScaleOutcome::ScaledUp {
                        dc: intent.dc.clone(),
                        replicas: desired,
                    });
                }
                None if intent.current_replicas == 0 => {
                    info!(dc = %intent.dc, "All nodes of removed datacenter are decommissioned, removing it");
                    self.replicas.delete(&intent.statefulset, &intent.version).await?;
                    return Ok(ScaleOutcome::DcRemoved { dc: intent.dc.clone() });
                }
                _ => {
                    if view.is_empty() {
                        warn!(dc = %intent.dc, "No pods found to perform scale down");
                        continue;
                    }
                    return self.scale_down(spec, intent, view, broadcast_addresses).await;
                }
            }
        }

        Ok(ScaleOutcome::Idle)
    }

    async fn scale_down(
        &self,
        spec: &CassandraClusterSpec,
        intent: &ScalingIntent,
        view: &MembershipView,
        broadcast_addresses: &BTreeMap<String, String>,
    ) -> Result<ScaleOutcome> {
        let pod = names::dc_pod(&self.cluster_name, &intent.dc, intent.current_replicas - 1);
        let job = names::decommission_job(&pod);
        debug!(pod = %pod, removed_dc = intent.removed(), "Handling decommission");

        if self.jobs.is_running(&job).await? {
            info!(pod = %pod, "Decommission in progress, waiting to finish");
            return Ok(ScaleOutcome::Waiting { pod });
        }

        if view.member(&pod).is_none() {
            return Err(Error::ConfigInvariant(format!(
                "couldn't find pod {} to start the decommission",
                pod
            )));
        }
        let address = broadcast_addresses
            .get(&pod)
            .cloned()
            .ok_or_else(|| Error::PodNotScheduled(pod.clone()))?;

        debug!(pod = %pod, "Checking operation mode");
        let mode = match self.nodectl.operation_mode(&address).await {
            Ok(mode) => mode,
            Err(e) => {
                warn!(
                    pod = %pod,
                    error = %e,
                    "Couldn't get operation mode, checking if the node is decommissioned already"
                );
                if !self.departure_confirmed(spec, &pod, &address, view, broadcast_addresses).await {
                    return Err(Error::DecommissionUnconfirmed {
                        pod,
                        source: Box::new(e),
                    });
                }
                return self.complete(intent, &pod, &job).await;
            }
        };

        match mode {
            OperationMode::Leaving => {
                info!(pod = %pod, "Node is being decommissioned, waiting to finish");
                Ok(ScaleOutcome::Waiting { pod })
            }
            OperationMode::Decommissioned => {
                if self.departure_confirmed(spec, &pod, &address, view, broadcast_addresses).await {
                    self.complete(intent, &pod, &job).await
                } else {
                    info!(pod = %pod, "Node is decommissioned, waiting for peers to see it gone");
                    Ok(ScaleOutcome::Waiting { pod })
                }
            }
            _ => {
                if let Some(previous) = self.jobs.job(&job).await? {
                    if let Some(error) = &previous.error {
                        warn!(pod = %pod, error = %error, "Previous decommission attempt failed, retrying");
                    }
                    self.jobs.remove_job(&job).await?;
                }

                info!(pod = %pod, mode = %mode, "Starting decommission of node");
                let nodectl = Arc::clone(&self.nodectl);
                self.jobs
                    .run(&job, async move { nodectl.decommission(&address).await })
                    .await?;
                metrics::DECOMMISSIONS_STARTED.inc();

                Ok(ScaleOutcome::DecommissionStarted { pod })
            }
        }
    }

    /// Lower the replica count past a node that has left the ring.
    async fn complete(&self, intent: &ScalingIntent, pod: &str, job: &str) -> Result<ScaleOutcome> {
        let replicas = intent.current_replicas - 1;
        info!(pod = %pod, replicas, "Node is decommissioned, scaling down the statefulset");

        self.replicas
            .set_replicas(&intent.statefulset, replicas, &intent.version)
            .await?;
        self.jobs.remove_job(job).await?;
        metrics::DECOMMISSIONS_COMPLETED.inc();

        Ok(ScaleOutcome::ScaledDown {
            dc: intent.dc.clone(),
            replicas,
        })
    }

    /// True when every other member of a declared datacenter reports the
    /// target as not live. Members whose view can't be read don't confirm.
    async fn departure_confirmed(
        &self,
        spec: &CassandraClusterSpec,
        pod: &str,
        address: &str,
        view: &MembershipView,
        broadcast_addresses: &BTreeMap<String, String>,
    ) -> bool {
        let declared: BTreeSet<&str> = spec.dcs.iter().map(|dc| dc.name.as_str()).collect();
        let members: Vec<_> = view
            .members()
            .iter()
            .filter(|m| declared.contains(m.dc.as_str()))
            .collect();

        // the target itself may be one of them
        let quorum = members.len().saturating_sub(1);

        let checks = members.iter().filter(|m| m.name != pod).map(|m| async move {
            let Some(peer) = broadcast_addresses.get(&m.name) else {
                return false;
            };
            debug!(pod = %m.name, "Checking cluster view");
            match self.nodectl.cluster_view(peer).await {
                Ok(view) => !view.live_nodes.iter().any(|n| n == address),
                Err(e) => {
                    warn!(pod = %m.name, error = %e, "Can't get cluster view");
                    false
                }
            }
        });

        let not_live = join_all(checks).await.into_iter().filter(|c| *c).count();
        debug!(pod = %pod, not_live, quorum, "Nodes that don't see the node as live");

        not_live >= quorum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStore;
    use crate::membership::tests::member;
    use crate::nodectl::ClusterView;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeReplicas {
        updates: Mutex<Vec<(String, i32)>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReplicaStore for FakeReplicas {
        async fn set_replicas(&self, statefulset: &str, replicas: i32, _version: &str) -> Result<()> {
            self.updates.lock().unwrap().push((statefulset.to_string(), replicas));
            Ok(())
        }

        async fn delete(&self, statefulset: &str, _version: &str) -> Result<()> {
            self.deleted.lock().unwrap().push(statefulset.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeNodes {
        modes: HashMap<String, OperationMode>,
        live_views: HashMap<String, Vec<String>>,
        decommissioned: Mutex<Vec<String>>,
    }

    fn unreachable(address: &str) -> Error {
        Error::NodeControl {
            address: address.to_string(),
            reason: "connection refused".to_string(),
        }
    }

    #[async_trait]
    impl NodeControl for FakeNodes {
        async fn operation_mode(&self, address: &str) -> Result<OperationMode> {
            self.modes.get(address).copied().ok_or_else(|| unreachable(address))
        }

        async fn cluster_view(&self, address: &str) -> Result<ClusterView> {
            let live_nodes = self.live_views.get(address).cloned().ok_or_else(|| unreachable(address))?;
            Ok(ClusterView {
                live_nodes,
                ..Default::default()
            })
        }

        async fn decommission(&self, address: &str) -> Result<()> {
            self.decommissioned.lock().unwrap().push(address.to_string());
            Ok(())
        }
    }

    fn spec(replicas: i32) -> CassandraClusterSpec {
        serde_json::from_value(serde_json::json!({
            "dcs": [{"name": "dc1", "replicas": replicas}, {"name": "dc2", "replicas": 3}]
        }))
        .unwrap()
    }

    fn intent(dc: &str, current: i32, desired: Option<i32>) -> ScalingIntent {
        ScalingIntent {
            dc: dc.to_string(),
            statefulset: names::dc("test-cluster", dc),
            current_replicas: current,
            desired_replicas: desired,
            version: "1".to_string(),
        }
    }

    /// dc1 with `n` members, all ready.
    fn view(n: i32) -> (MembershipView, BTreeMap<String, String>) {
        let members: Vec<_> = (0..n).map(|i| member("dc1", i, i < 2, true)).collect();
        let addresses = members
            .iter()
            .map(|m| (m.name.clone(), m.pod_ip.clone().unwrap()))
            .collect();
        (MembershipView::new(members, vec![]), addresses)
    }

    struct Harness {
        replicas: Arc<FakeReplicas>,
        nodes: Arc<FakeNodes>,
        jobs: DecommissionJobTracker,
        coordinator: ScaleCoordinator,
    }

    fn harness(nodes: FakeNodes) -> Harness {
        let replicas = Arc::new(FakeReplicas::default());
        let nodes = Arc::new(nodes);
        let jobs = DecommissionJobTracker::new(Arc::new(InMemoryJobStore::new()));
        let coordinator = ScaleCoordinator::new("test-cluster", replicas.clone(), nodes.clone(), jobs.clone());
        Harness {
            replicas,
            nodes,
            jobs,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_scale_up_is_immediate() {
        let h = harness(FakeNodes::default());
        let (view, addresses) = view(3);

        let outcome = h
            .coordinator
            .reconcile(
                &spec(5),
                &[intent("dc1", 3, Some(5)), intent("dc2", 1, Some(3))],
                &view,
                &addresses,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ScaleOutcome::ScaledUp {
                dc: "dc1".to_string(),
                replicas: 5
            }
        );
        // one datacenter per pass
        assert_eq!(
            *h.replicas.updates.lock().unwrap(),
            vec![("test-cluster-cassandra-dc1".to_string(), 5)]
        );
    }

    #[tokio::test]
    async fn test_scale_down_starts_decommission_of_highest_ordinal() {
        let (view, addresses) = view(4);
        let target = addresses["test-cluster-cassandra-dc1-3"].clone();

        let mut nodes = FakeNodes::default();
        nodes.modes.insert(target.clone(), OperationMode::Normal);
        let h = harness(nodes);

        let outcome = h
            .coordinator
            .reconcile(&spec(3), &[intent("dc1", 4, Some(3))], &view, &addresses)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ScaleOutcome::DecommissionStarted {
                pod: "test-cluster-cassandra-dc1-3".to_string()
            }
        );
        assert!(h.jobs.exists("pod-decommission-test-cluster-cassandra-dc1-3").await.unwrap());
        assert!(h.replicas.updates.lock().unwrap().is_empty());

        // the detached decommission eventually reaches the node
        for _ in 0..100 {
            if !h.nodes.decommissioned.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(*h.nodes.decommissioned.lock().unwrap(), vec![target]);
    }

    #[tokio::test]
    async fn test_leaving_node_waits() {
        let (view, addresses) = view(4);
        let mut nodes = FakeNodes::default();
        nodes
            .modes
            .insert(addresses["test-cluster-cassandra-dc1-3"].clone(), OperationMode::Leaving);
        let h = harness(nodes);

        let outcome = h
            .coordinator
            .reconcile(&spec(3), &[intent("dc1", 4, Some(3))], &view, &addresses)
            .await
            .unwrap();
        assert!(matches!(outcome, ScaleOutcome::Waiting { .. }));
        assert!(!h.jobs.exists("pod-decommission-test-cluster-cassandra-dc1-3").await.unwrap());
    }

    #[tokio::test]
    async fn test_running_job_waits() {
        let (view, addresses) = view(4);
        let h = harness(FakeNodes::default());

        let (_tx, rx) = tokio::sync::oneshot::channel::<()>();
        h.jobs
            .run("pod-decommission-test-cluster-cassandra-dc1-3", async move {
                let _ = rx.await;
                Ok(())
            })
            .await
            .unwrap();

        let outcome = h
            .coordinator
            .reconcile(&spec(3), &[intent("dc1", 4, Some(3))], &view, &addresses)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ScaleOutcome::Waiting {
                pod: "test-cluster-cassandra-dc1-3".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_confirmed_gone() {
        let (view, addresses) = view(4);

        // the target doesn't answer and no peer sees it live
        let mut nodes = FakeNodes::default();
        for i in 0..3 {
            let peer = addresses[&format!("test-cluster-cassandra-dc1-{}", i)].clone();
            nodes.live_views.insert(peer, vec!["10.9.9.9".to_string()]);
        }
        let h = harness(nodes);

        let outcome = h
            .coordinator
            .reconcile(&spec(3), &[intent("dc1", 4, Some(3))], &view, &addresses)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ScaleOutcome::ScaledDown {
                dc: "dc1".to_string(),
                replicas: 3
            }
        );
        assert_eq!(
            *h.replicas.updates.lock().unwrap(),
            vec![("test-cluster-cassandra-dc1".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_departure_keeps_original_error() {
        let (view, addresses) = view(6);
        let target = addresses["test-cluster-cassandra-dc1-5"].clone();

        // 2 of 5 peers don't see the target anymore
        let mut nodes = FakeNodes::default();
        for i in 0..5 {
            let peer = addresses[&format!("test-cluster-cassandra-dc1-{}", i)].clone();
            let live = if i < 2 { vec![] } else { vec![target.clone()] };
            nodes.live_views.insert(peer, live);
        }
        let h = harness(nodes);

        let err = h
            .coordinator
            .reconcile(&spec(5), &[intent("dc1", 6, Some(5))], &view, &addresses)
            .await
            .unwrap_err();

        match err {
            Error::DecommissionUnconfirmed { pod, source } => {
                assert_eq!(pod, "test-cluster-cassandra-dc1-5");
                assert!(matches!(*source, Error::NodeControl { ref address, .. } if *address == target));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(h.replicas.updates.lock().unwrap().is_empty());
        assert!(!h.jobs.exists("pod-decommission-test-cluster-cassandra-dc1-5").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_target_is_fatal() {
        let (view, addresses) = view(3);
        let h = harness(FakeNodes::default());

        let err = h
            .coordinator
            .reconcile(&spec(3), &[intent("dc1", 5, Some(3))], &view, &addresses)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvariant(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_removed_dc_is_deleted_when_empty() {
        let (view, addresses) = view(3);
        let h = harness(FakeNodes::default());

        let outcome = h
            .coordinator
            .reconcile(
                &spec(3),
                &[intent("dc1", 3, Some(3)), intent("dc9", 0, None)],
                &view,
                &addresses,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ScaleOutcome::DcRemoved { dc: "dc9".to_string() });
        assert_eq!(
            *h.replicas.deleted.lock().unwrap(),
            vec!["test-cluster-cassandra-dc9".to_string()]
        );
    }

    #[test]
    fn test_intents_from_statefulsets() {
        use k8s_openapi::api::apps::v1::StatefulSetSpec;
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        let sts = |dc: &str, replicas: i32| StatefulSet {
            metadata: ObjectMeta {
                name: Some(names::dc("test-cluster", dc)),
                labels: Some(
                    [(labels::CASSANDRA_CLUSTER_DC.to_string(), dc.to_string())]
                        .into_iter()
                        .collect(),
                ),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        };

        let intents = ScalingIntent::from_statefulsets(&spec(3), &[sts("old", 2), sts("dc2", 3), sts("dc1", 4)]);
        let order: Vec<_> = intents.iter().map(|i| i.dc.as_str()).collect();
        assert_eq!(order, vec!["dc1", "dc2", "old"]);
        assert_eq!(intents[0].current_replicas, 4);
        assert_eq!(intents[2].desired_replicas, None);
        assert_eq!(intents[2].version, "7");
    }
}
