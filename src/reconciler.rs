//! Reconciliation logic for Cassandra clusters
//!
//! A pass reads the live pods, StatefulSets and nodes of a cluster, computes
//! seeds, bootstrap order and per-pod facts, writes the pods config map and
//! then takes at most one scaling step. Nothing is carried over between
//! passes except what is stored in the cluster itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::channel::mpsc::UnboundedSender;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info};

use crate::address::AddressResolver;
use crate::config::{render_url, OperatorConfig};
use crate::crd::{CassandraCluster, CassandraClusterSpec, CassandraClusterStatus, ClusterPhase};
use crate::error::Result;
use crate::gateway::{CrossRegionGateway, ProberClient};
use crate::init_order::{self, InitDecision, InitPlan};
use crate::jobs::{ConfigMapJobStore, DecommissionJobTracker};
use crate::labels::{self, SeedLabelChange};
use crate::membership::MembershipView;
use crate::metrics;
use crate::names;
use crate::nodectl::JolokiaClient;
use crate::pods_config::{self, FactSheet};
use crate::scaling::{KubeReplicaStore, ScaleCoordinator, ScaleOutcome, ScalingIntent};
use crate::seeds::{compute_seeds, ClusterIdentity};

/// Everything derived from one membership snapshot.
#[derive(Debug, Clone)]
pub struct PassFacts {
    pub broadcast_addresses: BTreeMap<String, String>,
    pub seeds: Vec<String>,
    pub plan: InitPlan,
    pub decisions: BTreeMap<String, InitDecision>,
    /// Last known ready address of every pod ever seen.
    pub pod_ips: BTreeMap<String, String>,
    pub sheet: FactSheet,
}

/// Compute the facts of a pass. Local seeds and readiness are published
/// before peer regions are consulted; any failure aborts the whole pass.
pub async fn compute_pass(
    spec: &CassandraClusterSpec,
    cluster: &ClusterIdentity,
    view: &MembershipView,
    resolver: &AddressResolver,
    gateway: &dyn CrossRegionGateway,
    previous_addresses: &BTreeMap<String, String>,
) -> Result<PassFacts> {
    let broadcast_addresses = resolver.resolve_all(view)?;

    let seeds = compute_seeds(spec, cluster, &broadcast_addresses, gateway).await?;

    gateway
        .publish_local_readiness(view.unready_dcs().is_empty())
        .await?;

    let plan = init_order::plan(spec, cluster, view, gateway).await?;
    let decisions = init_order::decide(&plan, view);

    let pod_ips = pods_config::merge_previous_addresses(previous_addresses, view, &broadcast_addresses);
    let sheet = pods_config::build(
        spec,
        view,
        resolver,
        &broadcast_addresses,
        &seeds,
        &decisions,
        &pod_ips,
    )?;

    Ok(PassFacts {
        broadcast_addresses,
        seeds,
        plan,
        decisions,
        pod_ips,
        sheet,
    })
}

/// Outcome of a successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// `None` when the cluster has no pods yet.
    pub plan: Option<InitPlan>,
    pub scale: ScaleOutcome,
    pub ready_members: usize,
}

impl PassReport {
    pub fn status(&self) -> CassandraClusterStatus {
        let (mut phase, initializing_dc, mut message) = match &self.plan {
            None => (ClusterPhase::Pending, None, "waiting for cassandra pods".to_string()),
            Some(InitPlan::RegionPaused { next_region }) => (
                ClusterPhase::WaitingForRegions,
                None,
                format!("waiting for region {} to be ready", next_region),
            ),
            Some(InitPlan::InitializingDc(dc)) => (
                ClusterPhase::Initializing,
                Some(dc.clone()),
                format!("initializing dc {}", dc),
            ),
            Some(InitPlan::Converged) => (ClusterPhase::Running, None, "cluster is running".to_string()),
        };

        let decommissioning = match &self.scale {
            ScaleOutcome::Idle => None,
            ScaleOutcome::Waiting { pod } | ScaleOutcome::DecommissionStarted { pod } => {
                message = format!("decommissioning pod {}", pod);
                Some(pod.clone())
            }
            ScaleOutcome::ScaledUp { dc, replicas } | ScaleOutcome::ScaledDown { dc, replicas } => {
                message = format!("scaling dc {} to {} replicas", dc, replicas);
                None
            }
            ScaleOutcome::DcRemoved { dc } => {
                message = format!("removed dc {}", dc);
                None
            }
        };
        if self.scale != ScaleOutcome::Idle && phase == ClusterPhase::Running {
            phase = ClusterPhase::Scaling;
        }

        CassandraClusterStatus {
            phase,
            ready_nodes: self.ready_members as i32,
            initializing_dc,
            decommissioning,
            message: Some(message),
            last_reconciled: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Whether the cluster still has work in flight.
    pub fn converging(&self) -> bool {
        self.scale != ScaleOutcome::Idle || !matches!(self.plan, Some(InitPlan::Converged))
    }
}

/// Reconciler for Cassandra clusters
pub struct Reconciler {
    client: Client,
    config: OperatorConfig,
    /// Signalled when a detached job finishes.
    job_events: UnboundedSender<()>,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(client: Client, config: OperatorConfig, job_events: UnboundedSender<()>) -> Self {
        Self {
            client,
            config,
            job_events,
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Run one pass over a cluster
    pub async fn reconcile(&self, cluster: &CassandraCluster) -> Result<PassReport> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        let spec = &cluster.spec;
        let identity = ClusterIdentity::new(name.as_str(), namespace.as_str());
        let owner = cluster.controller_owner_ref(&());

        spec.validate()?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        let selector = ListParams::default().labels(&labels::cassandra_selector(&name));

        let pod_list = pods.list(&selector).await?.items;
        let sts_list = statefulsets.list(&selector).await?.items;
        let nodes = if spec.host_port.enabled || spec.cassandra.zones_as_racks {
            Api::<Node>::all(self.client.clone())
                .list(&ListParams::default())
                .await?
                .items
        } else {
            Vec::new()
        };

        let mut view = MembershipView::from_objects(spec, &name, &pod_list, &sts_list);
        let resolver = AddressResolver::from_nodes(spec.host_port.clone(), &nodes);
        debug!(
            cluster = %name,
            members = view.members().len(),
            unready_dcs = ?view.unready_dcs(),
            "Membership snapshot"
        );

        self.reconcile_seed_labels(&pods, spec, &name, &mut view).await?;

        let gateway = ProberClient::new(
            render_url(&self.config.prober.local_url, &name, &namespace),
            self.config.prober.user.clone(),
            self.config.prober.password.clone(),
            self.config.prober_timeout(),
        )?;

        let facts = if view.is_empty() {
            info!(cluster = %name, "No cassandra pods yet, skipping pods config");
            None
        } else {
            let pod_ips_name = names::pod_ips_configmap(&name);
            let previous = self
                .config_map_data(&namespace, &pod_ips_name)
                .await?
                .unwrap_or_default();

            let facts = compute_pass(spec, &identity, &view, &resolver, &gateway, &previous).await?;

            if facts.pod_ips != previous {
                info!(cluster = %name, "Updating pod IPs configmap");
                self.apply_config_map(&namespace, &pod_ips_name, &name, owner.clone(), facts.pod_ips.clone())
                    .await?;
            }

            self.apply_config_map(
                &namespace,
                &names::pods_config_configmap(&name),
                &name,
                owner.clone(),
                pods_config::render(&facts.sheet),
            )
            .await?;

            metrics::set_member_decisions(&name, &facts.decisions);
            Some(facts)
        };

        let jobs = DecommissionJobTracker::new(Arc::new(ConfigMapJobStore::new(
            self.client.clone(),
            &namespace,
            &name,
            owner,
        )))
        .with_notifier(self.job_events.clone());

        let nodectl = JolokiaClient::new(
            render_url(&self.config.jolokia.url, &name, &namespace),
            self.config.jolokia.jmx_port,
            self.config.jolokia.user.clone(),
            self.config.jolokia.password.clone(),
            self.config.jolokia_timeout(),
        )?;

        let coordinator = ScaleCoordinator::new(
            &name,
            Arc::new(KubeReplicaStore::new(self.client.clone(), &namespace)),
            Arc::new(nodectl),
            jobs,
        );

        let addresses = match &facts {
            Some(facts) => facts.broadcast_addresses.clone(),
            None => BTreeMap::new(),
        };
        let intents = ScalingIntent::from_statefulsets(spec, &sts_list);
        let scale = coordinator.reconcile(spec, &intents, &view, &addresses).await?;

        Ok(PassReport {
            plan: facts.map(|f| f.plan),
            scale,
            ready_members: view.ready_members(),
        })
    }

    async fn reconcile_seed_labels(
        &self,
        pods: &Api<Pod>,
        spec: &CassandraClusterSpec,
        cluster_name: &str,
        view: &mut MembershipView,
    ) -> Result<()> {
        let changes = labels::seed_label_changes(spec, cluster_name, view.members());

        for (pod, change) in &changes {
            let value = match change {
                SeedLabelChange::Add => serde_json::Value::String(pod.clone()),
                SeedLabelChange::Remove => serde_json::Value::Null,
            };
            let mut seed_label = serde_json::Map::new();
            seed_label.insert(labels::CASSANDRA_CLUSTER_SEED.to_string(), value);
            let patch = serde_json::json!({ "metadata": { "labels": seed_label } });

            info!(pod = %pod, change = ?change, "Updating seed label");
            pods.patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }

        view.apply_seed_labels(&changes);
        Ok(())
    }

    async fn config_map_data(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|cm| cm.data.unwrap_or_default()))
    }

    /// Create the config map or replace its data if it differs. The
    /// replace is conditioned on the version read.
    async fn apply_config_map(
        &self,
        namespace: &str,
        name: &str,
        cluster_name: &str,
        owner: Option<OwnerReference>,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);

        let desired = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels::component_labels(cluster_name, labels::COMPONENT_CASSANDRA)),
                owner_references: owner.map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        match api.get_opt(name).await? {
            None => {
                info!(configmap = %name, "Creating configmap");
                api.create(&PostParams::default(), &desired).await?;
            }
            Some(actual) if actual.data.as_ref().map_or(false, |d| Some(d) == desired.data.as_ref()) => {
                debug!(configmap = %name, "No updates for configmap");
            }
            Some(actual) => {
                info!(configmap = %name, "Updating configmap");
                let mut updated = desired;
                updated.metadata.resource_version = actual.resource_version();
                updated.metadata.annotations = actual.metadata.annotations.clone();
                api.replace(name, &PostParams::default(), &updated).await?;
            }
        }

        Ok(())
    }
}
