//! Read-only snapshot of the cluster's members and datacenters.
//!
//! A [`MembershipView`] is rebuilt at the start of every pass from the live
//! Pods and StatefulSets, and is the only input the decision logic reads
//! about local nodes. Members are kept sorted by name so that everything
//! derived from the view iterates in a stable order.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::crd::CassandraClusterSpec;
use crate::labels::{self, SeedLabelChange};
use crate::names;

/// One running cassandra process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub uid: String,
    pub dc: String,
    pub ordinal: i32,
    /// Pod address, unknown until the pod is scheduled and started.
    pub pod_ip: Option<String>,
    /// Hosting node, unknown until the pod is scheduled.
    pub node_name: Option<String>,
    /// All containers report ready.
    pub ready: bool,
    /// Carries the seed label.
    pub seed: bool,
}

impl Member {
    /// Build a member from a pod. Pods without a datacenter label are not members.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.name_any();
        let pod_labels = pod.labels();
        let dc = pod_labels.get(labels::CASSANDRA_CLUSTER_DC)?.clone();
        let ordinal = names::pod_ordinal(&name)?;

        let status = pod.status.as_ref();
        let pod_ip = status
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty());
        let ready = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready))
            .unwrap_or(false);
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .filter(|n| !n.is_empty());

        Some(Self {
            uid: pod.uid().unwrap_or_default(),
            seed: pod_labels.contains_key(labels::CASSANDRA_CLUSTER_SEED),
            name,
            dc,
            ordinal,
            pod_ip,
            node_name,
            ready,
        })
    }
}

/// Desired vs observed replicas of a datacenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatacenterStatus {
    pub name: String,
    pub desired_replicas: i32,
    /// `None` while the StatefulSet doesn't exist yet.
    pub ready_replicas: Option<i32>,
}

impl DatacenterStatus {
    pub fn is_ready(&self) -> bool {
        match self.ready_replicas {
            None => false,
            Some(ready) => ready == self.desired_replicas && !(ready == 0 && self.desired_replicas != 0),
        }
    }
}

/// Snapshot of members and datacenters for one pass.
#[derive(Debug, Clone, Default)]
pub struct MembershipView {
    members: Vec<Member>,
    datacenters: Vec<DatacenterStatus>,
}

impl MembershipView {
    pub fn new(mut members: Vec<Member>, datacenters: Vec<DatacenterStatus>) -> Self {
        members.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            members,
            datacenters,
        }
    }

    /// Build the view from live objects. Datacenters keep the declared order.
    pub fn from_objects(
        spec: &CassandraClusterSpec,
        cluster_name: &str,
        pods: &[Pod],
        statefulsets: &[StatefulSet],
    ) -> Self {
        let ready_by_sts: BTreeMap<String, i32> = statefulsets
            .iter()
            .map(|sts| {
                let ready = sts
                    .status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                (sts.name_any(), ready)
            })
            .collect();

        let datacenters = spec
            .dcs
            .iter()
            .map(|dc| DatacenterStatus {
                name: dc.name.clone(),
                desired_replicas: dc.replicas,
                ready_replicas: ready_by_sts.get(&names::dc(cluster_name, &dc.name)).copied(),
            })
            .collect();

        let members = pods.iter().filter_map(Member::from_pod).collect();
        Self::new(members, datacenters)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn datacenters(&self) -> &[DatacenterStatus] {
        &self.datacenters
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members_in_dc<'a>(&'a self, dc: &'a str) -> impl Iterator<Item = &'a Member> + 'a {
        self.members.iter().filter(move |m| m.dc == dc)
    }

    /// Datacenters whose ready replicas differ from desired, in declared order.
    pub fn unready_dcs(&self) -> Vec<&str> {
        self.datacenters
            .iter()
            .filter(|dc| !dc.is_ready())
            .map(|dc| dc.name.as_str())
            .collect()
    }

    /// Number of ready members across all datacenters.
    pub fn ready_members(&self) -> usize {
        self.members.iter().filter(|m| m.ready).count()
    }

    /// True when every seed member of `dc` is ready. False for an empty view.
    pub fn dc_seeds_ready(&self, dc: &str) -> bool {
        if self.members.is_empty() {
            return false;
        }
        self.members_in_dc(dc).filter(|m| m.seed).all(|m| m.ready)
    }

    /// First not-ready non-seed member of `dc` by name.
    pub fn next_non_seed<'a>(&'a self, dc: &'a str) -> Option<&'a Member> {
        self.members_in_dc(dc).find(|m| !m.seed && !m.ready)
    }

    /// Reflect seed label changes applied during the pass.
    pub fn apply_seed_labels(&mut self, changes: &[(String, SeedLabelChange)]) {
        for (name, change) in changes {
            if let Some(m) = self.members.iter_mut().find(|m| &m.name == name) {
                m.seed = *change == SeedLabelChange::Add;
            }
        }
    }
}
