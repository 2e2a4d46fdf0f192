//! Bootstrap ordering.
//!
//! Cassandra nodes must join one at a time: a datacenter's seeds first, then
//! its non-seed nodes one by one, datacenters in declared order, and regions
//! in the order of their identifiers. The order is recomputed from scratch on
//! every pass; nothing about it is stored.
//!
//! The computation has two halves. [`plan`] decides which region and which
//! datacenter are allowed to make progress, talking to peer regions when the
//! cluster spans several. [`decide`] is a pure function of the plan and the
//! membership view that yields a [`InitDecision`] for every member.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info};

use crate::crd::CassandraClusterSpec;
use crate::error::Result;
use crate::gateway::{regions_readiness, CrossRegionGateway};
use crate::membership::MembershipView;
use crate::seeds::ClusterIdentity;

/// Why a member must not start yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PauseReason {
    OtherRegions,
    OtherDcs,
    SeedNodes,
    OtherNonSeedNodes,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::OtherRegions => "waiting for other regions to init",
            PauseReason::OtherDcs => "waiting for other DCs to init",
            PauseReason::SeedNodes => "waiting for seed nodes to init",
            PauseReason::OtherNonSeedNodes => {
                "waiting for other non seed nodes since only one non seed node can start at a time"
            }
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start permission of one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitDecision {
    Run,
    Pause(PauseReason),
}

impl InitDecision {
    pub fn is_paused(&self) -> bool {
        matches!(self, InitDecision::Pause(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            InitDecision::Run => "pod is not paused",
            InitDecision::Pause(reason) => reason.as_str(),
        }
    }
}

/// Which part of the cluster may make progress during this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitPlan {
    /// Nothing to order: every member may run.
    Converged,
    /// Another region initializes first.
    RegionPaused { next_region: String },
    /// Only this local datacenter may bring up new members.
    InitializingDc(String),
}

/// Readiness of every region taking part in bring-up, local one included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionReadiness {
    pub local: String,
    pub regions: BTreeMap<String, bool>,
}

impl RegionReadiness {
    pub fn local_ready(&self) -> bool {
        self.regions.get(&self.local).copied().unwrap_or(false)
    }

    /// First not-ready region by identifier.
    pub fn next_region(&self) -> Option<&str> {
        self.regions
            .iter()
            .find(|(_, ready)| !**ready)
            .map(|(region, _)| region.as_str())
    }
}

/// Plan from local datacenter readiness and, for multi-region clusters,
/// region readiness.
pub fn plan_from(view: &MembershipView, regions: Option<&RegionReadiness>) -> InitPlan {
    let next_local_dc = view.unready_dcs().first().map(|dc| dc.to_string());

    let Some(regions) = regions else {
        return next_local_dc.map_or(InitPlan::Converged, InitPlan::InitializingDc);
    };

    let Some(next_region) = regions.next_region() else {
        debug!("All regions are ready");
        return InitPlan::Converged;
    };

    if regions.local_ready() {
        debug!(region = %regions.local, "Current region is initialized");
        return InitPlan::Converged;
    }

    if next_region != regions.local {
        info!(
            region = %regions.local,
            next_region = %next_region,
            "Current region initialization is paused, waiting for region to be ready"
        );
        return InitPlan::RegionPaused {
            next_region: next_region.to_string(),
        };
    }

    match next_local_dc {
        Some(dc) => {
            info!(region = %regions.local, dc = %dc, "Current region is initializing");
            InitPlan::InitializingDc(dc)
        }
        None => InitPlan::Converged,
    }
}

/// Build the plan for a pass, querying peer regions when cross-region
/// gating applies. Any gateway failure fails the whole plan.
pub async fn plan(
    spec: &CassandraClusterSpec,
    cluster: &ClusterIdentity,
    view: &MembershipView,
    gateway: &dyn CrossRegionGateway,
) -> Result<InitPlan> {
    if !spec.multi_region() {
        return Ok(plan_from(view, None));
    }

    let managed = cluster.managed_regions(spec);
    let mut regions = regions_readiness(gateway, &managed).await?;

    let local = cluster.local_region(spec);
    regions.insert(local.clone(), view.unready_dcs().is_empty());

    Ok(plan_from(view, Some(&RegionReadiness { local, regions })))
}

/// Decision for every member, keyed by member name.
pub fn decide(plan: &InitPlan, view: &MembershipView) -> BTreeMap<String, InitDecision> {
    let dc = match plan {
        InitPlan::Converged => {
            return view
                .members()
                .iter()
                .map(|m| (m.name.clone(), InitDecision::Run))
                .collect();
        }
        InitPlan::RegionPaused { .. } => {
            return view
                .members()
                .iter()
                .map(|m| (m.name.clone(), InitDecision::Pause(PauseReason::OtherRegions)))
                .collect();
        }
        InitPlan::InitializingDc(dc) => dc.as_str(),
    };

    let seeds_ready = view.dc_seeds_ready(dc);
    let next_non_seed = view.next_non_seed(dc).map(|m| m.name.as_str());

    view.members()
        .iter()
        .map(|m| {
            let decision = if m.dc != dc {
                InitDecision::Pause(PauseReason::OtherDcs)
            } else if m.seed {
                InitDecision::Run
            } else if !seeds_ready {
                InitDecision::Pause(PauseReason::SeedNodes)
            } else if m.ready || next_non_seed == Some(m.name.as_str()) {
                InitDecision::Run
            } else {
                InitDecision::Pause(PauseReason::OtherNonSeedNodes)
            };
            (m.name.clone(), decision)
        })
        .collect()
}
