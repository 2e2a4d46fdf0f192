//! Per-pod fact sheets.
//!
//! The fact sheet is what each node's startup wrapper reads before launching
//! cassandra: whether to pause, why, which addresses to advertise and which
//! seeds to contact. It is rendered into the pods config map, one entry per
//! pod instance, and must be identical for identical inputs so that passes
//! with no real change never restart a node.

use std::collections::BTreeMap;
use std::fmt::Write;

use tracing::debug;

use crate::address::AddressResolver;
use crate::crd::CassandraClusterSpec;
use crate::error::{Error, Result};
use crate::init_order::InitDecision;
use crate::membership::MembershipView;

pub const GOSSIPING_SNITCH: &str = "GossipingPropertyFileSnitch";

/// Everything a node needs to know about itself for this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodFacts {
    pub uid: String,
    pub decision: InitDecision,
    pub broadcast_address: String,
    pub broadcast_rpc_address: String,
    /// Last address the node was ready with, empty if never seen ready.
    pub previous_address: String,
    pub seeds: Vec<String>,
    pub rack: Option<String>,
    pub snitch: Option<&'static str>,
}

impl PodFacts {
    /// Config map key of the pod instance. Includes the uid so that a
    /// recreated pod never reads its predecessor's entry.
    pub fn entry_name(&self, pod: &str) -> String {
        format!("{}_{}.sh", pod, self.uid)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(rack) = &self.rack {
            let _ = writeln!(out, "export CASSANDRA_RACK={}", rack);
        }
        if let Some(snitch) = self.snitch {
            let _ = writeln!(out, "export CASSANDRA_ENDPOINT_SNITCH={}", snitch);
        }
        let _ = writeln!(out, "export CASSANDRA_BROADCAST_ADDRESS={}", self.broadcast_address);
        let _ = writeln!(out, "export CASSANDRA_BROADCAST_RPC_ADDRESS={}", self.broadcast_rpc_address);
        let _ = writeln!(out, "export CASSANDRA_SEEDS={}", self.seeds.join(","));
        let _ = writeln!(out, "export CASSANDRA_NODE_PREVIOUS_IP={}", self.previous_address);
        let _ = writeln!(out, "export PAUSE_INIT={}", self.decision.is_paused());
        let _ = writeln!(out, "export PAUSE_REASON=\"{}\"", self.decision.reason());
        out
    }
}

/// Fact sheets keyed by pod name.
pub type FactSheet = BTreeMap<String, PodFacts>;

/// Build the fact sheet of every member. Fails with `PodNotScheduled` if
/// any member has no address yet: a partial sheet is never produced.
pub fn build(
    spec: &CassandraClusterSpec,
    view: &MembershipView,
    resolver: &AddressResolver,
    broadcast_addresses: &BTreeMap<String, String>,
    seeds: &[String],
    decisions: &BTreeMap<String, InitDecision>,
    previous_addresses: &BTreeMap<String, String>,
) -> Result<FactSheet> {
    let mut sheet = FactSheet::new();

    for member in view.members() {
        let pod_ip = member
            .pod_ip
            .clone()
            .ok_or_else(|| Error::PodNotScheduled(member.name.clone()))?;

        let broadcast_address = broadcast_addresses
            .get(&member.name)
            .filter(|a| !a.is_empty())
            .cloned()
            .ok_or_else(|| Error::PodNotScheduled(member.name.clone()))?;

        let decision = *decisions.get(&member.name).ok_or_else(|| {
            Error::ConfigInvariant(format!("no init decision for pod {}", member.name))
        })?;

        let (rack, snitch) = if spec.cassandra.zones_as_racks {
            (
                Some(resolver.zone(member)?.unwrap_or_default()),
                Some(GOSSIPING_SNITCH),
            )
        } else {
            (None, None)
        };

        sheet.insert(
            member.name.clone(),
            PodFacts {
                uid: member.uid.clone(),
                decision,
                broadcast_address,
                broadcast_rpc_address: pod_ip,
                previous_address: previous_addresses.get(&member.name).cloned().unwrap_or_default(),
                seeds: seeds.to_vec(),
                rack,
                snitch,
            },
        );
    }

    Ok(sheet)
}

/// Config map data for a fact sheet.
pub fn render(sheet: &FactSheet) -> BTreeMap<String, String> {
    sheet
        .iter()
        .map(|(pod, facts)| (facts.entry_name(pod), facts.render()))
        .collect()
}

/// Update the last known address of every ready member whose address
/// changed. Entries of pods that no longer exist are kept so a node
/// coming back after a scale-down still finds its old address.
pub fn merge_previous_addresses(
    previous: &BTreeMap<String, String>,
    view: &MembershipView,
    broadcast_addresses: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = previous.clone();

    for member in view.members().iter().filter(|m| m.ready) {
        let Some(address) = broadcast_addresses.get(&member.name).filter(|a| !a.is_empty()) else {
            continue;
        };
        if merged.get(&member.name) != Some(address) {
            debug!(pod = %member.name, address = %address, "Recording pod address");
            merged.insert(member.name.clone(), address.clone());
        }
    }

    merged
}
