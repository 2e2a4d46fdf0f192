//! Custom Resource Definitions for Cassandra clusters

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};

// ============================================================================
// CassandraCluster CRD
// ============================================================================

/// CassandraCluster represents a multi-datacenter Cassandra cluster
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "db.ibm.com",
    version = "v1alpha1",
    kind = "CassandraCluster",
    plural = "cassandraclusters",
    shortname = "cc",
    status = "CassandraClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyNodes"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraClusterSpec {
    /// Datacenters in bring-up order
    pub dcs: Vec<Dc>,

    /// Cassandra settings
    #[serde(default)]
    pub cassandra: CassandraConfig,

    /// Host network exposure
    #[serde(default)]
    pub host_port: HostPort,

    /// Ingress of this region's prober
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Other regions of the same cluster
    #[serde(default)]
    pub external_regions: ExternalRegions,
}

/// A named, independently scaled group of nodes
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Dc {
    pub name: String,
    pub replicas: i32,
}

/// Cassandra settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CassandraConfig {
    /// Number of seed nodes per datacenter
    #[serde(default = "default_num_seeds")]
    pub num_seeds: i32,

    /// Use the hosting node's topology zone as the cassandra rack
    #[serde(default)]
    pub zones_as_racks: bool,
}

impl Default for CassandraConfig {
    fn default() -> Self {
        Self {
            num_seeds: default_num_seeds(),
            zones_as_racks: false,
        }
    }
}

fn default_num_seeds() -> i32 {
    2
}

/// Host network exposure configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostPort {
    #[serde(default)]
    pub enabled: bool,

    /// Advertise the host's external address instead of the internal one
    #[serde(default, rename = "useExternalHostIP")]
    pub use_external_host_ip: bool,
}

/// Ingress configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    #[serde(default)]
    pub domain: String,
}

/// Regions cooperating with this one
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRegions {
    /// Regions run by another instance of this operator
    #[serde(default)]
    pub managed: Vec<ManagedRegion>,

    /// Regions with a static seed list
    #[serde(default)]
    pub unmanaged: Vec<UnmanagedRegion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManagedRegion {
    /// Ingress domain of the region's prober
    pub domain: String,

    /// Namespace of the cluster in that region, defaults to the local one
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct UnmanagedRegion {
    pub seeds: Vec<String>,
}

// ============================================================================
// Status
// ============================================================================

/// Status of a CassandraCluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CassandraClusterStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Number of ready nodes across local datacenters
    #[serde(default)]
    pub ready_nodes: i32,

    /// Datacenter currently initializing
    #[serde(default)]
    pub initializing_dc: Option<String>,

    /// Pod currently being decommissioned
    #[serde(default)]
    pub decommissioning: Option<String>,

    /// Status message
    #[serde(default)]
    pub message: Option<String>,

    /// Last pass timestamp
    #[serde(default)]
    pub last_reconciled: Option<String>,
}

/// Cluster phase
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Initializing,
    WaitingForRegions,
    Running,
    Scaling,
    Failed,
}

impl CassandraClusterSpec {
    /// Reject specs the coordinator can't converge.
    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for dc in &self.dcs {
            if !names.insert(dc.name.as_str()) {
                return Err(Error::ConfigInvariant(format!(
                    "dc {} is declared more than once",
                    dc.name
                )));
            }
            if dc.replicas < 0 {
                return Err(Error::ConfigInvariant(format!(
                    "number of replicas can't be negative for dc {}",
                    dc.name
                )));
            }
            if self.cassandra.num_seeds == 1 && dc.replicas == 1 {
                continue;
            }
            if self.cassandra.num_seeds > dc.replicas {
                return Err(Error::ConfigInvariant(format!(
                    "number of seeds ({}) is greater than number of replicas ({}) for dc {}",
                    self.cassandra.num_seeds, dc.replicas, dc.name
                )));
            }
        }

        if self
            .external_regions
            .managed
            .iter()
            .any(|r| r.domain.is_empty())
        {
            return Err(Error::ConfigInvariant(
                "managed region must have a domain".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether cross-region gating applies.
    pub fn multi_region(&self) -> bool {
        self.host_port.enabled && !self.external_regions.managed.is_empty()
    }

    pub fn dc(&self, name: &str) -> Option<&Dc> {
        self.dcs.iter().find(|dc| dc.name == name)
    }
}
