//! Cassandra operator - bootstrap ordering and scaling of multi-datacenter,
//! multi-region Cassandra clusters on Kubernetes.
//!
//! Every reconciliation pass rebuilds a snapshot of the cluster and decides,
//! for each node, whether it may start or must wait, and why. Scale-down is
//! driven through an orchestrated decommission guarded by a single-flight
//! job registry.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  controller: kube-runtime loop, requeue policy, status      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  reconciler: one pass against the API server                │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  init_order | pods_config    │  scaling | jobs              │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  membership | address | seeds                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  gateway (prober HTTP) | nodectl (jolokia)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use cassandra_operator::init_order::{decide, plan_from, InitDecision, PauseReason};
//! use cassandra_operator::membership::{DatacenterStatus, Member, MembershipView};
//!
//! let member = |ordinal: i32, seed: bool, ready: bool| Member {
//!     name: format!("demo-cassandra-dc1-{}", ordinal),
//!     uid: format!("uid{}", ordinal),
//!     dc: "dc1".to_string(),
//!     ordinal,
//!     pod_ip: Some(format!("10.0.0.{}", ordinal + 1)),
//!     node_name: Some("node1".to_string()),
//!     ready,
//!     seed,
//! };
//!
//! let view = MembershipView::new(
//!     vec![member(0, true, false), member(1, false, false)],
//!     vec![DatacenterStatus { name: "dc1".to_string(), desired_replicas: 2, ready_replicas: Some(0) }],
//! );
//!
//! let decisions = decide(&plan_from(&view, None), &view);
//! assert_eq!(decisions["demo-cassandra-dc1-0"], InitDecision::Run);
//! assert_eq!(decisions["demo-cassandra-dc1-1"], InitDecision::Pause(PauseReason::SeedNodes));
//! ```

pub mod config;
pub mod error;

pub mod address;
pub mod controller;
pub mod crd;
pub mod gateway;
pub mod init_order;
pub mod jobs;
pub mod labels;
pub mod membership;
pub mod metrics;
pub mod names;
pub mod nodectl;
pub mod pods_config;
pub mod reconciler;
pub mod scaling;
pub mod seeds;

pub use error::{Error, Result};
