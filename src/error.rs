//! Error types for the Cassandra operator
//!
//! Errors fall into two groups. Retryable conditions (a pod without an
//! address, an unreachable peer region, a decommission that cannot yet be
//! confirmed, optimistic-concurrency conflicts) end the pass early and ask the
//! controller to requeue. Everything else is fatal for the pass and is
//! surfaced to the caller.

use std::time::Duration;

use thiserror::Error;

use crate::config::OperatorConfig;

/// Main error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("One of pods is not scheduled yet: {0}")]
    PodNotScheduled(String),

    #[error("One of the regions is not ready: {0}")]
    RegionNotReady(String),

    #[error("Configuration invariant violated: {0}")]
    ConfigInvariant(String),

    #[error("Decommission of {pod} not confirmed yet, some peer node(s) still see the node as live: {source}")]
    DecommissionUnconfirmed {
        pod: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Node control request to {address} failed: {reason}")]
    NodeControl { address: String, reason: String },

    #[error("Prober request to {host} failed: {reason}")]
    Gateway { host: String, reason: String },

    #[error("Job {0} conflict")]
    JobConflict(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout waiting for {0}")]
    Timeout(String),
}

impl Error {
    /// Check if the pass should be retried after a delay instead of failing.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::PodNotScheduled(_)
            | Error::RegionNotReady(_)
            | Error::DecommissionUnconfirmed { .. }
            | Error::NodeControl { .. }
            | Error::Gateway { .. }
            | Error::JobConflict(_)
            | Error::Http(_)
            | Error::Timeout(_) => true,
            Error::Kube(e) => is_transient(e),
            Error::ConfigInvariant(_) | Error::InvalidConfig { .. } | Error::Serialization(_) => {
                false
            }
        }
    }

    /// Delay before the next pass for a retryable error.
    pub fn requeue_after(&self, config: &OperatorConfig) -> Option<Duration> {
        if !self.is_retryable() {
            return None;
        }

        match self {
            Error::RegionNotReady(_) | Error::Gateway { .. } => Some(config.region_retry_delay()),
            Error::DecommissionUnconfirmed { .. } => Some(config.decommission_poll_delay()),
            Error::Kube(e) if is_conflict(e) => Some(Duration::from_secs(1)),
            Error::JobConflict(_) => Some(Duration::from_secs(1)),
            _ => Some(config.retry_delay()),
        }
    }

    /// Short, stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::PodNotScheduled(_) => "pod_not_scheduled",
            Error::RegionNotReady(_) => "region_not_ready",
            Error::ConfigInvariant(_) => "config_invariant",
            Error::DecommissionUnconfirmed { .. } => "decommission_unconfirmed",
            Error::NodeControl { .. } => "node_control",
            Error::Gateway { .. } => "gateway",
            Error::JobConflict(_) => "job_conflict",
            Error::Http(_) => "http",
            Error::InvalidConfig { .. } => "invalid_config",
            Error::Serialization(_) => "serialization",
            Error::Timeout(_) => "timeout",
        }
    }
}

/// Returns true for HTTP 409 responses from the API server.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// Returns true for API server errors worth retrying: conflicts, throttling,
/// server-side failures and anything that never got a response.
pub fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => resp.code == 409 || resp.code == 429 || resp.code >= 500,
        kube::Error::SerdeError(_) | kube::Error::BuildRequest(_) => false,
        _ => true,
    }
}

/// Returns true for HTTP 404 responses from the API server.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Result type alias for operator operations.
pub type Result<T> = std::result::Result<T, Error>;
