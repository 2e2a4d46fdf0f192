//! Kubernetes controller for Cassandra clusters

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller as KubeController};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{CassandraCluster, CassandraClusterStatus, ClusterPhase};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconciler::Reconciler;

/// Controller state
pub struct ControllerState {
    /// Kubernetes client
    pub client: Client,
    /// Reconciler
    pub reconciler: Reconciler,
}

/// Main controller for CassandraCluster resources
pub struct Controller {
    client: Client,
    namespace: String,
    state: Arc<RwLock<ControllerState>>,
    job_events: mpsc::UnboundedReceiver<()>,
}

impl Controller {
    /// Create a new controller
    pub async fn new(config: OperatorConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        let (job_tx, job_events) = mpsc::unbounded();
        let namespace = config.namespace.clone();

        let state = ControllerState {
            client: client.clone(),
            reconciler: Reconciler::new(client.clone(), config, job_tx),
        };

        Ok(Self {
            client,
            namespace,
            state: Arc::new(RwLock::new(state)),
            job_events,
        })
    }

    /// Run the controller
    pub async fn run(self) -> Result<()> {
        info!("Starting Cassandra controller");

        let clusters: Api<CassandraCluster> = if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        };

        // Verify CRD is installed
        let lp = ListParams::default().limit(1);
        if let Err(e) = clusters.list(&lp).await {
            error!("Failed to list CassandraClusters. Is the CRD installed? Error: {}", e);
            return Err(e.into());
        }

        info!("CRD verification successful");

        KubeController::new(clusters, Config::default())
            .reconcile_all_on(self.job_events)
            .shutdown_on_signal()
            .run(
                |cluster, ctx| async move { reconcile(cluster, ctx).await },
                |cluster, error, ctx| error_policy(cluster, error, ctx),
                self.state,
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(name = %obj.name, ?action, "Reconciliation successful");
                    }
                    Err(e) => {
                        error!(error = %e, "Reconciliation error");
                    }
                }
            })
            .await;

        info!("Controller stopped");
        Ok(())
    }
}

/// Reconcile a CassandraCluster resource
async fn reconcile(cluster: Arc<CassandraCluster>, ctx: Arc<RwLock<ControllerState>>) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    info!(name = %name, namespace = %namespace, "Reconciling CassandraCluster");

    let state = ctx.read().await;
    let client = state.client.clone();
    let reconciler = &state.reconciler;
    let config = reconciler.config();

    let start = Instant::now();
    let result = reconciler.reconcile(&cluster).await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(report) => {
            metrics::record_reconciliation_success(&name, elapsed);
            update_status(&client, &namespace, &name, report.status()).await?;

            let requeue = if report.converging() {
                config.retry_delay()
            } else {
                config.resync_interval()
            };
            Ok(Action::requeue(requeue))
        }
        Err(e) => {
            metrics::record_reconciliation_failure(&name, elapsed);
            metrics::record_error(e.kind());

            let status = error_status(cluster.status.as_ref(), &e);
            match e.requeue_after(config) {
                Some(delay) => {
                    match &e {
                        Error::RegionNotReady(_) | Error::Gateway { .. } => {
                            warn!(name = %name, error = %e, "Region not ready, will retry")
                        }
                        _ => info!(name = %name, error = %e, ?delay, "Pass not complete, will retry"),
                    }
                    update_status(&client, &namespace, &name, status).await?;
                    Ok(Action::requeue(delay))
                }
                None => {
                    error!(name = %name, error = %e, "Reconciliation failed");
                    update_status(&client, &namespace, &name, status).await?;
                    Err(e)
                }
            }
        }
    }
}

/// Error policy for reconciliation failures
fn error_policy(_cluster: Arc<CassandraCluster>, error: &Error, ctx: Arc<RwLock<ControllerState>>) -> Action {
    warn!(error = %error, "Reconciliation error, will retry");

    // the state lock is only held for reading during a pass
    let delay = ctx
        .try_read()
        .map(|state| {
            error
                .requeue_after(state.reconciler.config())
                .unwrap_or_else(|| state.reconciler.config().resync_interval())
        })
        .unwrap_or(Duration::from_secs(60));
    Action::requeue(delay)
}

/// Status after a failed pass. Retryable errors keep the previous phase.
fn error_status(previous: Option<&CassandraClusterStatus>, error: &Error) -> CassandraClusterStatus {
    let previous = previous.cloned().unwrap_or_default();
    CassandraClusterStatus {
        phase: if error.is_retryable() {
            previous.phase.clone()
        } else {
            ClusterPhase::Failed
        },
        message: Some(error.to_string()),
        last_reconciled: Some(chrono::Utc::now().to_rfc3339()),
        ..previous
    }
}

/// Update the status of a CassandraCluster
async fn update_status(client: &Client, namespace: &str, name: &str, status: CassandraClusterStatus) -> Result<()> {
    let api: Api<CassandraCluster> = Api::namespaced(client.clone(), namespace);

    let patch = serde_json::json!({
        "status": status
    });

    let pp = PatchParams::apply("cassandra-operator");
    api.patch_status(name, &pp, &Patch::Merge(&patch)).await?;

    debug!(name = %name, "Status updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status() {
        let previous = CassandraClusterStatus {
            phase: ClusterPhase::Initializing,
            ready_nodes: 2,
            initializing_dc: Some("dc1".to_string()),
            ..Default::default()
        };

        let status = error_status(Some(&previous), &Error::PodNotScheduled("dc1-2".to_string()));
        assert_eq!(status.phase, ClusterPhase::Initializing);
        assert_eq!(status.ready_nodes, 2);
        assert!(status.message.unwrap().contains("dc1-2"));

        let status = error_status(Some(&previous), &Error::ConfigInvariant("pod missing".to_string()));
        assert_eq!(status.phase, ClusterPhase::Failed);

        let status = error_status(None, &Error::RegionNotReady("region2".to_string()));
        assert_eq!(status.phase, ClusterPhase::Pending);
    }
}
