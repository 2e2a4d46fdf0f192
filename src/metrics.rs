//! Prometheus metrics for the Cassandra operator

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_counter,
    CounterVec, GaugeVec, HistogramVec, IntCounter, TextEncoder,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::init_order::{InitDecision, PauseReason};

lazy_static::lazy_static! {
    /// Total reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "cassandra_operator_reconciliations_total",
        "Total number of reconciliations",
        &["cluster", "result"]
    ).unwrap();

    /// Reconciliation duration
    pub static ref RECONCILIATION_DURATION: HistogramVec = register_histogram_vec!(
        "cassandra_operator_reconciliation_duration_seconds",
        "Duration of reconciliations",
        &["cluster"]
    ).unwrap();

    /// Members by init decision
    pub static ref PAUSED_MEMBERS: GaugeVec = register_gauge_vec!(
        "cassandra_operator_members",
        "Number of cassandra members by pause reason",
        &["cluster", "reason"]
    ).unwrap();

    /// Decommissions started
    pub static ref DECOMMISSIONS_STARTED: IntCounter = register_int_counter!(
        "cassandra_operator_decommissions_started_total",
        "Total number of node decommissions started"
    ).unwrap();

    /// Decommissions confirmed and scaled down
    pub static ref DECOMMISSIONS_COMPLETED: IntCounter = register_int_counter!(
        "cassandra_operator_decommissions_completed_total",
        "Total number of node decommissions completed"
    ).unwrap();

    /// Operator errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "cassandra_operator_errors_total",
        "Total number of errors",
        &["type"]
    ).unwrap();
}

/// Run the metrics server
pub async fn run_metrics_server(port: u16) -> std::io::Result<()> {
    serve(port, "Metrics", || {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&prometheus::gather())
            .unwrap_or_default()
    })
    .await
}

/// Run the liveness endpoint
pub async fn run_health_server(port: u16) -> std::io::Result<()> {
    serve(port, "Health", || "ok".to_string()).await
}

async fn serve<F>(port: u16, name: &str, body: F) -> std::io::Result<()>
where
    F: Fn() -> String + Send + Sync + Copy + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "{} server started", name);

    loop {
        match listener.accept().await {
            Ok((mut socket, _)) => {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;

                    let body = body();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
            Err(e) => debug!(error = %e, "Accept failed"),
        }
    }
}

/// Record a successful reconciliation
pub fn record_reconciliation_success(cluster: &str, duration_secs: f64) {
    RECONCILIATIONS.with_label_values(&[cluster, "success"]).inc();
    RECONCILIATION_DURATION
        .with_label_values(&[cluster])
        .observe(duration_secs);
}

/// Record a failed reconciliation
pub fn record_reconciliation_failure(cluster: &str, duration_secs: f64) {
    RECONCILIATIONS.with_label_values(&[cluster, "failure"]).inc();
    RECONCILIATION_DURATION
        .with_label_values(&[cluster])
        .observe(duration_secs);
}

/// Publish the number of members per decision reason
pub fn set_member_decisions(cluster: &str, decisions: &BTreeMap<String, InitDecision>) {
    let all = [
        InitDecision::Run,
        InitDecision::Pause(PauseReason::OtherRegions),
        InitDecision::Pause(PauseReason::OtherDcs),
        InitDecision::Pause(PauseReason::SeedNodes),
        InitDecision::Pause(PauseReason::OtherNonSeedNodes),
    ];
    for decision in all {
        let count = decisions.values().filter(|d| **d == decision).count();
        PAUSED_MEMBERS
            .with_label_values(&[cluster, decision.reason()])
            .set(count as f64);
    }
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
