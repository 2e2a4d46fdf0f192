//! Cassandra Kubernetes Operator
//!
//! Coordinates bootstrap order and scaling of Cassandra clusters on Kubernetes.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use cassandra_operator::config::OperatorConfig;
use cassandra_operator::controller::Controller;
use cassandra_operator::metrics;

#[derive(Parser, Debug)]
#[command(name = "cassandra-operator")]
#[command(about = "Kubernetes Operator for multi-region Cassandra clusters")]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Namespace to watch (empty for all namespaces)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Metrics server port
    #[arg(short, long)]
    metrics_port: Option<u16>,

    /// Health check port
    #[arg(short = 'H', long)]
    health_port: Option<u16>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the configuration file, if any, and apply flag overrides.
    fn into_config(self) -> cassandra_operator::Result<OperatorConfig> {
        let mut config = match &self.config {
            Some(path) => OperatorConfig::from_file(path)?,
            None => OperatorConfig::default(),
        };

        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(port) = self.health_port {
            config.health_port = port;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    // Initialize logging
    let level = match config.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Cassandra Kubernetes Operator");
    info!(namespace = %config.namespace, "Watching namespace");

    let metrics_handle = tokio::spawn(metrics::run_metrics_server(config.metrics_port));
    let health_handle = tokio::spawn(metrics::run_health_server(config.health_port));

    let controller = Controller::new(config).await?;
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!(error = %e, "Cluster controller error");
        }
    });

    info!("Controller started");

    // Wait for any task to complete (usually due to shutdown signal)
    tokio::select! {
        _ = controller_handle => info!("Cluster controller stopped"),
        result = metrics_handle => match result {
            Ok(Err(e)) => error!(error = %e, "Metrics server failed"),
            _ => info!("Metrics server stopped"),
        },
        result = health_handle => match result {
            Ok(Err(e)) => error!(error = %e, "Health server failed"),
            _ => info!("Health server stopped"),
        },
    }

    Ok(())
}
