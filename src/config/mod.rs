//! Configuration module for the operator.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the operator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespace to watch (empty for all namespaces).
    pub namespace: String,
    /// Metrics server port.
    pub metrics_port: u16,
    /// Health check port.
    pub health_port: u16,
    /// Log level.
    pub log_level: String,
    /// Requeue timings.
    pub requeue: RequeueConfig,
    /// Prober (cross-region gateway) settings.
    pub prober: ProberConfig,
    /// Jolokia (node control) settings.
    pub jolokia: JolokiaConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            metrics_port: 8080,
            health_port: 8081,
            log_level: "info".to_string(),
            requeue: RequeueConfig::default(),
            prober: ProberConfig::default(),
            jolokia: JolokiaConfig::default(),
        }
    }
}

/// Delays between reconciliation passes, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequeueConfig {
    /// Delay after a not-yet-schedulable pod or other transient condition.
    pub retry_secs: u64,
    /// Delay after a peer region could not be reached.
    pub region_retry_secs: u64,
    /// Delay while a decommission is in progress.
    pub decommission_poll_secs: u64,
    /// Periodic resync of a converged cluster.
    pub resync_secs: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            retry_secs: 10,
            region_retry_secs: 5,
            decommission_poll_secs: 10,
            resync_secs: 60,
        }
    }
}

/// Prober settings. The prober is the per-region HTTP service other regions
/// talk to for seeds and readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProberConfig {
    /// URL template of the local prober service. `{name}` and `{namespace}`
    /// are substituted with the cluster's name and namespace.
    pub local_url: String,
    /// Basic auth user.
    pub user: String,
    /// Basic auth password.
    pub password: String,
    /// Per-request timeout, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            local_url: "http://{name}-cassandra-prober.{namespace}.svc.cluster.local".to_string(),
            user: String::new(),
            password: String::new(),
            timeout_ms: 5000,
        }
    }
}

/// Jolokia settings for JMX-over-HTTP node control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JolokiaConfig {
    /// URL template of the jolokia proxy, see [`ProberConfig::local_url`].
    pub url: String,
    /// JMX port of cassandra nodes.
    pub jmx_port: u16,
    /// JMX user.
    pub user: String,
    /// JMX password.
    pub password: String,
    /// Per-request timeout, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for JolokiaConfig {
    fn default() -> Self {
        Self {
            url: "http://{name}-cassandra-prober.{namespace}.svc.cluster.local:8080".to_string(),
            jmx_port: 7199,
            user: String::new(),
            password: String::new(),
            timeout_ms: 10000,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            field: "config".to_string(),
            reason: format!("Failed to read config file {}: {}", path.display(), e),
        })?;

        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.metrics_port == self.health_port {
            return Err(Error::InvalidConfig {
                field: "health_port".to_string(),
                reason: "Health and metrics ports must differ".to_string(),
            });
        }

        if self.prober.timeout_ms == 0 {
            return Err(Error::InvalidConfig {
                field: "prober.timeout_ms".to_string(),
                reason: "Timeout must be non-zero".to_string(),
            });
        }

        if self.jolokia.timeout_ms == 0 {
            return Err(Error::InvalidConfig {
                field: "jolokia.timeout_ms".to_string(),
                reason: "Timeout must be non-zero".to_string(),
            });
        }

        if self.requeue.retry_secs == 0 || self.requeue.region_retry_secs == 0 {
            return Err(Error::InvalidConfig {
                field: "requeue".to_string(),
                reason: "Retry delays must be non-zero".to_string(),
            });
        }

        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(Error::InvalidConfig {
                field: "log_level".to_string(),
                reason: format!("Unknown log level {:?}", self.log_level),
            });
        }

        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.requeue.retry_secs)
    }

    pub fn region_retry_delay(&self) -> Duration {
        Duration::from_secs(self.requeue.region_retry_secs)
    }

    pub fn decommission_poll_delay(&self) -> Duration {
        Duration::from_secs(self.requeue.decommission_poll_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.requeue.resync_secs)
    }

    pub fn prober_timeout(&self) -> Duration {
        Duration::from_millis(self.prober.timeout_ms)
    }

    pub fn jolokia_timeout(&self) -> Duration {
        Duration::from_millis(self.jolokia.timeout_ms)
    }
}

/// Substitute `{name}` and `{namespace}` in a URL template.
pub fn render_url(template: &str, name: &str, namespace: &str) -> String {
    template
        .replace("{name}", name)
        .replace("{namespace}", namespace)
}
