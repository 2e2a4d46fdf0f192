//! Node control channel.
//!
//! Administrative operations issued directly against a running cassandra
//! node, independent of the kubernetes object store. The production
//! implementation talks JMX through a jolokia proxy.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

const MBEAN_STORAGE_SERVICE: &str = "org.apache.cassandra.db:type=StorageService";

/// Operation mode reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Starting,
    Normal,
    Joining,
    Leaving,
    Decommissioned,
    Moving,
    Draining,
    Drained,
}

impl FromStr for OperationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(OperationMode::Starting),
            "NORMAL" => Ok(OperationMode::Normal),
            "JOINING" => Ok(OperationMode::Joining),
            "LEAVING" => Ok(OperationMode::Leaving),
            "DECOMMISSIONED" => Ok(OperationMode::Decommissioned),
            "MOVING" => Ok(OperationMode::Moving),
            "DRAINING" => Ok(OperationMode::Draining),
            "DRAINED" => Ok(OperationMode::Drained),
            other => Err(format!("unknown operation mode {}", other)),
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationMode::Starting => "STARTING",
            OperationMode::Normal => "NORMAL",
            OperationMode::Joining => "JOINING",
            OperationMode::Leaving => "LEAVING",
            OperationMode::Decommissioned => "DECOMMISSIONED",
            OperationMode::Moving => "MOVING",
            OperationMode::Draining => "DRAINING",
            OperationMode::Drained => "DRAINED",
        };
        write!(f, "{}", s)
    }
}

/// Gossip view of the ring as seen by one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterView {
    #[serde(default)]
    pub live_nodes: Vec<String>,
    #[serde(default)]
    pub leaving_nodes: Vec<String>,
    #[serde(default)]
    pub joining_nodes: Vec<String>,
    #[serde(default)]
    pub unreachable_nodes: Vec<String>,
    #[serde(default)]
    pub moving_nodes: Vec<String>,
}

/// Direct administrative channel to a node.
#[async_trait]
pub trait NodeControl: Send + Sync {
    async fn operation_mode(&self, address: &str) -> Result<OperationMode>;

    async fn cluster_view(&self, address: &str) -> Result<ClusterView>;

    /// Blocks until the node has left the ring.
    async fn decommission(&self, address: &str) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct JmxRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    mbean: &'a str,
    #[serde(rename = "attribute", skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<&'a str>,
    target: JmxTarget<'a>,
}

#[derive(Debug, Serialize)]
struct JmxTarget<'a> {
    url: String,
    user: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct JmxResponse {
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

/// Jolokia proxy client.
pub struct JolokiaClient {
    url: String,
    jmx_port: u16,
    user: String,
    password: String,
    client: reqwest::Client,
    /// Decommission streams data off the node and may take hours.
    long_client: reqwest::Client,
}

impl JolokiaClient {
    pub fn new(url: String, jmx_port: u16, user: String, password: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        let long_client = reqwest::Client::builder().connect_timeout(timeout).build()?;

        Ok(Self {
            url,
            jmx_port,
            user,
            password,
            client,
            long_client,
        })
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        address: &str,
        kind: &str,
        attributes: Vec<&str>,
        operation: Option<&str>,
    ) -> Result<serde_json::Value> {
        let request = JmxRequest {
            kind,
            mbean: MBEAN_STORAGE_SERVICE,
            attributes,
            operation,
            target: JmxTarget {
                url: format!("service:jmx:rmi:///jndi/rmi://{}:{}/jmxrmi", address, self.jmx_port),
                user: &self.user,
                password: &self.password,
            },
        };

        let node_error = |reason: String| Error::NodeControl {
            address: address.to_string(),
            reason,
        };

        let response = client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| node_error(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| node_error(e.to_string()))?;
        if !status.is_success() {
            return Err(node_error(format!("{}: {}", status, body)));
        }

        let response: JmxResponse = serde_json::from_str(&body)
            .map_err(|e| node_error(format!("cannot unmarshal response: {}, raw body: {}", e, body)))?;

        if let Some(error) = response.error.filter(|e| !e.is_empty()) {
            return Err(node_error(format!("received error JMX response: {}", error)));
        }

        Ok(response.value)
    }
}

#[async_trait]
impl NodeControl for JolokiaClient {
    async fn operation_mode(&self, address: &str) -> Result<OperationMode> {
        let value = self
            .post(&self.client, address, "read", vec!["OperationMode"], None)
            .await?;
        parse_operation_mode(address, &value)
    }

    async fn cluster_view(&self, address: &str) -> Result<ClusterView> {
        let value = self
            .post(
                &self.client,
                address,
                "read",
                vec!["LiveNodes", "LeavingNodes", "JoiningNodes", "UnreachableNodes", "MovingNodes"],
                None,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn decommission(&self, address: &str) -> Result<()> {
        debug!(address = %address, "Sending decommission");
        self.post(&self.long_client, address, "exec", vec![], Some("decommission"))
            .await?;
        Ok(())
    }
}

fn parse_operation_mode(address: &str, value: &serde_json::Value) -> Result<OperationMode> {
    let mode = value
        .get("OperationMode")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::NodeControl {
            address: address.to_string(),
            reason: format!("couldn't find operation mode field, raw response: {}", value),
        })?;

    mode.parse().map_err(|reason| Error::NodeControl {
        address: address.to_string(),
        reason,
    })
}
