//! Single-flight job registry.
//!
//! Decommissions run far longer than a reconciliation pass, so they run on
//! a detached task and their state is recorded in a [`JobStore`]. A record
//! exists from the moment a job is started until it is explicitly removed.
//! Every write goes through a version precondition so that two overlapping
//! passes can never both start the same job.
//!
//! A running job refreshes its heartbeat periodically. A record whose
//! heartbeat is older than [`JOB_LEASE`] belongs to a process that died
//! mid-job and no longer counts as running.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc::UnboundedSender;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{is_conflict, is_not_found, Error, Result};
use crate::labels;

/// Interval between heartbeats of a running job.
pub const JOB_HEARTBEAT: Duration = Duration::from_secs(10);

/// A running job whose heartbeat is older than this is considered abandoned.
pub const JOB_LEASE: Duration = Duration::from_secs(60);

const JOB_DATA_KEY: &str = "job";
const FINISH_ATTEMPTS: usize = 5;

/// Durable state of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub name: String,
    pub started: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            started: now,
            heartbeat: now,
            finished: None,
            error: None,
        }
    }

    pub fn is_running_at(&self, now: DateTime<Utc>) -> bool {
        if self.finished.is_some() {
            return false;
        }
        let lease = chrono::Duration::from_std(JOB_LEASE).unwrap_or_else(|_| chrono::Duration::seconds(60));
        now - self.heartbeat < lease
    }

    pub fn is_running(&self) -> bool {
        self.is_running_at(Utc::now())
    }
}

/// A record together with the store version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub record: JobRecord,
    pub version: String,
}

/// Durable storage of job records with optimistic concurrency.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Versioned>>;

    /// Fails with `JobConflict` if a record of that name exists.
    async fn create(&self, record: &JobRecord) -> Result<()>;

    /// Fails with `JobConflict` if the record changed since `version`.
    async fn update(&self, record: &JobRecord, version: &str) -> Result<()>;

    /// Deleting a missing record succeeds. Fails with `JobConflict` if the
    /// record changed since `version`.
    async fn delete(&self, name: &str, version: &str) -> Result<()>;
}

/// Job records kept as config maps labeled with the job label.
pub struct ConfigMapJobStore {
    api: Api<ConfigMap>,
    cluster_name: String,
    owner: Option<OwnerReference>,
}

impl ConfigMapJobStore {
    pub fn new(client: Client, namespace: &str, cluster_name: &str, owner: Option<OwnerReference>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            cluster_name: cluster_name.to_string(),
            owner,
        }
    }

    fn config_map(&self, record: &JobRecord, version: Option<&str>) -> Result<ConfigMap> {
        let mut job_labels = labels::component_labels(&self.cluster_name, labels::COMPONENT_CASSANDRA);
        job_labels.insert(labels::CASSANDRA_CLUSTER_JOB.to_string(), "true".to_string());

        let mut data = std::collections::BTreeMap::new();
        data.insert(JOB_DATA_KEY.to_string(), serde_json::to_string(record)?);

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(record.name.clone()),
                labels: Some(job_labels),
                owner_references: self.owner.clone().map(|o| vec![o]),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        })
    }
}

fn store_error(name: &str, err: kube::Error) -> Error {
    if is_conflict(&err) {
        Error::JobConflict(name.to_string())
    } else {
        Error::Kube(err)
    }
}

#[async_trait]
impl JobStore for ConfigMapJobStore {
    async fn get(&self, name: &str) -> Result<Option<Versioned>> {
        let Some(cm) = self.api.get_opt(name).await? else {
            return Ok(None);
        };

        let raw = cm
            .data
            .as_ref()
            .and_then(|d| d.get(JOB_DATA_KEY))
            .ok_or_else(|| Error::ConfigInvariant(format!("job config map {} has no record", name)))?;

        Ok(Some(Versioned {
            record: serde_json::from_str(raw)?,
            version: cm.metadata.resource_version.clone().unwrap_or_default(),
        }))
    }

    async fn create(&self, record: &JobRecord) -> Result<()> {
        let cm = self.config_map(record, None)?;
        self.api
            .create(&PostParams::default(), &cm)
            .await
            .map_err(|e| store_error(&record.name, e))?;
        Ok(())
    }

    async fn update(&self, record: &JobRecord, version: &str) -> Result<()> {
        let cm = self.config_map(record, Some(version))?;
        self.api
            .replace(&record.name, &PostParams::default(), &cm)
            .await
            .map_err(|e| store_error(&record.name, e))?;
        Ok(())
    }

    async fn delete(&self, name: &str, version: &str) -> Result<()> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: Some(version.to_string()),
                uid: None,
            }),
            ..Default::default()
        };

        match self.api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(store_error(name, e)),
        }
    }
}

/// Process-local store, used when no durable store is wanted and in tests.
#[derive(Default)]
pub struct InMemoryJobStore {
    records: RwLock<HashMap<String, (JobRecord, u64)>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, name: &str) -> Result<Option<Versioned>> {
        Ok(self.records.read().await.get(name).map(|(record, version)| Versioned {
            record: record.clone(),
            version: version.to_string(),
        }))
    }

    async fn create(&self, record: &JobRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.name) {
            return Err(Error::JobConflict(record.name.clone()));
        }
        records.insert(record.name.clone(), (record.clone(), 1));
        Ok(())
    }

    async fn update(&self, record: &JobRecord, version: &str) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.name) {
            Some((current, v)) if v.to_string() == version => {
                *current = record.clone();
                *v += 1;
                Ok(())
            }
            _ => Err(Error::JobConflict(record.name.clone())),
        }
    }

    async fn delete(&self, name: &str, version: &str) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get(name) {
            None => Ok(()),
            Some((_, v)) if v.to_string() == version => {
                records.remove(name);
                Ok(())
            }
            Some(_) => Err(Error::JobConflict(name.to_string())),
        }
    }
}

/// Guard ensuring at most one job of a given name is in flight.
#[derive(Clone)]
pub struct DecommissionJobTracker {
    store: Arc<dyn JobStore>,
    /// Signalled whenever a job finishes, so the next pass runs right away.
    notify: Option<UnboundedSender<()>>,
}

impl DecommissionJobTracker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store, notify: None }
    }

    pub fn with_notifier(mut self, notify: UnboundedSender<()>) -> Self {
        self.notify = Some(notify);
        self
    }

    pub async fn job(&self, name: &str) -> Result<Option<JobRecord>> {
        Ok(self.store.get(name).await?.map(|v| v.record))
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.get(name).await?.is_some())
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .store
            .get(name)
            .await?
            .map(|v| v.record.is_running())
            .unwrap_or(false))
    }

    /// Record the job and run `action` on a detached task. Fails with
    /// `JobConflict` if a record of that name already exists.
    pub async fn run<F>(&self, name: &str, action: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.store.create(&JobRecord::new(name)).await?;
        info!(job = %name, "Starting job");

        let tracker = self.clone();
        let name = name.to_string();
        Ok(tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            tokio::pin!(action);

            let mut ticker = tokio::time::interval(JOB_HEARTBEAT);
            ticker.tick().await;

            let result = loop {
                tokio::select! {
                    result = &mut action => break result,
                    _ = ticker.tick() => {
                        info!(job = %name, elapsed = ?started.elapsed(), "Job is running");
                        tracker.heartbeat(&name).await;
                    }
                }
            };

            match &result {
                Ok(()) => info!(job = %name, elapsed = ?started.elapsed(), "Job finished"),
                Err(e) => warn!(job = %name, elapsed = ?started.elapsed(), error = %e, "Job failed"),
            }

            tracker.finish(&name, result.err().map(|e| e.to_string())).await;

            if let Some(notify) = &tracker.notify {
                let _ = notify.unbounded_send(());
            }
        }))
    }

    /// Remove a finished job. Removing a missing job is a no-op; removing a
    /// running one is refused.
    pub async fn remove_job(&self, name: &str) -> Result<()> {
        let Some(current) = self.store.get(name).await? else {
            return Ok(());
        };

        if current.record.is_running() {
            return Err(Error::JobConflict(format!(
                "{} is still running, removing running jobs is not allowed",
                name
            )));
        }

        self.store.delete(name, &current.version).await?;
        debug!(job = %name, "Job removed");
        Ok(())
    }

    async fn heartbeat(&self, name: &str) {
        match self.store.get(name).await {
            Ok(Some(mut current)) => {
                current.record.heartbeat = Utc::now();
                if let Err(e) = self.store.update(&current.record, &current.version).await {
                    debug!(job = %name, error = %e, "Skipping heartbeat");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(job = %name, error = %e, "Skipping heartbeat"),
        }
    }

    async fn finish(&self, name: &str, error: Option<String>) {
        for _ in 0..FINISH_ATTEMPTS {
            let current = match self.store.get(name).await {
                Ok(Some(current)) => current,
                Ok(None) => return,
                Err(e) => {
                    warn!(job = %name, error = %e, "Can't read job record");
                    continue;
                }
            };

            let mut record = current.record;
            record.finished = Some(Utc::now());
            record.error = error.clone();

            match self.store.update(&record, &current.version).await {
                Ok(()) => return,
                Err(Error::JobConflict(_)) => continue,
                Err(e) => warn!(job = %name, error = %e, "Can't record job completion"),
            }
        }

        warn!(job = %name, "Job completion not recorded, the record will expire");
    }
}
