//! Interfaces to the scheduler's external collaborators.
//!
//! The scheduler consumes four services: the controller (desired state),
//! the cluster and its host agents (observed state and actuation), and
//! discoverd (leader election). All are expressed as object-safe async
//! traits so tests and embedders can supply in-memory implementations.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use keel_id::{AppId, ArtifactId, HostId, JobId, ReleaseId};
use tokio::sync::mpsc;

use crate::types::{ActiveJob, App, Artifact, FormationUpdate, HostEvent, JobConfig, Release};

/// CRUD store of apps, artifacts, releases and formations.
///
/// The scheduler itself only reads and streams; the create/put surface
/// exists for operators and tests.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn get_app(&self, id: AppId) -> Result<App>;
    async fn get_release(&self, id: ReleaseId) -> Result<Release>;
    async fn get_artifact(&self, id: ArtifactId) -> Result<Artifact>;

    async fn create_app(&self, app: App) -> Result<()>;
    async fn create_release(&self, release: Release) -> Result<()>;
    async fn create_artifact(&self, artifact: Artifact) -> Result<()>;

    /// Declares the desired topology for one (app, release). A formation
    /// whose counts are all zero is a delete.
    async fn put_formation(&self, update: FormationUpdate) -> Result<()>;

    /// Current snapshot of all formations.
    async fn list_formations(&self) -> Result<Vec<FormationUpdate>>;

    /// Subscribes to formation changes.
    async fn stream_formations(&self) -> Result<mpsc::Receiver<FormationUpdate>>;
}

/// A remote host agent that runs jobs.
#[async_trait]
pub trait HostClient: Send + Sync {
    fn id(&self) -> HostId;

    async fn tags(&self) -> Result<HashMap<String, String>>;

    async fn list_jobs(&self) -> Result<HashMap<JobId, ActiveJob>>;

    /// Asks the host to start a job. The host accepts synchronously and
    /// returns the job id; success or failure of the actual start is
    /// reported later on the event stream.
    async fn add_job(&self, config: JobConfig) -> Result<JobId>;

    async fn stop_job(&self, id: JobId) -> Result<()>;

    /// Subscribes to this host's job events, in the order the host
    /// observed them.
    async fn stream_events(&self) -> Result<mpsc::Receiver<ActiveJob>>;
}

/// Cluster membership.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn hosts(&self) -> Result<Vec<Arc<dyn HostClient>>>;

    async fn host(&self, id: HostId) -> Result<Arc<dyn HostClient>>;

    async fn stream_host_events(&self) -> Result<mpsc::Receiver<HostEvent>>;
}

/// Leader election.
#[async_trait]
pub trait Discoverd: Send + Sync {
    /// Registers this scheduler and reports whether it is the initial
    /// leader.
    async fn register(&self) -> Result<bool>;

    /// Channel of leader-state changes. May only be taken once.
    async fn leader_ch(&self) -> Result<mpsc::Receiver<bool>>;
}
