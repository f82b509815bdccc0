//! In-memory fakes for the scheduler's external collaborators.
//!
//! These drive the integration tests and let embedders run a full
//! scheduler without a cluster. Hosts can be crashed and marked
//! unhealthy; discoverd can be promoted and demoted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use keel_id::{AppId, ArtifactId, HostId, JobId, ReleaseId};
use tokio::sync::mpsc;

use crate::clients::{ClusterClient, ControllerClient, Discoverd, HostClient};
use crate::formation::FormationKey;
use crate::types::{
    ActiveJob, App, Artifact, FormationUpdate, HostEvent, HostEventKind, JobConfig, Release,
    ReportedJobState,
};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("fake state poisoned")
}

// =========================================================================
// Controller
// =========================================================================

#[derive(Default)]
struct ControllerState {
    apps: HashMap<AppId, App>,
    releases: HashMap<ReleaseId, Release>,
    artifacts: HashMap<ArtifactId, Artifact>,
    formations: HashMap<FormationKey, FormationUpdate>,
    streams: Vec<mpsc::Sender<FormationUpdate>>,
}

/// In-memory controller: a CRUD store plus formation streaming.
#[derive(Default)]
pub struct FakeControllerClient {
    state: Mutex<ControllerState>,
}

impl FakeControllerClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ControllerClient for FakeControllerClient {
    async fn get_app(&self, id: AppId) -> Result<App> {
        match locked(&self.state).apps.get(&id) {
            Some(app) => Ok(app.clone()),
            None => bail!("app {id} not found"),
        }
    }

    async fn get_release(&self, id: ReleaseId) -> Result<Release> {
        match locked(&self.state).releases.get(&id) {
            Some(release) => Ok(release.clone()),
            None => bail!("release {id} not found"),
        }
    }

    async fn get_artifact(&self, id: ArtifactId) -> Result<Artifact> {
        match locked(&self.state).artifacts.get(&id) {
            Some(artifact) => Ok(artifact.clone()),
            None => bail!("artifact {id} not found"),
        }
    }

    async fn create_app(&self, app: App) -> Result<()> {
        locked(&self.state).apps.insert(app.id, app);
        Ok(())
    }

    async fn create_release(&self, release: Release) -> Result<()> {
        locked(&self.state).releases.insert(release.id, release);
        Ok(())
    }

    async fn create_artifact(&self, artifact: Artifact) -> Result<()> {
        locked(&self.state).artifacts.insert(artifact.id, artifact);
        Ok(())
    }

    async fn put_formation(&self, update: FormationUpdate) -> Result<()> {
        let mut state = locked(&self.state);
        let key = FormationKey::new(update.app_id, update.release_id);
        state.formations.insert(key, update.clone());
        state.streams.retain(|tx| tx.try_send(update.clone()).is_ok());
        Ok(())
    }

    async fn list_formations(&self) -> Result<Vec<FormationUpdate>> {
        Ok(locked(&self.state).formations.values().cloned().collect())
    }

    async fn stream_formations(&self) -> Result<mpsc::Receiver<FormationUpdate>> {
        let (tx, rx) = mpsc::channel(64);
        locked(&self.state).streams.push(tx);
        Ok(rx)
    }
}

// =========================================================================
// Host
// =========================================================================

struct HostState {
    tags: HashMap<String, String>,
    healthy: bool,
    jobs: HashMap<JobId, ActiveJob>,
    streams: Vec<mpsc::Sender<ActiveJob>>,
}

/// In-memory host agent. Jobs accepted via `add_job` report `starting`
/// then `running` on the event stream; `crash_job` and `set_healthy`
/// simulate failures.
pub struct FakeHostClient {
    id: HostId,
    state: Mutex<HostState>,
}

impl FakeHostClient {
    pub fn new() -> Self {
        Self::with_tags(HashMap::new())
    }

    pub fn with_tags(tags: HashMap<String, String>) -> Self {
        Self {
            id: HostId::new(),
            state: Mutex::new(HostState {
                tags,
                healthy: true,
                jobs: HashMap::new(),
                streams: Vec::new(),
            }),
        }
    }

    /// Makes every subsequent call fail (or succeed again).
    pub fn set_healthy(&self, healthy: bool) {
        locked(&self.state).healthy = healthy;
    }

    /// Kills a running job; observers see a `crashed` event.
    pub fn crash_job(&self, job_id: JobId) {
        let mut state = locked(&self.state);
        if let Some(mut job) = state.jobs.remove(&job_id) {
            job.state = ReportedJobState::Crashed;
            push_event(&mut state.streams, job);
        }
    }

    pub fn job_count(&self) -> usize {
        locked(&self.state).jobs.len()
    }
}

impl Default for FakeHostClient {
    fn default() -> Self {
        Self::new()
    }
}

fn push_event(streams: &mut Vec<mpsc::Sender<ActiveJob>>, job: ActiveJob) {
    streams.retain(|tx| tx.try_send(job.clone()).is_ok());
}

#[async_trait]
impl HostClient for FakeHostClient {
    fn id(&self) -> HostId {
        self.id
    }

    async fn tags(&self) -> Result<HashMap<String, String>> {
        Ok(locked(&self.state).tags.clone())
    }

    async fn list_jobs(&self) -> Result<HashMap<JobId, ActiveJob>> {
        let state = locked(&self.state);
        if !state.healthy {
            bail!("host {} unreachable", self.id);
        }
        Ok(state.jobs.clone())
    }

    async fn add_job(&self, config: JobConfig) -> Result<JobId> {
        let mut state = locked(&self.state);
        if !state.healthy {
            bail!("host {} unreachable", self.id);
        }
        let mut job = ActiveJob {
            job_id: config.id,
            app_id: config.app_id,
            release_id: config.release_id,
            proc_type: config.proc_type,
            state: ReportedJobState::Starting,
        };
        push_event(&mut state.streams, job.clone());
        job.state = ReportedJobState::Running;
        state.jobs.insert(job.job_id, job.clone());
        push_event(&mut state.streams, job);
        Ok(config.id)
    }

    async fn stop_job(&self, id: JobId) -> Result<()> {
        let mut state = locked(&self.state);
        if !state.healthy {
            bail!("host {} unreachable", self.id);
        }
        if let Some(mut job) = state.jobs.remove(&id) {
            job.state = ReportedJobState::Stopped;
            push_event(&mut state.streams, job);
        }
        Ok(())
    }

    async fn stream_events(&self) -> Result<mpsc::Receiver<ActiveJob>> {
        let (tx, rx) = mpsc::channel(256);
        locked(&self.state).streams.push(tx);
        Ok(rx)
    }
}

// =========================================================================
// Cluster
// =========================================================================

#[derive(Default)]
struct ClusterState {
    hosts: BTreeMap<HostId, Arc<FakeHostClient>>,
    streams: Vec<mpsc::Sender<HostEvent>>,
}

/// In-memory cluster membership.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: Arc<FakeHostClient>) {
        let mut state = locked(&self.state);
        let host_id = host.id();
        if state.hosts.insert(host_id, host).is_none() {
            push_host_event(&mut state.streams, host_id, HostEventKind::Up);
        }
    }

    pub fn remove_host(&self, host_id: HostId) {
        let mut state = locked(&self.state);
        if state.hosts.remove(&host_id).is_some() {
            push_host_event(&mut state.streams, host_id, HostEventKind::Down);
        }
    }

    /// Replaces the membership, emitting events for the difference.
    pub fn set_hosts(&self, hosts: Vec<Arc<FakeHostClient>>) {
        let mut state = locked(&self.state);
        let next: BTreeMap<HostId, Arc<FakeHostClient>> =
            hosts.into_iter().map(|h| (h.id(), h)).collect();
        let gone: Vec<HostId> = state
            .hosts
            .keys()
            .filter(|id| !next.contains_key(id))
            .copied()
            .collect();
        let added: Vec<HostId> = next
            .keys()
            .filter(|id| !state.hosts.contains_key(id))
            .copied()
            .collect();
        state.hosts = next;
        for host_id in gone {
            push_host_event(&mut state.streams, host_id, HostEventKind::Down);
        }
        for host_id in added {
            push_host_event(&mut state.streams, host_id, HostEventKind::Up);
        }
    }
}

fn push_host_event(
    streams: &mut Vec<mpsc::Sender<HostEvent>>,
    host_id: HostId,
    kind: HostEventKind,
) {
    streams.retain(|tx| tx.try_send(HostEvent { host_id, kind }).is_ok());
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn hosts(&self) -> Result<Vec<Arc<dyn HostClient>>> {
        Ok(locked(&self.state)
            .hosts
            .values()
            .map(|h| h.clone() as Arc<dyn HostClient>)
            .collect())
    }

    async fn host(&self, id: HostId) -> Result<Arc<dyn HostClient>> {
        match locked(&self.state).hosts.get(&id) {
            Some(host) => Ok(host.clone() as Arc<dyn HostClient>),
            None => bail!("host {id} not found"),
        }
    }

    async fn stream_host_events(&self) -> Result<mpsc::Receiver<HostEvent>> {
        let (tx, rx) = mpsc::channel(64);
        locked(&self.state).streams.push(tx);
        Ok(rx)
    }
}

// =========================================================================
// Discoverd
// =========================================================================

/// In-memory leader election with explicit promote/demote.
pub struct FakeDiscoverd {
    first_leader: bool,
    tx: mpsc::Sender<bool>,
    rx: Mutex<Option<mpsc::Receiver<bool>>>,
}

impl FakeDiscoverd {
    pub fn new(first_leader: bool) -> Self {
        let (tx, rx) = mpsc::channel(8);
        Self {
            first_leader,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub async fn promote(&self) {
        let _ = self.tx.send(true).await;
    }

    pub async fn demote(&self) {
        let _ = self.tx.send(false).await;
    }
}

#[async_trait]
impl Discoverd for FakeDiscoverd {
    async fn register(&self) -> Result<bool> {
        Ok(self.first_leader)
    }

    async fn leader_ch(&self) -> Result<mpsc::Receiver<bool>> {
        match locked(&self.rx).take() {
            Some(rx) => Ok(rx),
            None => bail!("leader channel already taken"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(host: &FakeHostClient) -> JobConfig {
        JobConfig {
            id: JobId::new(),
            app_id: AppId::new(),
            release_id: ReleaseId::new(),
            proc_type: "web".into(),
            artifact_uri: format!("docker://{}", host.id()),
        }
    }

    #[tokio::test]
    async fn test_host_add_job_reports_starting_then_running() {
        let host = FakeHostClient::new();
        let mut events = host.stream_events().await.unwrap();

        let config = config_for(&host);
        let job_id = host.add_job(config).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.job_id, job_id);
        assert_eq!(first.state, ReportedJobState::Starting);
        let second = events.recv().await.unwrap();
        assert_eq!(second.state, ReportedJobState::Running);

        assert_eq!(host.list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_host_crash_emits_crashed() {
        let host = FakeHostClient::new();
        let job_id = host.add_job(config_for(&host)).await.unwrap();
        let mut events = host.stream_events().await.unwrap();

        host.crash_job(job_id);
        let event = events.recv().await.unwrap();
        assert_eq!(event.state, ReportedJobState::Crashed);
        assert_eq!(host.job_count(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_host_refuses_calls() {
        let host = FakeHostClient::new();
        host.set_healthy(false);
        assert!(host.list_jobs().await.is_err());
        assert!(host.add_job(config_for(&host)).await.is_err());
    }

    #[tokio::test]
    async fn test_cluster_set_hosts_emits_diff() {
        let cluster = FakeCluster::new();
        let h1 = Arc::new(FakeHostClient::new());
        let h2 = Arc::new(FakeHostClient::new());
        cluster.add_host(h1.clone());

        let mut events = cluster.stream_host_events().await.unwrap();
        cluster.set_hosts(vec![h2.clone()]);

        let down = events.recv().await.unwrap();
        assert_eq!(down.host_id, h1.id());
        assert_eq!(down.kind, HostEventKind::Down);
        let up = events.recv().await.unwrap();
        assert_eq!(up.host_id, h2.id());
        assert_eq!(up.kind, HostEventKind::Up);
    }

    #[tokio::test]
    async fn test_controller_streams_formation_changes() {
        let controller = FakeControllerClient::new();
        let mut stream = controller.stream_formations().await.unwrap();

        let update = FormationUpdate {
            app_id: AppId::new(),
            release_id: ReleaseId::new(),
            processes: [("web".to_string(), 1)].into_iter().collect(),
            tags: HashMap::new(),
        };
        controller.put_formation(update.clone()).await.unwrap();

        let received = stream.recv().await.unwrap();
        assert_eq!(received, update);
        assert_eq!(controller.list_formations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discoverd_leader_channel() {
        let discoverd = FakeDiscoverd::new(false);
        assert!(!discoverd.register().await.unwrap());

        let mut leader = discoverd.leader_ch().await.unwrap();
        assert!(discoverd.leader_ch().await.is_err());

        discoverd.promote().await;
        assert_eq!(leader.recv().await, Some(true));
        discoverd.demote().await;
        assert_eq!(leader.recv().await, Some(false));
    }
}
