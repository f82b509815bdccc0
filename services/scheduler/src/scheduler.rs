//! The scheduler event loop.
//!
//! A single task owns all mutable scheduler state: the formation, job and
//! host registries. Controller stream deltas, host membership changes,
//! per-host job events, restart timers, rectify ticks and synchronous
//! requests all arrive as a [`Command`] on one channel and are dispatched
//! here, one at a time. Satellite tasks exist only for I/O and never
//! touch the registries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use keel_id::{AppId, HostId, JobId, ReleaseId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::clients::{ClusterClient, ControllerClient, Discoverd, HostClient};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::events::{EventBus, EventKind, Subscription};
use crate::formation::{Formation, FormationKey, Formations};
use crate::host::{Host, Hosts};
use crate::job::{Job, JobSnapshot, JobState, Jobs};
use crate::placement::PlacementRequest;
use crate::streams;
use crate::types::{ActiveJob, FormationUpdate, JobConfig, ReportedJobState};

/// Commands consumed by the event loop.
#[derive(Debug)]
pub(crate) enum Command {
    /// A single formation delta from the controller stream.
    FormationChange(FormationUpdate),
    /// A full formation snapshot; anything not listed drains to zero.
    FormationSync(Vec<FormationUpdate>),
    /// Pull a fresh formation snapshot from the controller.
    SyncFormations,
    /// Re-list cluster hosts and health-check the known ones.
    SyncCluster,
    HostUp(HostId),
    HostDown(HostId),
    /// A job event from one host's stream (or its job listing).
    JobUpdate { host_id: HostId, job: ActiveJob },
    Placement(PlacementRequest),
    StopJob {
        app_id: AppId,
        release_id: ReleaseId,
        proc_type: String,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    RunningJobs {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe(u64),
    /// Coalesced rectify for one formation.
    RectifyTick(FormationKey),
    /// A restart timer fired.
    JobRestart(JobId),
    LeaderChange(bool),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clonable handle for talking to a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| SchedulerError::ShuttingDown)?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)
    }

    /// Attaches a new event subscriber.
    pub async fn subscribe(&self) -> Result<Subscription, SchedulerError> {
        self.request(|reply| Command::Subscribe { reply }).await
    }

    /// Detaches a subscriber. Idempotent.
    pub async fn unsubscribe(&self, id: u64) -> Result<(), SchedulerError> {
        self.tx
            .send(Command::Unsubscribe(id))
            .await
            .map_err(|_| SchedulerError::ShuttingDown)
    }

    /// Snapshot of jobs currently occupying hosts.
    pub async fn running_jobs(&self) -> Result<Vec<JobSnapshot>, SchedulerError> {
        self.request(|reply| Command::RunningJobs { reply }).await
    }

    /// Asks the placer to choose a host for a pending job.
    pub async fn request_placement(&self, job_id: JobId) -> Result<HostId, SchedulerError> {
        self.request(|reply| Command::Placement(PlacementRequest { job_id, reply }))
            .await?
    }

    /// Stops one job of the given type, preferring less-advanced states
    /// and the most recently started within a state.
    pub async fn stop_job(
        &self,
        app_id: AppId,
        release_id: ReleaseId,
        proc_type: &str,
    ) -> Result<(), SchedulerError> {
        self.request(|reply| Command::StopJob {
            app_id,
            release_id,
            proc_type: proc_type.to_string(),
            reply,
        })
        .await?
    }

    /// Stops the scheduler and waits for the loop to drain.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// The control-plane scheduler.
///
/// Construct with [`Scheduler::new`], optionally [`subscribe`]
/// before starting, then drive it with [`run`], which consumes the
/// scheduler and only returns after shutdown.
///
/// [`subscribe`]: Scheduler::subscribe
/// [`run`]: Scheduler::run
pub struct Scheduler {
    pub(crate) config: SchedulerConfig,
    controller: Arc<dyn ControllerClient>,
    cluster: Arc<dyn ClusterClient>,
    discoverd: Arc<dyn Discoverd>,

    pub(crate) formations: Formations,
    pub(crate) jobs: Jobs,
    pub(crate) hosts: Hosts,

    pub(crate) bus: EventBus,
    pub(crate) is_leader: bool,
    pending_rectify: HashSet<FormationKey>,
    restart_backoff: Backoff,

    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        controller: Arc<dyn ControllerClient>,
        cluster: Arc<dyn ClusterClient>,
        discoverd: Arc<dyn Discoverd>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.command_buffer_size);
        let bus = EventBus::new(config.subscriber_buffer_size);
        let restart_backoff = Backoff::new(
            config.restart_backoff_base,
            config.restart_backoff_cap,
            config.restart_jitter,
        );
        Self {
            config,
            controller,
            cluster,
            discoverd,
            formations: Formations::default(),
            jobs: Jobs::default(),
            hosts: Hosts::default(),
            bus,
            is_leader: false,
            pending_rectify: HashSet::new(),
            restart_backoff,
            tx,
            rx,
            tasks: Vec::new(),
            shutdown_reply: None,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Attaches a subscriber before the loop starts, guaranteeing no
    /// startup event is missed.
    pub fn subscribe(&mut self) -> Subscription {
        self.bus.subscribe()
    }

    /// Runs the event loop until shutdown.
    pub async fn run(mut self) {
        match self.discoverd.register().await {
            Ok(initial) => self.is_leader = initial,
            Err(e) => {
                warn!(error = %e, "discoverd registration failed, starting passive");
            }
        }
        self.bus.publish(EventKind::LeaderChange {
            is_leader: self.is_leader,
        });
        self.spawn_adapters();
        info!(leader = self.is_leader, "scheduler event loop started");

        while let Some(cmd) = self.rx.recv().await {
            if !self.dispatch(cmd).await {
                break;
            }
        }
        self.finish();
        info!("scheduler stopped");
    }

    fn spawn_adapters(&mut self) {
        self.tasks.push(streams::watch_formations(
            self.controller.clone(),
            self.tx.clone(),
        ));
        self.tasks.push(streams::watch_host_events(
            self.cluster.clone(),
            self.tx.clone(),
        ));
        self.tasks.push(streams::watch_leader(
            self.discoverd.clone(),
            self.tx.clone(),
        ));
        self.tasks.push(streams::sync_ticker(
            self.config.sync_interval,
            self.tx.clone(),
        ));
    }

    async fn dispatch(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::FormationChange(update) => self.handle_formation_change(update).await,
            Command::FormationSync(list) => self.handle_formation_sync(list).await,
            Command::SyncFormations => self.handle_sync_formations().await,
            Command::SyncCluster => self.handle_sync_cluster().await,
            Command::HostUp(host_id) => self.handle_host_up(host_id).await,
            Command::HostDown(host_id) => self.remove_host(host_id),
            Command::JobUpdate { host_id, job } => self.handle_job_update(host_id, job),
            Command::Placement(req) => self.handle_placement_request(req),
            Command::StopJob {
                app_id,
                release_id,
                proc_type,
                reply,
            } => {
                self.handle_stop_request(app_id, release_id, proc_type, reply)
                    .await
            }
            Command::RunningJobs { reply } => {
                let _ = reply.send(self.jobs.running());
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(self.bus.subscribe());
            }
            Command::Unsubscribe(id) => self.bus.unsubscribe(id),
            Command::RectifyTick(key) => {
                self.pending_rectify.remove(&key);
                self.rectify(key).await;
            }
            Command::JobRestart(job_id) => self.handle_job_restart(job_id).await,
            Command::LeaderChange(is_leader) => self.handle_leader_change(is_leader).await,
            Command::Shutdown { reply } => {
                self.shutdown_reply = Some(reply);
                return false;
            }
        }
        true
    }

    // -------------------------------------------------------------------
    // Formations
    // -------------------------------------------------------------------

    async fn handle_formation_change(&mut self, update: FormationUpdate) {
        let key = FormationKey::new(update.app_id, update.release_id);
        match self.upsert_formation(update).await {
            Ok(true) => {
                self.bus.publish(EventKind::FormationChange { key });
                self.request_rectify(key);
            }
            Ok(false) => debug!(key = %key, "formation unchanged"),
            Err(e) => self.publish_error(format!("formation {key}: {e}")),
        }
    }

    async fn handle_formation_sync(&mut self, list: Vec<FormationUpdate>) {
        let mut seen = HashSet::new();
        let mut dirty = Vec::new();
        for update in list {
            let key = FormationKey::new(update.app_id, update.release_id);
            seen.insert(key);
            match self.upsert_formation(update).await {
                Ok(true) => dirty.push(key),
                Ok(false) => {}
                Err(e) => self.publish_error(format!("formation {key}: {e}")),
            }
        }
        // formations the controller no longer lists drain to zero
        for key in self.formations.keys() {
            if !seen.contains(&key) {
                if let Some(formation) = self.formations.get_mut(&key) {
                    formation.processes.clear();
                }
                dirty.push(key);
            }
        }
        self.bus.publish(EventKind::FormationSync);
        for key in dirty {
            self.request_rectify(key);
        }
    }

    async fn handle_sync_formations(&mut self) {
        match self.controller.list_formations().await {
            Ok(list) => self.handle_formation_sync(list).await,
            Err(e) => self.publish_error(format!("formation sync: {e}")),
        }
    }

    /// Applies a formation update, fetching controller objects for new
    /// keys. Returns whether anything changed.
    async fn upsert_formation(&mut self, update: FormationUpdate) -> anyhow::Result<bool> {
        let key = FormationKey::new(update.app_id, update.release_id);
        if let Some(existing) = self.formations.get_mut(&key) {
            if existing.processes == update.processes && existing.tags == update.tags {
                return Ok(false);
            }
            existing.processes = update.processes;
            existing.tags = update.tags;
            return Ok(true);
        }
        // a delete for a formation we never knew, with no jobs to drain
        if update.is_empty() && self.jobs.for_formation(&key).is_empty() {
            return Ok(false);
        }
        let release = self.controller.get_release(update.release_id).await?;
        let artifact = self.controller.get_artifact(release.artifact_id).await?;
        let app = self.controller.get_app(update.app_id).await?;
        self.formations.insert(Formation::new(
            app,
            release,
            artifact,
            update.processes,
            update.tags,
        ));
        Ok(true)
    }

    // -------------------------------------------------------------------
    // Hosts
    // -------------------------------------------------------------------

    async fn handle_host_up(&mut self, host_id: HostId) {
        if self.hosts.contains(&host_id) {
            if let Some(host) = self.hosts.get_mut(&host_id) {
                host.healthy = true;
                host.failed_checks = 0;
            }
            return;
        }
        match self.cluster.host(host_id).await {
            Ok(client) => self.add_host(client).await,
            Err(e) => self.publish_error(format!("host {host_id} lookup failed: {e}")),
        }
    }

    async fn add_host(&mut self, client: Arc<dyn HostClient>) {
        let host_id = client.id();
        if self.hosts.contains(&host_id) {
            return;
        }
        let tags = match tokio::time::timeout(self.config.host_call_timeout, client.tags()).await {
            Ok(Ok(tags)) => tags,
            Ok(Err(e)) => {
                warn!(host_id = %host_id, error = %e, "failed to read host tags");
                HashMap::new()
            }
            Err(_) => {
                warn!(host_id = %host_id, "host tags call timed out");
                HashMap::new()
            }
        };
        let watcher = streams::watch_host_jobs(client.clone(), self.tx.clone());
        self.hosts.insert(Host {
            id: host_id,
            tags,
            healthy: true,
            failed_checks: 0,
            client,
            watcher: Some(watcher),
        });
        info!(host_id = %host_id, hosts = self.hosts.len(), "host added");
        self.rectify_after_host_change();
    }

    fn remove_host(&mut self, host_id: HostId) {
        let Some(mut host) = self.hosts.remove(&host_id) else {
            return;
        };
        host.stop_watcher();
        info!(host_id = %host_id, hosts = self.hosts.len(), "host removed");
        // the host is gone, not the intent: its jobs are stopped, not
        // crashed
        for job_id in self.jobs.on_host(host_id) {
            self.note_stopped(job_id);
        }
        self.rectify_after_host_change();
    }

    /// Rectifies every formation whose expected count can move with the
    /// host set: omni types, plus formations with unplaced jobs.
    fn rectify_after_host_change(&mut self) {
        let omni_keys: Vec<FormationKey> = self
            .formations
            .iter()
            .filter(|f| f.processes.iter().any(|(t, c)| *c > 0 && f.is_omni(t)))
            .map(|f| f.key)
            .collect();
        for key in omni_keys {
            self.request_rectify(key);
        }
        let pending: HashSet<FormationKey> = self
            .jobs
            .iter()
            .filter(|j| {
                j.state == JobState::New && j.host_id.is_none() && j.formation.is_some()
            })
            .map(|j| j.key())
            .collect();
        for key in pending {
            self.request_rectify(key);
        }
    }

    async fn handle_sync_cluster(&mut self) {
        let listed = match self.cluster.hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                self.publish_error(format!("cluster sync: {e}"));
                return;
            }
        };
        let listed_ids: HashSet<HostId> = listed.iter().map(|h| h.id()).collect();
        for client in listed {
            if !self.hosts.contains(&client.id()) {
                self.add_host(client).await;
            }
        }
        for host_id in self.hosts.ids() {
            if !listed_ids.contains(&host_id) {
                self.remove_host(host_id);
            } else {
                self.check_host(host_id).await;
            }
        }
    }

    async fn check_host(&mut self, host_id: HostId) {
        let Some(client) = self.hosts.get(&host_id).map(|h| h.client.clone()) else {
            return;
        };
        match tokio::time::timeout(self.config.host_call_timeout, client.list_jobs()).await {
            Ok(Ok(active)) => {
                if let Some(host) = self.hosts.get_mut(&host_id) {
                    host.failed_checks = 0;
                    host.healthy = true;
                }
                self.reconcile_host_jobs(host_id, active);
            }
            Ok(Err(e)) => self.host_check_failed(host_id, &e.to_string()),
            Err(_) => self.host_check_failed(host_id, "deadline exceeded"),
        }
    }

    fn host_check_failed(&mut self, host_id: HostId, reason: &str) {
        let failed = {
            let Some(host) = self.hosts.get_mut(&host_id) else {
                return;
            };
            host.failed_checks += 1;
            host.failed_checks
        };
        warn!(host_id = %host_id, failed_checks = failed, reason, "host check failed");
        if failed >= self.config.max_host_checks {
            self.remove_host(host_id);
        }
    }

    /// Reconciles the registry against one host's job listing: adopts
    /// jobs we have never seen and stops the ones the host no longer
    /// reports.
    fn reconcile_host_jobs(&mut self, host_id: HostId, active: HashMap<JobId, ActiveJob>) {
        for (job_id, job) in &active {
            if !self.jobs.contains(job_id)
                && matches!(
                    job.state,
                    ReportedJobState::Starting | ReportedJobState::Running
                )
            {
                self.adopt_job(host_id, job.clone());
            }
        }
        let missing: Vec<JobId> = self
            .jobs
            .on_host(host_id)
            .into_iter()
            .filter(|id| !active.contains_key(id))
            .filter(|id| {
                self.jobs.get(id).map_or(false, |j| {
                    matches!(j.state, JobState::Running | JobState::Stopping)
                })
            })
            .collect();
        for job_id in missing {
            debug!(job_id = %job_id, host_id = %host_id, "job missing from host listing");
            self.note_stopped(job_id);
        }
        // stops the host never confirmed get retried by a rectify
        let unconfirmed: HashSet<FormationKey> = self
            .jobs
            .on_host(host_id)
            .into_iter()
            .filter(|id| active.contains_key(id))
            .filter_map(|id| self.jobs.get(&id))
            .filter(|job| job.state == JobState::Stopping)
            .map(|job| job.key())
            .collect();
        for key in unconfirmed {
            self.request_rectify(key);
        }
    }

    // -------------------------------------------------------------------
    // Jobs
    // -------------------------------------------------------------------

    fn handle_job_update(&mut self, host_id: HostId, update: ActiveJob) {
        let job_id = update.job_id;
        if !self.jobs.contains(&job_id) {
            if matches!(
                update.state,
                ReportedJobState::Starting | ReportedJobState::Running
            ) {
                self.adopt_job(host_id, update);
            }
            return;
        }
        let Some(state) = self.jobs.get(&job_id).map(|j| j.state) else {
            return;
        };
        match update.state {
            ReportedJobState::Starting => {
                if matches!(state, JobState::New | JobState::Starting) {
                    self.jobs.assign_host(job_id, host_id);
                    if let Some(job) = self.jobs.get_mut(&job_id) {
                        job.state = JobState::Starting;
                    }
                }
            }
            ReportedJobState::Running => {
                if matches!(state, JobState::New | JobState::Starting) {
                    self.jobs.assign_host(job_id, host_id);
                    let snapshot = {
                        let Some(job) = self.jobs.get_mut(&job_id) else {
                            return;
                        };
                        job.state = JobState::Running;
                        job.started_at = Utc::now();
                        job.snapshot()
                    };
                    self.bus.publish(EventKind::JobStart { job: snapshot });
                }
            }
            ReportedJobState::Stopped => self.note_stopped(job_id),
            ReportedJobState::Crashed => self.handle_job_crashed(job_id),
        }
    }

    /// Inserts a job the scheduler has never seen, observed on a host.
    /// If its formation is unknown it is kept as an orphan and linked by
    /// the first rectify after the formation arrives.
    fn adopt_job(&mut self, host_id: HostId, update: ActiveJob) {
        let key = FormationKey::new(update.app_id, update.release_id);
        let mut job = Job::new(update.app_id, update.release_id, update.proc_type.clone());
        job.id = update.job_id;
        job.formation = self.formations.contains(&key).then_some(key);
        job.state = match update.state {
            ReportedJobState::Starting => JobState::Starting,
            ReportedJobState::Running => JobState::Running,
            _ => return,
        };
        info!(
            job_id = %job.id,
            host_id = %host_id,
            key = %key,
            orphan = job.formation.is_none(),
            "adopted job observed on host"
        );
        let job_id = job.id;
        let running = job.state == JobState::Running;
        self.jobs.insert(job);
        self.jobs.assign_host(job_id, host_id);
        if running {
            if let Some(job) = self.jobs.get(&job_id) {
                let snapshot = job.snapshot();
                self.bus.publish(EventKind::JobStart { job: snapshot });
            }
        }
        self.request_rectify(key);
    }

    /// Marks a job stopped (host confirmation, host loss, or sync found
    /// it gone) and rectifies its formation.
    pub(crate) fn note_stopped(&mut self, job_id: JobId) {
        let Some(state) = self.jobs.get(&job_id).map(|j| j.state) else {
            return;
        };
        // scheduled and crashed jobs already left their host; a late
        // stop confirmation must not disturb the restart flow
        if matches!(
            state,
            JobState::Stopped | JobState::Scheduled | JobState::Crashed
        ) {
            return;
        }
        let (snapshot, key) = {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                return;
            };
            job.cancel_restart();
            job.state = JobState::Stopped;
            (job.snapshot(), job.key())
        };
        self.jobs.clear_host(job_id);
        if state.is_up() {
            self.bus.publish(EventKind::JobStop { job: snapshot });
        }
        self.request_rectify(key);
    }

    fn handle_job_crashed(&mut self, job_id: JobId) {
        let Some(state) = self.jobs.get(&job_id).map(|j| j.state) else {
            return;
        };
        match state {
            JobState::Stopped | JobState::Crashed | JobState::Scheduled => return,
            // the intent was to stop; the manner of death is irrelevant
            JobState::Stopping => {
                self.note_stopped(job_id);
                return;
            }
            _ => {}
        }
        let stabilization = self.config.restart_stabilization_window;
        let snapshot = {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                return;
            };
            job.cancel_restart();
            if state == JobState::Running {
                let ran_for = (Utc::now() - job.started_at).to_std().unwrap_or_default();
                if ran_for >= stabilization {
                    job.restarts = 0;
                }
            }
            job.state = JobState::Crashed;
            job.snapshot()
        };
        self.jobs.clear_host(job_id);
        if state.is_up() {
            self.bus.publish(EventKind::JobStop { job: snapshot });
        }
        self.apply_crash_policy(job_id);
    }

    /// Decides what a crashed job becomes: a scheduled restart with
    /// exponential backoff if its formation still wants the slot,
    /// otherwise stopped.
    pub(crate) fn apply_crash_policy(&mut self, job_id: JobId) {
        if !self.is_leader {
            // passive schedulers record the crash; the leader owns the
            // restart
            return;
        }
        let Some((key, proc_type, linked)) = self
            .jobs
            .get(&job_id)
            .map(|j| (j.key(), j.proc_type.clone(), j.formation.is_some()))
        else {
            return;
        };
        let wants_slot = linked
            && self.formations.get(&key).map_or(false, |formation| {
                crate::rectify::expected_count(formation, &proc_type, &self.hosts)
                    > self.jobs.active_count(&key, &proc_type)
            });
        if !wants_slot {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.state = JobState::Stopped;
            }
            debug!(job_id = %job_id, key = %key, "crashed job slot no longer wanted");
            self.request_rectify(key);
            return;
        }
        let (delay, restarts) = {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                return;
            };
            let delay = self.restart_backoff.delay(job.restarts);
            job.restarts += 1;
            job.state = JobState::Scheduled;
            (delay, job.restarts)
        };
        info!(
            job_id = %job_id,
            delay_ms = delay.as_millis() as u64,
            restarts,
            "scheduling job restart"
        );
        let tx = self.tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::JobRestart(job_id)).await;
        });
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.restart_timer = Some(timer);
        }
    }

    async fn handle_job_restart(&mut self, job_id: JobId) {
        {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                return;
            };
            // the timer may race a cancellation or a stop
            if job.state != JobState::Scheduled {
                return;
            }
            job.restart_timer = None;
            job.state = JobState::New;
        }
        self.try_start(job_id).await;
    }

    /// Places a `new` job and asks the chosen host to start it. A
    /// placement failure leaves the job `new`; later rectifies retry.
    pub(crate) async fn try_start(&mut self, job_id: JobId) {
        if !self.is_leader {
            return;
        }
        let host_id = {
            let Some(job) = self.jobs.get(&job_id) else {
                return;
            };
            if job.state != JobState::New || job.host_id.is_some() {
                return;
            }
            match self.place(job) {
                Ok(host_id) => host_id,
                Err(e) => {
                    debug!(job_id = %job_id, error = %e, "placement deferred");
                    return;
                }
            }
        };
        self.jobs.assign_host(job_id, host_id);
        let Some((key, proc_type)) = self
            .jobs
            .get(&job_id)
            .map(|j| (j.key(), j.proc_type.clone()))
        else {
            return;
        };
        let Some(artifact_uri) = self.formations.get(&key).map(|f| f.artifact.uri.clone())
        else {
            return;
        };
        let Some(client) = self.hosts.get(&host_id).map(|h| h.client.clone()) else {
            return;
        };
        let config = JobConfig {
            id: job_id,
            app_id: key.app_id,
            release_id: key.release_id,
            proc_type: proc_type.clone(),
            artifact_uri,
        };
        info!(job_id = %job_id, host_id = %host_id, proc_type = %proc_type, "starting job");
        match tokio::time::timeout(self.config.host_call_timeout, client.add_job(config)).await {
            Ok(Ok(accepted)) => {
                if accepted != job_id {
                    warn!(
                        job_id = %job_id,
                        accepted = %accepted,
                        "host accepted job under a different id"
                    );
                }
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    if job.state == JobState::New {
                        job.state = JobState::Starting;
                    }
                }
            }
            Ok(Err(e)) => self.start_failed(job_id, host_id, &e.to_string()),
            Err(_) => self.start_failed(job_id, host_id, "deadline exceeded"),
        }
    }

    fn start_failed(&mut self, job_id: JobId, host_id: HostId, reason: &str) {
        warn!(job_id = %job_id, host_id = %host_id, reason, "host rejected job start");
        self.jobs.clear_host(job_id);
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.state = JobState::Crashed;
        }
        self.apply_crash_policy(job_id);
    }

    /// Stops one job. Unplaced jobs drop straight to `stopped`; placed
    /// jobs move to `stopping` and wait for the host's confirmation.
    pub(crate) async fn stop_job(&mut self, job_id: JobId) -> Result<(), SchedulerError> {
        let Some((state, host_id)) = self.jobs.get(&job_id).map(|j| (j.state, j.host_id)) else {
            return Ok(());
        };
        match state {
            JobState::Stopped | JobState::Crashed => Ok(()),
            JobState::New | JobState::Scheduled if host_id.is_none() => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.cancel_restart();
                    job.state = JobState::Stopped;
                }
                debug!(job_id = %job_id, "stopped unplaced job");
                Ok(())
            }
            _ => {
                let Some(host_id) = host_id else {
                    // placed state without a host cannot converge; drop it
                    self.note_stopped(job_id);
                    return Ok(());
                };
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.cancel_restart();
                    job.state = JobState::Stopping;
                }
                let Some(client) = self.hosts.get(&host_id).map(|h| h.client.clone()) else {
                    // host already gone, nothing will confirm the stop
                    self.note_stopped(job_id);
                    return Ok(());
                };
                debug!(job_id = %job_id, host_id = %host_id, "stopping job");
                match tokio::time::timeout(self.config.host_call_timeout, client.stop_job(job_id))
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        // stays `stopping`; the next rectify retries
                        warn!(job_id = %job_id, host_id = %host_id, error = %e, "stop failed");
                        Err(SchedulerError::HostUnreachable {
                            host_id,
                            reason: e.to_string(),
                        })
                    }
                    Err(_) => {
                        warn!(job_id = %job_id, host_id = %host_id, "stop timed out");
                        Err(SchedulerError::HostUnreachable {
                            host_id,
                            reason: "deadline exceeded".to_string(),
                        })
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Requests and leadership
    // -------------------------------------------------------------------

    async fn handle_stop_request(
        &mut self,
        app_id: AppId,
        release_id: ReleaseId,
        proc_type: String,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    ) {
        let result = if !self.is_leader {
            Err(SchedulerError::NotLeader)
        } else {
            let key = FormationKey::new(app_id, release_id);
            match self.find_job_to_stop(&key, &proc_type) {
                Ok(job_id) => self.stop_job(job_id).await,
                Err(e) => Err(e),
            }
        };
        let _ = reply.send(result);
    }

    async fn handle_leader_change(&mut self, is_leader: bool) {
        if is_leader == self.is_leader {
            return;
        }
        self.is_leader = is_leader;
        info!(is_leader, "leader state changed");
        self.bus.publish(EventKind::LeaderChange { is_leader });
        if is_leader {
            // take over within one rectify cycle
            for key in self.formations.keys() {
                self.rectify(key).await;
            }
        } else {
            self.jobs.cancel_all_timers();
        }
    }

    /// Requests a rectify for `key`; requests inside the coalesce window
    /// collapse to a single pass.
    pub(crate) fn request_rectify(&mut self, key: FormationKey) {
        if !self.pending_rectify.insert(key) {
            return;
        }
        let tx = self.tx.clone();
        let window = self.config.rectify_coalesce_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(Command::RectifyTick(key)).await;
        });
    }

    pub(crate) fn publish_error(&mut self, message: String) {
        warn!(error = %message, "scheduler error");
        self.bus.publish(EventKind::Error { message });
    }

    fn finish(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.hosts.stop_watchers();
        self.jobs.cancel_all_timers();
        self.rx.close();
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Command::Placement(req) => {
                    let _ = req.reply.send(Err(SchedulerError::ShuttingDown));
                }
                Command::StopJob { reply, .. } => {
                    let _ = reply.send(Err(SchedulerError::ShuttingDown));
                }
                Command::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                // dropping the reply surfaces ErrShuttingDown to callers
                _ => {}
            }
        }
        self.bus.close();
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::leader_scheduler;
    use super::*;
    use crate::fake::FakeHostClient;
    use crate::types::{App, Artifact, ProcessSpec, Release};

    fn insert_formation(s: &mut Scheduler, processes: &[(&str, usize)]) -> FormationKey {
        let artifact = Artifact {
            id: keel_id::ArtifactId::new(),
            uri: "docker://app".into(),
        };
        let app = App {
            id: AppId::new(),
            name: "app".into(),
        };
        let release = Release {
            id: ReleaseId::new(),
            artifact_id: artifact.id,
            processes: processes
                .iter()
                .map(|(t, _)| (t.to_string(), ProcessSpec::default()))
                .collect(),
        };
        let formation = Formation::new(
            app,
            release,
            artifact,
            processes.iter().map(|(t, c)| (t.to_string(), *c)).collect(),
            HashMap::new(),
        );
        let key = formation.key;
        s.formations.insert(formation);
        key
    }

    fn insert_host(s: &mut Scheduler) -> HostId {
        let client = Arc::new(FakeHostClient::new());
        let host_id = client.id();
        s.hosts.insert(Host {
            id: host_id,
            tags: HashMap::new(),
            healthy: true,
            failed_checks: 0,
            client,
            watcher: None,
        });
        host_id
    }

    #[tokio::test]
    async fn test_crash_schedules_backoff_restart() {
        let mut s = leader_scheduler();
        let key = insert_formation(&mut s, &[("web", 1)]);
        let host_id = insert_host(&mut s);

        let mut job = Job::new(key.app_id, key.release_id, "web");
        job.formation = Some(key);
        job.state = JobState::Running;
        let job_id = job.id;
        s.jobs.insert(job);
        s.jobs.assign_host(job_id, host_id);

        s.handle_job_crashed(job_id);

        let job = s.jobs.get(&job_id).unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.restarts, 1);
        assert!(job.restart_pending());
        assert!(job.host_id.is_none());
    }

    #[tokio::test]
    async fn test_crash_of_unwanted_job_stops_it() {
        let mut s = leader_scheduler();
        let key = insert_formation(&mut s, &[("web", 0)]);
        let host_id = insert_host(&mut s);

        let mut job = Job::new(key.app_id, key.release_id, "web");
        job.formation = Some(key);
        job.state = JobState::Running;
        let job_id = job.id;
        s.jobs.insert(job);
        s.jobs.assign_host(job_id, host_id);

        s.handle_job_crashed(job_id);
        assert_eq!(s.jobs.get(&job_id).unwrap().state, JobState::Stopped);
    }

    #[tokio::test]
    async fn test_passive_scheduler_leaves_crash_alone() {
        let mut s = leader_scheduler();
        s.is_leader = false;
        let key = insert_formation(&mut s, &[("web", 1)]);
        let host_id = insert_host(&mut s);

        let mut job = Job::new(key.app_id, key.release_id, "web");
        job.formation = Some(key);
        job.state = JobState::Running;
        let job_id = job.id;
        s.jobs.insert(job);
        s.jobs.assign_host(job_id, host_id);

        s.handle_job_crashed(job_id);
        let job = s.jobs.get(&job_id).unwrap();
        assert_eq!(job.state, JobState::Crashed);
        assert!(!job.restart_pending());
    }

    #[tokio::test]
    async fn test_stale_stop_event_does_not_disturb_restart() {
        let mut s = leader_scheduler();
        let key = insert_formation(&mut s, &[("web", 1)]);
        let host_id = insert_host(&mut s);

        let mut job = Job::new(key.app_id, key.release_id, "web");
        job.formation = Some(key);
        job.state = JobState::Running;
        let job_id = job.id;
        s.jobs.insert(job);
        s.jobs.assign_host(job_id, host_id);

        s.handle_job_crashed(job_id);
        assert_eq!(s.jobs.get(&job_id).unwrap().state, JobState::Scheduled);

        // a late stop confirmation for the dead incarnation
        s.note_stopped(job_id);
        assert_eq!(s.jobs.get(&job_id).unwrap().state, JobState::Scheduled);
    }

    #[tokio::test]
    async fn test_stopped_job_id_never_resurrected() {
        let mut s = leader_scheduler();
        let key = insert_formation(&mut s, &[("web", 1)]);
        let host_id = insert_host(&mut s);

        let mut job = Job::new(key.app_id, key.release_id, "web");
        job.formation = Some(key);
        job.state = JobState::Stopped;
        let job_id = job.id;
        s.jobs.insert(job);

        s.handle_job_update(
            host_id,
            ActiveJob {
                job_id,
                app_id: key.app_id,
                release_id: key.release_id,
                proc_type: "web".into(),
                state: ReportedJobState::Running,
            },
        );
        assert_eq!(s.jobs.get(&job_id).unwrap().state, JobState::Stopped);
        assert!(s.jobs.running().is_empty());
    }

    #[tokio::test]
    async fn test_host_removal_stops_jobs_not_crashed() {
        let mut s = leader_scheduler();
        let key = insert_formation(&mut s, &[("web", 1)]);
        let host_id = insert_host(&mut s);

        let mut job = Job::new(key.app_id, key.release_id, "web");
        job.formation = Some(key);
        job.state = JobState::Running;
        let job_id = job.id;
        s.jobs.insert(job);
        s.jobs.assign_host(job_id, host_id);

        s.remove_host(host_id);
        let job = s.jobs.get(&job_id).unwrap();
        assert_eq!(job.state, JobState::Stopped);
        assert_eq!(job.restarts, 0);
    }
}
