//! Job registry and lifecycle states.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use keel_id::{AppId, HostId, JobId, ReleaseId};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::formation::FormationKey;

/// Lifecycle state of a job. Transitions are performed only by the
/// event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created but not yet placed on a host.
    New,
    /// Crashed and waiting on a restart timer.
    Scheduled,
    /// Accepted by a host, start in flight.
    Starting,
    Running,
    /// Stop requested, awaiting host confirmation.
    Stopping,
    Stopped,
    Crashed,
}

impl JobState {
    /// States that count toward a formation's observed total.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::New | JobState::Scheduled | JobState::Starting | JobState::Running
        )
    }

    /// States in which the job occupies a host.
    pub fn is_up(self) -> bool {
        matches!(self, JobState::Starting | JobState::Running)
    }

    /// Ordering tier for stop selection: less-advanced states go first.
    pub(crate) fn stop_rank(self) -> u8 {
        match self {
            JobState::New | JobState::Scheduled => 0,
            JobState::Starting => 1,
            JobState::Running => 2,
            _ => 3,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::New => "new",
            JobState::Scheduled => "scheduled",
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Stopping => "stopping",
            JobState::Stopped => "stopped",
            JobState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// A job tracked by the scheduler.
///
/// References to the owning formation and host are keys into the other
/// registries, never owning pointers. `formation` is `None` for orphan
/// jobs observed on a host before their formation is known.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub formation: Option<FormationKey>,
    pub proc_type: String,
    pub host_id: Option<HostId>,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub restarts: u32,

    /// Live restart timer while `state == Scheduled`.
    pub(crate) restart_timer: Option<JoinHandle<()>>,
}

impl Job {
    pub fn new(app_id: AppId, release_id: ReleaseId, proc_type: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            app_id,
            release_id,
            formation: None,
            proc_type: proc_type.into(),
            host_id: None,
            state: JobState::New,
            started_at: Utc::now(),
            restarts: 0,
            restart_timer: None,
        }
    }

    /// The formation key this job belongs to, resolved or not.
    pub fn key(&self) -> FormationKey {
        FormationKey::new(self.app_id, self.release_id)
    }

    pub(crate) fn cancel_restart(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }

    /// Whether a restart timer is armed and has not yet fired.
    pub(crate) fn restart_pending(&self) -> bool {
        self.restart_timer
            .as_ref()
            .map_or(false, |timer| !timer.is_finished())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            formation: self.formation,
            app_id: self.app_id,
            release_id: self.release_id,
            proc_type: self.proc_type.clone(),
            host_id: self.host_id,
            state: self.state,
            restarts: self.restarts,
            started_at: self.started_at,
        }
    }
}

/// Point-in-time copy of a job, published on the event stream and
/// returned from queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub formation: Option<FormationKey>,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub proc_type: String,
    pub host_id: Option<HostId>,
    pub state: JobState,
    pub restarts: u32,
    pub started_at: DateTime<Utc>,
}

/// Job registry: primary map by id with secondary indexes by formation
/// key and by host.
#[derive(Debug, Default)]
pub struct Jobs {
    by_id: HashMap<JobId, Job>,
    by_formation: HashMap<FormationKey, HashSet<JobId>>,
    by_host: HashMap<HostId, HashSet<JobId>>,
}

impl Jobs {
    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.by_id.get_mut(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn insert(&mut self, job: Job) {
        self.by_formation.entry(job.key()).or_default().insert(job.id);
        if let Some(host_id) = job.host_id {
            self.by_host.entry(host_id).or_default().insert(job.id);
        }
        self.by_id.insert(job.id, job);
    }

    /// Assigns the job to a host, keeping the host index in sync.
    pub fn assign_host(&mut self, id: JobId, host_id: HostId) {
        let Some(job) = self.by_id.get_mut(&id) else {
            return;
        };
        if let Some(previous) = job.host_id.replace(host_id) {
            if let Some(set) = self.by_host.get_mut(&previous) {
                set.remove(&id);
            }
        }
        self.by_host.entry(host_id).or_default().insert(id);
    }

    /// Detaches the job from its host, keeping the host index in sync.
    pub fn clear_host(&mut self, id: JobId) {
        let Some(job) = self.by_id.get_mut(&id) else {
            return;
        };
        if let Some(previous) = job.host_id.take() {
            if let Some(set) = self.by_host.get_mut(&previous) {
                set.remove(&id);
            }
        }
    }

    /// Resolves an orphan job's formation reference.
    pub fn link_formation(&mut self, id: JobId, key: FormationKey) {
        if let Some(job) = self.by_id.get_mut(&id) {
            job.formation = Some(key);
        }
    }

    /// Jobs whose (app, release) matches `key`, including orphans.
    pub fn for_formation(&self, key: &FormationKey) -> Vec<&Job> {
        self.by_formation
            .get(key)
            .map(|ids| {
                let mut jobs: Vec<&Job> =
                    ids.iter().filter_map(|id| self.by_id.get(id)).collect();
                jobs.sort_by_key(|job| job.id);
                jobs
            })
            .unwrap_or_default()
    }

    /// Ids of jobs placed on `host_id`.
    pub fn on_host(&self, host_id: HostId) -> Vec<JobId> {
        self.by_host
            .get(&host_id)
            .map(|ids| {
                let mut ids: Vec<JobId> = ids.iter().copied().collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    /// Count of active jobs for (formation, type).
    pub fn active_count(&self, key: &FormationKey, proc_type: &str) -> usize {
        self.for_formation(key)
            .iter()
            .filter(|job| job.proc_type == proc_type && job.state.is_active())
            .count()
    }

    /// Active jobs of (formation, type) already placed on `host_id`.
    /// This is the load figure placement balances on.
    pub fn active_on_host(&self, key: &FormationKey, proc_type: &str, host_id: HostId) -> usize {
        self.by_host
            .get(&host_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.by_id.get(id))
                    .filter(|job| {
                        job.key() == *key
                            && job.proc_type == proc_type
                            && job.state.is_active()
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Snapshots of jobs currently occupying a host.
    pub fn running(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .by_id
            .values()
            .filter(|job| job.state.is_up())
            .map(Job::snapshot)
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub(crate) fn cancel_all_timers(&mut self) {
        for job in self.by_id.values_mut() {
            job.cancel_restart();
        }
    }
}
