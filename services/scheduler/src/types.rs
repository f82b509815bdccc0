//! Wire types shared with the controller and host agents.

use std::collections::HashMap;

use keel_id::{AppId, ArtifactId, HostId, JobId, ReleaseId};
use serde::{Deserialize, Serialize};

/// An application, as stored by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub name: String,
}

/// An artifact referenced by a release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub uri: String,
}

/// Per-process-type settings on a release.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Omni processes run one instance per healthy matching host,
    /// overriding the formation's desired count.
    #[serde(default)]
    pub omni: bool,
}

/// A release: an artifact plus its process types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub artifact_id: ArtifactId,
    #[serde(default)]
    pub processes: HashMap<String, ProcessSpec>,
}

/// A formation change as streamed by the controller: desired counts and
/// tag constraints for one (app, release). All-zero counts mean delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormationUpdate {
    pub app_id: AppId,
    pub release_id: ReleaseId,
    #[serde(default)]
    pub processes: HashMap<String, usize>,
    #[serde(default)]
    pub tags: HashMap<String, HashMap<String, String>>,
}

impl FormationUpdate {
    /// True when every desired count is zero, i.e. a delete.
    pub fn is_empty(&self) -> bool {
        self.processes.values().all(|count| *count == 0)
    }
}

/// Job state as reported by a host agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedJobState {
    Starting,
    Running,
    Stopped,
    Crashed,
}

/// Everything a host needs to start a job. The scheduler supplies the
/// job id; the host echoes it back on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: JobId,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub proc_type: String,
    pub artifact_uri: String,
}

/// A job record as reported by a host, both in `list_jobs` responses and
/// on the per-host event stream. Carries enough metadata to reconstruct
/// jobs the scheduler has never seen (orphans).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job_id: JobId,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub proc_type: String,
    pub state: ReportedJobState,
}

/// Cluster membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEventKind {
    Up,
    Down,
}

/// A host joining or leaving the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEvent {
    pub host_id: HostId,
    pub kind: HostEventKind,
}
