//! Scheduler error types.

use keel_id::HostId;
use thiserror::Error;

/// Errors surfaced by scheduler operations.
///
/// Transport failures against hosts and streams are recovered internally
/// (reconnect and resync); only placement, stop requests and shutdown are
/// externally visible failures.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Placement found no healthy host satisfying the job's tag
    /// requirements. The job stays `new` and is retried on later
    /// rectifies until a host appears or the desired count drops.
    #[error("no eligible hosts for {proc_type} job")]
    NoEligibleHosts { proc_type: String },

    /// A stop was requested for a process type with no live jobs.
    #[error("no {proc_type} jobs running")]
    NoJobsOfType { proc_type: String },

    /// A host call failed or timed out.
    #[error("host {host_id} unreachable: {reason}")]
    HostUnreachable { host_id: HostId, reason: String },

    /// A mutating request reached a scheduler in passive mode.
    #[error("scheduler is not the cluster leader")]
    NotLeader,

    /// The scheduler is draining and no longer services requests.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// An external stream dropped. Internal to the adapters, which
    /// reconnect and force a resync; never surfaced to callers.
    #[error("stream lost: {0}")]
    StreamLost(String),
}
