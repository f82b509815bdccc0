//! Rectification: converging one formation's observed jobs toward its
//! desired counts.

use std::collections::BTreeSet;

use keel_id::JobId;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::events::EventKind;
use crate::formation::{Formation, FormationKey};
use crate::host::Hosts;
use crate::job::{Job, JobState};
use crate::scheduler::Scheduler;

/// Expected instance count for one process type: the desired count, or
/// for omni types the number of healthy hosts matching its tags. A
/// desired count of zero always means zero, omni or not.
pub(crate) fn expected_count(formation: &Formation, proc_type: &str, hosts: &Hosts) -> usize {
    let desired = formation.desired(proc_type);
    if desired == 0 {
        return 0;
    }
    if formation.is_omni(proc_type) {
        hosts.healthy_matching(formation.tags_for(proc_type))
    } else {
        desired
    }
}

impl Scheduler {
    /// Runs one rectify pass for `key`. Exactly one `Rectify` event is
    /// published per invocation, action or not. Passive schedulers skip
    /// entirely.
    pub(crate) async fn rectify(&mut self, key: FormationKey) {
        if !self.is_leader {
            return;
        }
        self.bus.publish(EventKind::Rectify { key });

        // orphans whose formation has arrived get linked and counted
        // from here on
        if self.formations.contains(&key) {
            let orphans: Vec<JobId> = self
                .jobs
                .for_formation(&key)
                .iter()
                .filter(|job| job.formation.is_none())
                .map(|job| job.id)
                .collect();
            for job_id in orphans {
                debug!(job_id = %job_id, key = %key, "linking orphan job");
                self.jobs.link_formation(job_id, key);
            }
        }

        let Some(formation) = self.formations.get(&key) else {
            // jobs for a formation we do not know stay untouched
            debug!(key = %key, "rectify skipped, formation unknown");
            return;
        };

        // the plan is computed up front so the formation borrow does not
        // overlap the mutations below
        let mut proc_types: BTreeSet<String> = formation.processes.keys().cloned().collect();
        for job in self.jobs.for_formation(&key) {
            if job.state.is_active() {
                proc_types.insert(job.proc_type.clone());
            }
        }
        let plan: Vec<(String, usize)> = proc_types
            .into_iter()
            .map(|proc_type| {
                let expected = expected_count(formation, &proc_type, &self.hosts);
                (proc_type, expected)
            })
            .collect();

        for (proc_type, expected) in plan {
            let observed = self.jobs.active_count(&key, &proc_type);
            if expected != observed {
                info!(
                    key = %key,
                    proc_type = %proc_type,
                    expected,
                    observed,
                    "rectifying formation"
                );
            }

            if expected > observed {
                for _ in observed..expected {
                    let mut job = Job::new(key.app_id, key.release_id, proc_type.clone());
                    job.formation = Some(key);
                    self.jobs.insert(job);
                }
            } else if expected < observed {
                for _ in expected..observed {
                    match self.find_job_to_stop(&key, &proc_type) {
                        Ok(job_id) => {
                            if let Err(e) = self.stop_job(job_id).await {
                                warn!(job_id = %job_id, error = %e, "rectify stop failed");
                            }
                        }
                        Err(e) => {
                            warn!(key = %key, proc_type = %proc_type, error = %e, "nothing to stop");
                            break;
                        }
                    }
                }
            }

            // place anything still waiting for a host, including the
            // jobs created above
            let pending: Vec<JobId> = self
                .jobs
                .for_formation(&key)
                .iter()
                .filter(|job| {
                    job.proc_type == proc_type
                        && job.state == JobState::New
                        && job.host_id.is_none()
                })
                .map(|job| job.id)
                .collect();
            for job_id in pending {
                self.try_start(job_id).await;
            }

            // stops the host never confirmed are re-issued
            let lingering: Vec<JobId> = self
                .jobs
                .for_formation(&key)
                .iter()
                .filter(|job| job.proc_type == proc_type && job.state == JobState::Stopping)
                .map(|job| job.id)
                .collect();
            for job_id in lingering {
                let _ = self.stop_job(job_id).await;
            }

            // restarts whose timers died with a previous leadership are
            // re-armed by dropping the job back to `new`
            let stuck: Vec<JobId> = self
                .jobs
                .for_formation(&key)
                .iter()
                .filter(|job| job.proc_type == proc_type && job.state == JobState::Scheduled && !job.restart_pending())
                .map(|job| job.id)
                .collect();
            for job_id in stuck {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.restart_timer = None;
                    job.state = JobState::New;
                }
                self.try_start(job_id).await;
            }
        }

        // placement failures retry on the coalesce cadence until a host
        // appears or the desired count drops
        let unplaced = self
            .jobs
            .for_formation(&key)
            .iter()
            .any(|job| job.state == JobState::New && job.host_id.is_none());
        if unplaced {
            self.request_rectify(key);
        }

        // a fully drained formation is garbage once nothing references it
        let drained = self.formations.get(&key).map_or(false, Formation::is_empty)
            && self
                .jobs
                .for_formation(&key)
                .iter()
                .all(|job| !job.state.is_active());
        if drained {
            self.formations.remove(&key);
            debug!(key = %key, "removed drained formation");
        }
    }

    /// Selects the job to stop for (formation, type): less-advanced
    /// states first (`new`/`scheduled`, then `starting`, then `running`),
    /// most recently started first within a state. Orphans are never
    /// picked.
    pub(crate) fn find_job_to_stop(
        &self,
        key: &FormationKey,
        proc_type: &str,
    ) -> Result<JobId, SchedulerError> {
        let mut candidates: Vec<&Job> = self
            .jobs
            .for_formation(key)
            .into_iter()
            .filter(|job| {
                job.formation.is_some() && job.proc_type == proc_type && job.state.is_active()
            })
            .collect();
        if candidates.is_empty() {
            return Err(SchedulerError::NoJobsOfType {
                proc_type: proc_type.to_string(),
            });
        }
        candidates.sort_by(|a, b| {
            a.state
                .stop_rank()
                .cmp(&b.state.stop_rank())
                .then_with(|| b.started_at.cmp(&a.started_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(candidates[0].id)
    }
}
