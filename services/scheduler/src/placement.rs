//! Job placement.
//!
//! Placement filters the host registry down to healthy hosts whose tag
//! maps satisfy the formation's requirements for the job's process type,
//! then picks the host carrying the fewest jobs of that same
//! (formation, type). Ties break on ascending host id, so placement is
//! deterministic and yields round-robin behavior per (formation, type)
//! without a persisted cursor. The load-based tiebreak is idempotent
//! across scheduler restarts and rebalances as hosts come and go.

use keel_id::{HostId, JobId};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::SchedulerError;
use crate::job::Job;
use crate::scheduler::Scheduler;

/// A synchronous placement request: the loop writes the reply before
/// moving to the next command.
#[derive(Debug)]
pub struct PlacementRequest {
    pub job_id: JobId,
    pub(crate) reply: oneshot::Sender<Result<HostId, SchedulerError>>,
}

impl Scheduler {
    /// Chooses a host for a pending job.
    pub(crate) fn place(&self, job: &Job) -> Result<HostId, SchedulerError> {
        let key = job.key();
        let no_hosts = || SchedulerError::NoEligibleHosts {
            proc_type: job.proc_type.clone(),
        };
        let Some(formation) = self.formations.get(&key) else {
            return Err(no_hosts());
        };
        let required = formation.tags_for(&job.proc_type);

        let mut best: Option<(usize, HostId)> = None;
        for host in self.hosts.iter() {
            if !host.healthy || !host.satisfies(required) {
                continue;
            }
            let load = self.jobs.active_on_host(&key, &job.proc_type, host.id);
            if best.map_or(true, |(least, _)| load < least) {
                best = Some((load, host.id));
            }
        }
        best.map(|(_, host_id)| host_id).ok_or_else(no_hosts)
    }

    pub(crate) fn handle_placement_request(&mut self, req: PlacementRequest) {
        let result = match self.jobs.get(&req.job_id) {
            Some(job) => self.place(job),
            None => Err(SchedulerError::NoJobsOfType {
                proc_type: "unknown".to_string(),
            }),
        };
        match &result {
            Ok(host_id) => {
                debug!(job_id = %req.job_id, host_id = %host_id, "placed job");
                self.jobs.assign_host(req.job_id, *host_id);
            }
            Err(e) => debug!(job_id = %req.job_id, error = %e, "placement failed"),
        }
        let _ = req.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use keel_id::HostId;

    use crate::fake::FakeHostClient;
    use crate::formation::Formation;
    use crate::host::Host;
    use crate::job::Job;
    use crate::scheduler::testutil::leader_scheduler;
    use crate::scheduler::Scheduler;
    use crate::types::{App, Artifact, ProcessSpec, Release};

    fn tag_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn insert_tagged_host(s: &mut Scheduler, id: HostId, tags: HashMap<String, String>) {
        s.hosts.insert(Host {
            id,
            tags,
            healthy: true,
            failed_checks: 0,
            client: Arc::new(FakeHostClient::new()),
            watcher: None,
        });
    }

    fn tagged_formation(s: &mut Scheduler) -> crate::formation::FormationKey {
        let artifact = Artifact {
            id: keel_id::ArtifactId::new(),
            uri: "docker://app".into(),
        };
        let app = App {
            id: keel_id::AppId::new(),
            name: "app".into(),
        };
        let release = Release {
            id: keel_id::ReleaseId::new(),
            artifact_id: artifact.id,
            processes: ["web", "db", "worker", "clock"]
                .into_iter()
                .map(|t| (t.to_string(), ProcessSpec::default()))
                .collect(),
        };
        let tags = [
            ("db", tag_map(&[("disk", "ssd")])),
            ("worker", tag_map(&[("cpu", "fast")])),
            ("clock", tag_map(&[("disk", "ssd"), ("cpu", "slow")])),
        ]
        .into_iter()
        .map(|(t, m)| (t.to_string(), m))
        .collect();
        let formation = Formation::new(app, release, artifact, HashMap::new(), tags);
        let key = formation.key;
        s.formations.insert(formation);
        key
    }

    #[tokio::test]
    async fn test_tag_constrained_round_robin() {
        let mut s = leader_scheduler();

        // three hosts, addressed below by their sorted (iteration) order
        let mut ids = [HostId::new(), HostId::new(), HostId::new()];
        ids.sort();
        let [h1, h2, h3] = ids;
        insert_tagged_host(&mut s, h1, tag_map(&[("disk", "mag"), ("cpu", "fast")]));
        insert_tagged_host(&mut s, h2, tag_map(&[("disk", "ssd"), ("cpu", "slow")]));
        insert_tagged_host(&mut s, h3, tag_map(&[("disk", "ssd"), ("cpu", "fast")]));

        let key = tagged_formation(&mut s);

        let expected = [
            // web (no tags) round-robins across all hosts
            ("web", h1),
            ("web", h2),
            ("web", h3),
            ("web", h1),
            ("web", h2),
            ("web", h3),
            // db (disk=ssd) alternates between h2 and h3
            ("db", h2),
            ("db", h3),
            ("db", h2),
            ("db", h3),
            // worker (cpu=fast) alternates between h1 and h3
            ("worker", h1),
            ("worker", h3),
            ("worker", h1),
            ("worker", h3),
            // clock (disk=ssd, cpu=slow) only fits h2
            ("clock", h2),
            ("clock", h2),
            ("clock", h2),
        ];

        for (i, (proc_type, want)) in expected.iter().enumerate() {
            let mut job = Job::new(key.app_id, key.release_id, *proc_type);
            job.formation = Some(key);
            let job_id = job.id;
            s.jobs.insert(job);

            let placed = s
                .place(s.jobs.get(&job_id).unwrap())
                .unwrap_or_else(|e| panic!("placing job {i} ({proc_type}): {e}"));
            assert_eq!(placed, *want, "job {i} ({proc_type})");
            s.jobs.assign_host(job_id, placed);
        }
    }

    #[tokio::test]
    async fn test_no_eligible_hosts() {
        let mut s = leader_scheduler();
        let key = tagged_formation(&mut s);

        // one host that satisfies nothing tag-constrained
        let id = HostId::new();
        insert_tagged_host(&mut s, id, tag_map(&[("disk", "mag"), ("cpu", "slow")]));

        let mut job = Job::new(key.app_id, key.release_id, "db");
        job.formation = Some(key);
        let job_id = job.id;
        s.jobs.insert(job);

        let err = s.place(s.jobs.get(&job_id).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            crate::SchedulerError::NoEligibleHosts { .. }
        ));
    }

    #[tokio::test]
    async fn test_unhealthy_hosts_filtered() {
        let mut s = leader_scheduler();
        let key = tagged_formation(&mut s);

        let mut ids = [HostId::new(), HostId::new()];
        ids.sort();
        insert_tagged_host(&mut s, ids[0], tag_map(&[]));
        insert_tagged_host(&mut s, ids[1], tag_map(&[]));
        s.hosts.get_mut(&ids[0]).unwrap().healthy = false;

        let mut job = Job::new(key.app_id, key.release_id, "web");
        job.formation = Some(key);
        let job_id = job.id;
        s.jobs.insert(job);

        assert_eq!(s.place(s.jobs.get(&job_id).unwrap()).unwrap(), ids[1]);
    }
}
