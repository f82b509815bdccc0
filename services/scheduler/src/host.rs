//! Host registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use keel_id::HostId;
use tokio::task::JoinHandle;

use crate::clients::HostClient;

/// A cluster host as tracked by the scheduler.
pub struct Host {
    pub id: HostId,
    pub tags: HashMap<String, String>,
    pub healthy: bool,

    /// Consecutive failed health checks.
    pub(crate) failed_checks: u32,

    /// Client for actuation and probing.
    pub(crate) client: Arc<dyn HostClient>,

    /// Task forwarding this host's job events into the loop.
    pub(crate) watcher: Option<JoinHandle<()>>,
}

impl Host {
    /// True when this host's tag map is a superset of `required`.
    /// Absent or empty requirements match any host.
    pub fn satisfies(&self, required: Option<&HashMap<String, String>>) -> bool {
        required.map_or(true, |req| {
            req.iter().all(|(key, value)| self.tags.get(key) == Some(value))
        })
    }

    pub(crate) fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("tags", &self.tags)
            .field("healthy", &self.healthy)
            .field("failed_checks", &self.failed_checks)
            .finish()
    }
}

/// Host registry. Backed by a `BTreeMap` so iteration order is stable,
/// which makes placement tie-breaks deterministic.
#[derive(Debug, Default)]
pub struct Hosts {
    inner: BTreeMap<HostId, Host>,
}

impl Hosts {
    pub fn get(&self, id: &HostId) -> Option<&Host> {
        self.inner.get(id)
    }

    pub fn get_mut(&mut self, id: &HostId) -> Option<&mut Host> {
        self.inner.get_mut(id)
    }

    pub fn contains(&self, id: &HostId) -> bool {
        self.inner.contains_key(id)
    }

    pub fn insert(&mut self, host: Host) -> Option<Host> {
        self.inner.insert(host.id, host)
    }

    pub fn remove(&mut self, id: &HostId) -> Option<Host> {
        self.inner.remove(id)
    }

    /// Hosts in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.inner.values()
    }

    pub fn ids(&self) -> Vec<HostId> {
        self.inner.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Count of healthy hosts whose tags satisfy `required`.
    pub fn healthy_matching(&self, required: Option<&HashMap<String, String>>) -> usize {
        self.iter()
            .filter(|host| host.healthy && host.satisfies(required))
            .count()
    }

    pub(crate) fn stop_watchers(&mut self) {
        for host in self.inner.values_mut() {
            host.stop_watcher();
        }
    }
}
