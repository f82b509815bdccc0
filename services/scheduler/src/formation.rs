//! Formation registry.

use std::collections::HashMap;

use keel_id::{AppId, ReleaseId};
use serde::{Deserialize, Serialize};

use crate::types::{App, Artifact, Release};

/// Identifies a formation: one (app, release) pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FormationKey {
    pub app_id: AppId,
    pub release_id: ReleaseId,
}

impl FormationKey {
    pub fn new(app_id: AppId, release_id: ReleaseId) -> Self {
        Self { app_id, release_id }
    }
}

impl std::fmt::Display for FormationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app_id, self.release_id)
    }
}

/// Declared desired topology for one (app, release): per-type counts and
/// tag requirements, plus cached controller objects for job configs.
#[derive(Debug, Clone)]
pub struct Formation {
    pub key: FormationKey,
    pub app: App,
    pub release: Release,
    pub artifact: Artifact,

    /// Desired instance count per process type.
    pub processes: HashMap<String, usize>,

    /// Required host tags per process type. A missing or empty entry
    /// matches any host.
    pub tags: HashMap<String, HashMap<String, String>>,
}

impl Formation {
    pub fn new(
        app: App,
        release: Release,
        artifact: Artifact,
        processes: HashMap<String, usize>,
        tags: HashMap<String, HashMap<String, String>>,
    ) -> Self {
        Self {
            key: FormationKey::new(app.id, release.id),
            app,
            release,
            artifact,
            processes,
            tags,
        }
    }

    pub fn desired(&self, proc_type: &str) -> usize {
        self.processes.get(proc_type).copied().unwrap_or(0)
    }

    /// Whether the release marks this process type as omni (one instance
    /// per healthy matching host).
    pub fn is_omni(&self, proc_type: &str) -> bool {
        self.release
            .processes
            .get(proc_type)
            .map(|spec| spec.omni)
            .unwrap_or(false)
    }

    pub fn tags_for(&self, proc_type: &str) -> Option<&HashMap<String, String>> {
        self.tags.get(proc_type)
    }

    /// True when every desired count is zero.
    pub fn is_empty(&self) -> bool {
        self.processes.values().all(|count| *count == 0)
    }
}

/// Formation registry, keyed by (app, release).
#[derive(Debug, Default)]
pub struct Formations {
    inner: HashMap<FormationKey, Formation>,
}

impl Formations {
    pub fn get(&self, key: &FormationKey) -> Option<&Formation> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &FormationKey) -> Option<&mut Formation> {
        self.inner.get_mut(key)
    }

    pub fn contains(&self, key: &FormationKey) -> bool {
        self.inner.contains_key(key)
    }

    pub fn insert(&mut self, formation: Formation) -> Option<Formation> {
        self.inner.insert(formation.key, formation)
    }

    pub fn remove(&mut self, key: &FormationKey) -> Option<Formation> {
        self.inner.remove(key)
    }

    pub fn keys(&self) -> Vec<FormationKey> {
        self.inner.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Formation> {
        self.inner.values()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcessSpec;
    use keel_id::ArtifactId;

    fn formation(processes: &[(&str, usize)], omni: &[&str]) -> Formation {
        let artifact_id = ArtifactId::new();
        let app = App {
            id: AppId::new(),
            name: "test".into(),
        };
        let release = Release {
            id: ReleaseId::new(),
            artifact_id,
            processes: processes
                .iter()
                .map(|(t, _)| {
                    (
                        t.to_string(),
                        ProcessSpec {
                            omni: omni.contains(t),
                        },
                    )
                })
                .collect(),
        };
        let artifact = Artifact {
            id: artifact_id,
            uri: "docker://test".into(),
        };
        Formation::new(
            app,
            release,
            artifact,
            processes.iter().map(|(t, c)| (t.to_string(), *c)).collect(),
            HashMap::new(),
        )
    }

    #[test]
    fn test_desired_and_omni() {
        let f = formation(&[("web", 2), ("clock", 1)], &["clock"]);
        assert_eq!(f.desired("web"), 2);
        assert_eq!(f.desired("worker"), 0);
        assert!(!f.is_omni("web"));
        assert!(f.is_omni("clock"));
        assert!(!f.is_omni("unknown"));
    }

    #[test]
    fn test_is_empty() {
        let mut f = formation(&[("web", 1)], &[]);
        assert!(!f.is_empty());
        f.processes.insert("web".into(), 0);
        assert!(f.is_empty());
        f.processes.clear();
        assert!(f.is_empty());
    }
}
