//! Typed ID definitions for scheduler-visible resources.

use crate::define_id;

define_id!(
    /// Identifies an application.
    AppId,
    "app"
);
define_id!(
    /// Identifies a release of an application.
    ReleaseId,
    "rel"
);
define_id!(
    /// Identifies an artifact referenced by a release.
    ArtifactId,
    "art"
);
define_id!(
    /// Identifies a cluster host.
    HostId,
    "host"
);
define_id!(
    /// Identifies a job. Assigned by the scheduler and echoed by the
    /// host when the job is accepted.
    JobId,
    "job"
);
