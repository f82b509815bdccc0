//! # keel-scheduler
//!
//! The control-plane scheduler. It watches the controller's declared
//! formations and the cluster's observed state, and converges the two:
//! placing jobs on hosts (tag-constrained, load-balanced), stopping
//! surplus jobs, restarting crashes with exponential backoff, and
//! retargeting omni process types as hosts come and go.
//!
//! A single event-loop task owns all mutable state; external streams,
//! timers and synchronous requests all arrive as commands on one
//! channel. Schedulers run one-active-many-passive: passive instances
//! keep warm registries but issue no mutations until promoted.
//!
//! ```no_run
//! use std::sync::Arc;
//! use keel_scheduler::fake::{FakeCluster, FakeControllerClient, FakeDiscoverd};
//! use keel_scheduler::{Scheduler, SchedulerConfig};
//!
//! # async fn example() {
//! let controller = Arc::new(FakeControllerClient::new());
//! let cluster = Arc::new(FakeCluster::new());
//! let discoverd = Arc::new(FakeDiscoverd::new(true));
//!
//! let mut scheduler =
//!     Scheduler::new(SchedulerConfig::default(), controller, cluster, discoverd);
//! let handle = scheduler.handle();
//! let mut events = scheduler.subscribe();
//! tokio::spawn(scheduler.run());
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}: {:?}", event.seq, event.kind);
//! }
//! # let _ = handle;
//! # }
//! ```

mod backoff;
pub mod clients;
mod config;
mod error;
mod events;
pub mod fake;
mod formation;
mod host;
mod job;
mod placement;
mod rectify;
mod scheduler;
mod streams;
pub mod types;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use events::{Event, EventKind, EventType, Subscription};
pub use formation::FormationKey;
pub use job::{JobSnapshot, JobState};
pub use placement::PlacementRequest;
pub use scheduler::{Scheduler, SchedulerHandle};
