//! Scheduler configuration.

use std::time::Duration;

use anyhow::Result;

/// Tunable knobs for the scheduler. All fields have working defaults;
/// `from_env` overlays `KEEL_*` environment variables on top of them.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base delay for the first restart of a crashed job.
    pub restart_backoff_base: Duration,

    /// Ceiling on the restart delay.
    pub restart_backoff_cap: Duration,

    /// Jitter factor applied to restart delays (0.0 to 1.0).
    pub restart_jitter: f64,

    /// A job running at least this long resets its restart count.
    pub restart_stabilization_window: Duration,

    /// Deadline for calls against host clients.
    pub host_call_timeout: Duration,

    /// Consecutive failed health checks before a host is dropped.
    pub max_host_checks: u32,

    /// Capacity of each subscriber's event sink. A subscriber whose sink
    /// fills up is disconnected rather than allowed to block the loop.
    pub subscriber_buffer_size: usize,

    /// Rectify requests for the same formation within this window
    /// collapse to a single pass.
    pub rectify_coalesce_window: Duration,

    /// Interval between full formation and cluster re-syncs.
    pub sync_interval: Duration,

    /// Capacity of the event loop's command channel.
    pub command_buffer_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            restart_backoff_base: Duration::from_millis(100),
            restart_backoff_cap: Duration::from_secs(30),
            restart_jitter: 0.2,
            restart_stabilization_window: Duration::from_secs(5 * 60),
            host_call_timeout: Duration::from_secs(30),
            max_host_checks: 2,
            subscriber_buffer_size: 1024,
            rectify_coalesce_window: Duration::from_millis(50),
            sync_interval: Duration::from_secs(30),
            command_buffer_size: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Builds a config from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            restart_backoff_base: env_millis(
                "KEEL_RESTART_BACKOFF_BASE_MS",
                defaults.restart_backoff_base,
            )?,
            restart_backoff_cap: env_secs(
                "KEEL_RESTART_BACKOFF_CAP_SECS",
                defaults.restart_backoff_cap,
            )?,
            restart_jitter: env_parse("KEEL_RESTART_JITTER", defaults.restart_jitter)?,
            restart_stabilization_window: env_secs(
                "KEEL_RESTART_STABILIZATION_SECS",
                defaults.restart_stabilization_window,
            )?,
            host_call_timeout: env_secs("KEEL_HOST_CALL_TIMEOUT_SECS", defaults.host_call_timeout)?,
            max_host_checks: env_parse("KEEL_MAX_HOST_CHECKS", defaults.max_host_checks)?,
            subscriber_buffer_size: env_parse(
                "KEEL_SUBSCRIBER_BUFFER",
                defaults.subscriber_buffer_size,
            )?,
            rectify_coalesce_window: env_millis(
                "KEEL_RECTIFY_COALESCE_MS",
                defaults.rectify_coalesce_window,
            )?,
            sync_interval: env_secs("KEEL_SYNC_INTERVAL_SECS", defaults.sync_interval)?,
            command_buffer_size: env_parse("KEEL_COMMAND_BUFFER", defaults.command_buffer_size)?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(
        name,
        default.as_millis() as u64,
    )?))
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(name, default.as_secs())?))
}
