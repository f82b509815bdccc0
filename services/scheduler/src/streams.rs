//! External stream adapters.
//!
//! Each adapter runs in its own task, converts native events into
//! commands, and writes them to the loop's channel with a blocking send;
//! backpressure from a slow loop to fast producers is deliberate. On
//! stream loss an adapter reconnects with bounded exponential backoff
//! and then forces a full list sync to recover missed deltas.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::clients::{ClusterClient, ControllerClient, Discoverd, HostClient};
use crate::scheduler::Command;
use crate::types::HostEventKind;

/// Forwards formation changes from the controller. A full snapshot is
/// pushed after every (re)connect.
pub(crate) fn watch_formations(
    controller: Arc<dyn ControllerClient>,
    tx: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let backoff = Backoff::default();
        let mut attempt: u32 = 0;
        loop {
            match controller.stream_formations().await {
                Ok(mut events) => {
                    attempt = 0;
                    match controller.list_formations().await {
                        Ok(list) => {
                            if tx.send(Command::FormationSync(list)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "formation list sync failed"),
                    }
                    while let Some(update) = events.recv().await {
                        if tx.send(Command::FormationChange(update)).await.is_err() {
                            return;
                        }
                    }
                    warn!("formation stream closed, reconnecting");
                }
                Err(e) => warn!(error = %e, "formation stream connect failed"),
            }
            if tx.is_closed() {
                return;
            }
            attempt += 1;
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
    })
}

/// Forwards cluster membership events. A cluster re-sync is forced
/// after every (re)connect.
pub(crate) fn watch_host_events(
    cluster: Arc<dyn ClusterClient>,
    tx: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let backoff = Backoff::default();
        let mut attempt: u32 = 0;
        loop {
            match cluster.stream_host_events().await {
                Ok(mut events) => {
                    attempt = 0;
                    if tx.send(Command::SyncCluster).await.is_err() {
                        return;
                    }
                    while let Some(event) = events.recv().await {
                        let cmd = match event.kind {
                            HostEventKind::Up => Command::HostUp(event.host_id),
                            HostEventKind::Down => Command::HostDown(event.host_id),
                        };
                        if tx.send(cmd).await.is_err() {
                            return;
                        }
                    }
                    warn!("host event stream closed, reconnecting");
                }
                Err(e) => warn!(error = %e, "host event stream connect failed"),
            }
            if tx.is_closed() {
                return;
            }
            attempt += 1;
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
    })
}

/// Forwards one host's job events. Spawned when the host joins the
/// registry; aborted when it leaves. A cluster re-sync is forced after
/// a reconnect to recover events lost in between.
pub(crate) fn watch_host_jobs(
    host: Arc<dyn HostClient>,
    tx: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let host_id = host.id();
        let backoff = Backoff::default();
        let mut attempt: u32 = 0;
        loop {
            match host.stream_events().await {
                Ok(mut events) => {
                    if attempt > 0 {
                        if tx.send(Command::SyncCluster).await.is_err() {
                            return;
                        }
                    }
                    attempt = 0;
                    while let Some(job) = events.recv().await {
                        if tx.send(Command::JobUpdate { host_id, job }).await.is_err() {
                            return;
                        }
                    }
                    debug!(host_id = %host_id, "host job stream closed, reconnecting");
                }
                Err(e) => {
                    debug!(host_id = %host_id, error = %e, "host job stream connect failed");
                }
            }
            if tx.is_closed() {
                return;
            }
            attempt += 1;
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
    })
}

/// Forwards leader-state changes from discoverd.
pub(crate) fn watch_leader(
    discoverd: Arc<dyn Discoverd>,
    tx: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut leader = match discoverd.leader_ch().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "leader channel unavailable, staying passive");
                return;
            }
        };
        while let Some(is_leader) = leader.recv().await {
            if tx.send(Command::LeaderChange(is_leader)).await.is_err() {
                return;
            }
        }
        warn!("leader channel closed");
    })
}

/// Periodically forces a formation and cluster re-sync. The first tick
/// is skipped; the stream adapters already sync on connect.
pub(crate) fn sync_ticker(interval: Duration, tx: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(Command::SyncFormations).await.is_err() {
                return;
            }
            if tx.send(Command::SyncCluster).await.is_err() {
                return;
            }
        }
    })
}
