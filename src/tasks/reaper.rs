//! Orphaned image reaper background task

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{error::ReaperError, services::ResourceCollection};

/// Outcome of one reap cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub scanned: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Listing candidates failed, nothing was deleted.
    pub aborted: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

/// How `Reaper::stop_within` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReaperStop {
    /// The reaper was never started, or was already stopped.
    Idle,
    /// The loop exited after finishing any in-flight cycle.
    Clean,
    /// The in-flight cycle outlived the timeout and the task was aborted.
    Aborted,
}

struct RunningLoop {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodically deletes resources that no live record references.
///
/// One task runs the whole schedule, so cycles are strictly sequential: a
/// cycle that outlasts the interval delays the next tick instead of
/// overlapping with it.
pub struct Reaper {
    collection: Arc<dyn ResourceCollection>,
    started: bool,
    running: Option<RunningLoop>,
    reports_tx: watch::Sender<Option<CycleReport>>,
}

impl Reaper {
    pub fn new(collection: Arc<dyn ResourceCollection>) -> Self {
        let (reports_tx, _) = watch::channel(None);
        Self {
            collection,
            started: false,
            running: None,
            reports_tx,
        }
    }

    /// Subscribe to the report of each completed cycle.
    pub fn reports(&self) -> watch::Receiver<Option<CycleReport>> {
        self.reports_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Start the schedule. The first cycle fires one `interval` after start.
    ///
    /// A reaper starts at most once; a second call is rejected.
    pub fn start(&mut self, interval: Duration, token: CancellationToken) -> Result<(), ReaperError> {
        if self.started {
            return Err(ReaperError::AlreadyStarted);
        }
        if interval.is_zero() {
            return Err(ReaperError::ZeroInterval);
        }

        self.started = true;

        let (stop_tx, stop_rx) = oneshot::channel();
        let collection = Arc::clone(&self.collection);
        let reports_tx = self.reports_tx.clone();
        let handle = tokio::spawn(reap_loop(collection, interval, token, stop_rx, reports_tx));

        info!(interval_secs = interval.as_secs_f64(), "Image reaper started");
        self.running = Some(RunningLoop { stop_tx, handle });
        Ok(())
    }

    /// Stop the schedule and wait for the loop to exit.
    ///
    /// A cycle in progress is allowed to finish; no new cycle starts after
    /// this is called. Safe to call when never started.
    pub async fn stop(&mut self) -> ReaperStop {
        let Some(RunningLoop { stop_tx, handle }) = self.running.take() else {
            return ReaperStop::Idle;
        };

        let _ = stop_tx.send(());
        if let Err(e) = handle.await {
            error!("Image reaper task failed: {}", e);
        }
        info!("Image reaper stopped");
        ReaperStop::Clean
    }

    /// Like [`stop`](Self::stop), but abort the task if the in-flight cycle
    /// is still running after `timeout`.
    pub async fn stop_within(&mut self, timeout: Duration) -> ReaperStop {
        let Some(RunningLoop { stop_tx, mut handle }) = self.running.take() else {
            return ReaperStop::Idle;
        };

        let _ = stop_tx.send(());
        match time::timeout(timeout, &mut handle).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    error!("Image reaper task failed: {}", e);
                }
                info!("Image reaper stopped");
                ReaperStop::Clean
            }
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "Reap cycle did not finish in time, aborting it"
                );
                handle.abort();
                let _ = handle.await;
                ReaperStop::Aborted
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.abort();
        }
    }
}

async fn reap_loop(
    collection: Arc<dyn ResourceCollection>,
    interval: Duration,
    token: CancellationToken,
    mut stop_rx: oneshot::Receiver<()>,
    reports_tx: watch::Sender<Option<CycleReport>>,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                debug!("Image reaper observed cancellation");
                break;
            }
            _ = &mut stop_rx => {
                debug!("Image reaper received stop");
                break;
            }
            _ = ticker.tick() => {
                let report = reap_cycle(collection.as_ref(), Utc::now()).await;
                reports_tx.send_replace(Some(report));
            }
        }
    }
}

/// Run one reap cycle: list candidates, then delete each one still orphaned.
///
/// A failed deletion is logged and counted; the remaining candidates are
/// still processed. A failed listing aborts only this cycle.
pub async fn reap_cycle(collection: &dyn ResourceCollection, now: DateTime<Utc>) -> CycleReport {
    let mut report = CycleReport::default();

    let candidates = match collection.orphan_candidates(now).await {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!("Failed to list orphan candidates, skipping this cycle: {}", e);
            report.aborted = true;
            report.finished_at = Some(Utc::now());
            return report;
        }
    };

    report.scanned = candidates.len();
    for id in &candidates {
        match collection.remove_orphan(id, now).await {
            Ok(true) => {
                debug!(resource = %id, "Deleted orphaned resource");
                report.deleted += 1;
            }
            Ok(false) => report.skipped += 1,
            Err(e) => {
                warn!(resource = %id, "Failed to delete orphaned resource: {}", e);
                report.failed += 1;
            }
        }
    }

    report.finished_at = Some(Utc::now());
    info!(
        scanned = report.scanned,
        deleted = report.deleted,
        skipped = report.skipped,
        failed = report.failed,
        "Reap cycle finished"
    );
    report
}
