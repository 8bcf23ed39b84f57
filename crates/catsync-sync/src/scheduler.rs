use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use catsync_core::{SyncMode, SyncRun};
use tokio::sync::broadcast;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::SyncOrchestrator;
use crate::SyncError;

const SUMMARY_CAPACITY: usize = 16;

/// Fires one run at startup and then one every `interval`. Finished runs are
/// broadcast to subscribers.
pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
    mode: SyncMode,
    summaries: broadcast::Sender<SyncRun>,
}

pub struct SchedulerHandle {
    inner: JobScheduler,
    summaries: broadcast::Sender<SyncRun>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, interval: Duration, mode: SyncMode) -> Self {
        let (summaries, _) = broadcast::channel(SUMMARY_CAPACITY);
        Self {
            orchestrator,
            interval,
            mode,
            summaries,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncRun> {
        self.summaries.subscribe()
    }

    pub async fn start(self) -> Result<SchedulerHandle> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let orchestrator = self.orchestrator.clone();
        let summaries = self.summaries.clone();
        let mode = self.mode;
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let orchestrator = orchestrator.clone();
            let summaries = summaries.clone();
            Box::pin(async move {
                trigger(&orchestrator, mode, &summaries).await;
            })
        })
        .with_context(|| format!("creating repeated sync job every {:?}", self.interval))?;
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;

        let orchestrator = self.orchestrator.clone();
        let summaries = self.summaries.clone();
        tokio::spawn(async move {
            trigger(&orchestrator, mode, &summaries).await;
        });

        info!(interval_secs = self.interval.as_secs(), mode = %self.mode, "scheduler started");
        Ok(SchedulerHandle {
            inner: sched,
            summaries: self.summaries,
        })
    }
}

impl SchedulerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SyncRun> {
        self.summaries.subscribe()
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("shutting down scheduler")?;
        info!("scheduler stopped");
        Ok(())
    }
}

async fn trigger(
    orchestrator: &SyncOrchestrator,
    mode: SyncMode,
    summaries: &broadcast::Sender<SyncRun>,
) {
    match orchestrator.run_sync(mode).await {
        Ok(run) => {
            // no subscribers is fine
            let _ = summaries.send(run);
        }
        Err(SyncError::AlreadyRunning) => {
            warn!("scheduled sync skipped, a run is already in progress");
        }
        Err(err) => warn!(error = %err, "scheduled sync did not start"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw, ScriptedSource, ScriptedStore};
    use crate::SyncConfig;
    use catsync_core::SyncOutcome;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_run_fires_immediately_and_is_broadcast() {
        let store = Arc::new(ScriptedStore::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            SyncConfig::default(),
            Arc::new(ScriptedSource::new(vec![raw("A1", "Placa", 100)])),
            store.clone(),
        ));

        let scheduler = Scheduler::new(
            orchestrator.clone(),
            Duration::from_secs(3600),
            SyncMode::UpsertOnly,
        );
        let mut summaries = scheduler.subscribe();
        let handle = scheduler.start().await.expect("scheduler starts");

        let run = tokio::time::timeout(Duration::from_secs(10), summaries.recv())
            .await
            .expect("first run within timeout")
            .expect("summary received");
        assert_eq!(run.outcome, SyncOutcome::Success);
        assert_eq!(run.upserted_count, 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(orchestrator.last_run().await.map(|r| r.run_id), Some(run.run_id));

        handle.shutdown().await.expect("scheduler stops");
    }
}
