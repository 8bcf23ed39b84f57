use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use catsync_core::{SyncMode, SyncOutcome, SyncRun};
use catsync_source::CatalogSource;
use catsync_store::CatalogStore;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, info_span, warn, Instrument};

use crate::extract::Extractor;
use crate::reconcile::{classify, plan_purge, Reconciler};
use crate::writer::BatchWriter;
use crate::{SyncConfig, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Running,
}

/// Single-flight coordinator for extract → reconcile → write.
///
/// The run lock is a gate, not a queue: a trigger that finds it held is
/// rejected with [`SyncError::AlreadyRunning`] straight away. An accepted run
/// executes on its own task, so a caller that stops waiting does not cancel it.
pub struct SyncOrchestrator {
    run_lock: Arc<Mutex<()>>,
    pipeline: Arc<Pipeline>,
}

struct Pipeline {
    config: SyncConfig,
    extractor: Extractor,
    reconciler: Reconciler,
    writer: BatchWriter,
    running: AtomicBool,
    last_run: RwLock<Option<SyncRun>>,
}

/// Raises `running` for as long as it lives.
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn CatalogSource>,
        store: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            run_lock: Arc::new(Mutex::new(())),
            pipeline: Arc::new(Pipeline {
                config,
                extractor: Extractor::new(source),
                reconciler: Reconciler::new(store.clone()),
                writer: BatchWriter::new(store),
                running: AtomicBool::new(false),
                last_run: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.pipeline.config
    }

    /// Reads the running flag only; polling never contends with triggers.
    pub fn state(&self) -> SyncState {
        if self.pipeline.running.load(Ordering::SeqCst) {
            SyncState::Running
        } else {
            SyncState::Idle
        }
    }

    pub async fn last_run(&self) -> Option<SyncRun> {
        self.pipeline.last_run.read().await.clone()
    }

    /// Run the pipeline once. Only a concurrent run (or a crashed run task)
    /// produces an `Err`; every other failure is reported on the returned run.
    pub async fn run_sync(&self, mode: SyncMode) -> Result<SyncRun, SyncError> {
        let guard = self
            .run_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| SyncError::AlreadyRunning)?;

        let pipeline = self.pipeline.clone();
        let task = tokio::spawn(async move {
            let run = {
                let _running = RunningFlag::raise(&pipeline.running);
                pipeline.run(mode).await
            };
            drop(guard);
            run
        });

        task.await.map_err(|err| {
            error!(error = %err, "sync run task did not complete");
            SyncError::Interrupted(err.to_string())
        })
    }
}

impl Pipeline {
    async fn run(&self, mode: SyncMode) -> SyncRun {
        let mut run = SyncRun::begin(mode);
        let span = info_span!("sync_run", run_id = %run.run_id, mode = %mode);
        self.execute(&mut run).instrument(span).await;
        run.finish();

        match run.outcome {
            SyncOutcome::Success => info!(
                run_id = %run.run_id,
                mode = %run.mode,
                fetched = run.fetched_count,
                new = run.new_count,
                existing = run.existing_count,
                upserted = run.upserted_count,
                purged = run.purged_count,
                purge_failures = run.purge_failures.len(),
                warnings = run.warnings.len(),
                elapsed_ms = run.elapsed_ms,
                "sync run succeeded"
            ),
            SyncOutcome::Aborted => warn!(
                run_id = %run.run_id,
                fetched = run.fetched_count,
                upserted = run.upserted_count,
                reason = run.abort_reason.as_deref().unwrap_or_default(),
                elapsed_ms = run.elapsed_ms,
                "sync run aborted"
            ),
            SyncOutcome::Failed => error!(
                run_id = %run.run_id,
                fetched = run.fetched_count,
                upserted = run.upserted_count,
                reason = run.abort_reason.as_deref().unwrap_or_default(),
                elapsed_ms = run.elapsed_ms,
                "sync run failed"
            ),
        }

        *self.last_run.write().await = Some(run.clone());
        run
    }

    async fn execute(&self, run: &mut SyncRun) {
        if run.mode.purges() && !self.config.purge_enabled {
            run.warn("purge requested but disabled by configuration; running upsert only");
            run.mode = SyncMode::UpsertOnly;
        }

        let records = match self.extractor.fetch().await {
            Ok(records) => records,
            Err(err) => {
                run.fail(err.reason());
                return;
            }
        };
        run.fetched_count = records.len();

        let existing = match self.reconciler.current_downstream_keys().await {
            Ok(keys) => Some(keys),
            Err(err) if run.mode.purges() && self.config.purge_required => {
                run.fail(err.reason());
                return;
            }
            Err(err) => {
                let consequence = if run.mode.purges() {
                    "purge skipped"
                } else {
                    "new/existing counts unavailable"
                };
                warn!(error = %err, consequence, "continuing with upsert only");
                run.warn(format!("{}; {consequence}", err.reason()));
                None
            }
        };
        if let Some(existing) = &existing {
            let classification = classify(existing, &records);
            run.new_count = classification.new;
            run.existing_count = classification.existing;
        }

        match self
            .writer
            .upsert(&records, self.config.upsert_batch_size)
            .await
        {
            Ok(report) => run.upserted_count = report.written,
            Err(err) => {
                if let SyncError::WriteFailed { report, .. } = &err {
                    run.upserted_count = report.written;
                }
                run.fail(err.reason());
                return;
            }
        }

        if !run.mode.purges() {
            return;
        }
        let Some(existing) = existing else {
            return;
        };

        let fresh = records
            .iter()
            .map(|record| record.code.clone())
            .collect::<BTreeSet<_>>();
        let plan = plan_purge(&existing, &fresh, self.config.purge_max_diff_percent);
        if plan.aborted {
            let reason = plan.reason.unwrap_or_default();
            run.abort(SyncError::PurgeAborted { reason }.reason());
            return;
        }

        let report = self
            .writer
            .purge(
                plan.to_delete.into_iter().collect(),
                self.config.purge_chunk_size,
                self.config.purge_concurrency,
            )
            .await;
        run.purged_count = report.deleted;
        run.purge_failures = report.failed_batches;
    }
}
