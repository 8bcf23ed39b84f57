//! Catalog sync engine: extraction, reconciliation, batched writes and the
//! single-flight orchestrator that sequences them.

use std::time::Duration;

use thiserror::Error;

pub mod extract;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;
pub mod writer;

#[cfg(test)]
mod testing;

pub use extract::{build_catalog, ExtractedCatalog, Extractor};
pub use orchestrator::{SyncOrchestrator, SyncState};
pub use reconcile::{
    classify, plan_purge, Classification, PurgePlan, Reconciler, SAFETY_THRESHOLD_REASON,
};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use writer::{BatchWriter, PurgeReport, WriteReport};

pub const CRATE_NAME: &str = "catsync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sync_interval_hours: u64,
    pub scheduler_enabled: bool,
    pub purge_enabled: bool,
    /// Fail the run instead of degrading to upsert-only when the downstream
    /// key inventory cannot be read in purge mode.
    pub purge_required: bool,
    pub purge_max_diff_percent: f64,
    pub upsert_batch_size: usize,
    pub purge_chunk_size: usize,
    pub purge_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_hours: 8,
            scheduler_enabled: true,
            purge_enabled: false,
            purge_required: false,
            purge_max_diff_percent: 5.0,
            upsert_batch_size: 1000,
            purge_chunk_size: 700,
            purge_concurrency: 4,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sync_interval_hours: env_parse("SYNC_INTERVAL_HOURS")
                .filter(|h: &u64| *h > 0)
                .unwrap_or(defaults.sync_interval_hours),
            scheduler_enabled: env_flag("CATSYNC_SCHEDULER_ENABLED")
                .unwrap_or(defaults.scheduler_enabled),
            purge_enabled: env_flag("PURGE_ENABLED").unwrap_or(defaults.purge_enabled),
            purge_required: env_flag("PURGE_REQUIRED").unwrap_or(defaults.purge_required),
            purge_max_diff_percent: env_parse("PURGE_MAX_DIFF_PERCENT")
                .filter(|p: &f64| p.is_finite() && *p >= 0.0)
                .unwrap_or(defaults.purge_max_diff_percent),
            upsert_batch_size: env_parse("UPSERT_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.upsert_batch_size),
            purge_chunk_size: env_parse("PURGE_CHUNK_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.purge_chunk_size),
            purge_concurrency: env_parse("PURGE_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.purge_concurrency),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_hours.max(1) * 60 * 60)
    }

    /// Mode used by the scheduler and by triggers that do not ask for one.
    pub fn default_mode(&self) -> catsync_core::SyncMode {
        if self.purge_enabled {
            catsync_core::SyncMode::UpsertAndPurge
        } else {
            catsync_core::SyncMode::UpsertOnly
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("write failed for chunk at offset {offset}: {error}")]
    WriteFailed {
        offset: usize,
        error: String,
        report: WriteReport,
    },
    #[error("purge chunk at offset {offset} failed: {error}")]
    PurgeChunkFailed { offset: usize, error: String },
    #[error("purge aborted: {reason}")]
    PurgeAborted { reason: String },
    #[error("sync already running")]
    AlreadyRunning,
    #[error("sync run task did not complete: {0}")]
    Interrupted(String),
}

impl SyncError {
    /// Stable identifier used as the prefix of a run's `abort_reason`.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::SourceUnavailable(_) => "source_unavailable",
            SyncError::SinkUnavailable(_) => "sink_unavailable",
            SyncError::WriteFailed { .. } => "write_failed",
            SyncError::PurgeChunkFailed { .. } => "purge_chunk_failed",
            SyncError::PurgeAborted { .. } => "purge_aborted",
            SyncError::AlreadyRunning => "already_running",
            SyncError::Interrupted(_) => "interrupted",
        }
    }

    /// `code: detail`, as recorded on a finished run.
    pub fn reason(&self) -> String {
        let detail = match self {
            SyncError::SourceUnavailable(detail)
            | SyncError::SinkUnavailable(detail)
            | SyncError::Interrupted(detail) => detail.clone(),
            SyncError::WriteFailed { offset, error, .. }
            | SyncError::PurgeChunkFailed { offset, error } => {
                format!("offset {offset}: {error}")
            }
            SyncError::PurgeAborted { reason } => reason.clone(),
            SyncError::AlreadyRunning => "a sync run is already in progress".to_string(),
        };
        format!("{}: {}", self.code(), detail)
    }
}
