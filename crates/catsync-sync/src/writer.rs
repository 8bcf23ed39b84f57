use std::collections::BTreeMap;
use std::sync::Arc;

use catsync_core::{CatalogRecord, ChunkFailure};
use catsync_store::CatalogStore;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::SyncError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub written: usize,
    pub failed_batches: Vec<ChunkFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub deleted: usize,
    pub failed_batches: Vec<ChunkFailure>,
}

pub struct BatchWriter {
    store: Arc<dyn CatalogStore>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Write `records` in sequential chunks of at most `batch_size`. The first
    /// failing chunk stops the write; the error carries what was written so far.
    pub async fn upsert(
        &self,
        records: &[CatalogRecord],
        batch_size: usize,
    ) -> Result<WriteReport, SyncError> {
        let mut report = WriteReport::default();
        let batch_size = batch_size.max(1);

        for (index, chunk) in records.chunks(batch_size).enumerate() {
            let offset = index * batch_size;
            match self.store.upsert(chunk).await {
                Ok(()) => {
                    report.written += chunk.len();
                    debug!(offset, size = chunk.len(), "upsert chunk written");
                }
                Err(err) => {
                    let error = err.to_string();
                    error!(offset, size = chunk.len(), %error, "upsert chunk failed, stopping");
                    report.failed_batches.push(ChunkFailure {
                        offset,
                        size: chunk.len(),
                        error: error.clone(),
                    });
                    return Err(SyncError::WriteFailed {
                        offset,
                        error,
                        report,
                    });
                }
            }
        }

        info!(written = report.written, "upsert complete");
        Ok(report)
    }

    /// Delete `keys` in chunks, at most `concurrency` chunks in flight. Failed
    /// chunks are logged and skipped.
    pub async fn purge(
        &self,
        keys: Vec<String>,
        chunk_size: usize,
        concurrency: usize,
    ) -> PurgeReport {
        let mut report = PurgeReport::default();
        if keys.is_empty() {
            return report;
        }

        let chunk_size = chunk_size.max(1);
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        // offset -> size of every chunk that has not reported back yet
        let mut pending = BTreeMap::new();

        for (index, chunk) in keys.chunks(chunk_size).enumerate() {
            let offset = index * chunk_size;
            let chunk = chunk.to_vec();
            pending.insert(offset, chunk.len());
            let store = self.store.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = store.delete_codes(&chunk).await;
                (offset, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((offset, result)) => {
                    let size = pending.remove(&offset).unwrap_or_default();
                    match result {
                        Ok(()) => {
                            report.deleted += size;
                            debug!(offset, size, "purge chunk deleted");
                        }
                        Err(err) => {
                            let failure = SyncError::PurgeChunkFailed {
                                offset,
                                error: err.to_string(),
                            };
                            warn!(size, error = %failure, "skipping failed purge chunk");
                            report.failed_batches.push(ChunkFailure {
                                offset,
                                size,
                                error: err.to_string(),
                            });
                        }
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "purge chunk task did not complete");
                }
            }
        }

        // chunks still pending are the ones whose task crashed
        for (offset, size) in pending {
            report.failed_batches.push(ChunkFailure {
                offset,
                size,
                error: "purge chunk task did not complete".to_string(),
            });
        }

        report.failed_batches.sort_by_key(|f| f.offset);
        info!(
            deleted = report.deleted,
            failed_chunks = report.failed_batches.len(),
            "purge complete"
        );
        report
    }
}
