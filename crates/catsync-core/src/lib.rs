//! Core catalog model and run bookkeeping types for catsync.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod normalize;

pub use normalize::{extract_keywords, normalize};

pub const CRATE_NAME: &str = "catsync-core";

/// One row as read from the upstream source, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCatalogRow {
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: Decimal,
}

impl RawCatalogRow {
    pub fn new(code: impl Into<String>, description: Option<&str>, price: Decimal) -> Self {
        Self {
            code: code.into(),
            description: description.map(ToString::to_string),
            price,
        }
    }
}

/// Canonical catalog entry handed to the downstream store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub code: String,
    pub description: String,
    pub normalized_description: String,
    pub keywords: BTreeSet<String>,
    pub price: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    UpsertOnly,
    UpsertAndPurge,
}

impl SyncMode {
    pub fn purges(self) -> bool {
        matches!(self, SyncMode::UpsertAndPurge)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::UpsertOnly => "upsert_only",
            SyncMode::UpsertAndPurge => "upsert_and_purge",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "upsert_only" | "upsert" => Ok(SyncMode::UpsertOnly),
            "upsert_and_purge" | "purge" => Ok(SyncMode::UpsertAndPurge),
            other => Err(format!("unknown sync mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Aborted,
    Failed,
}

/// A write or delete chunk that did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub offset: usize,
    pub size: usize,
    pub error: String,
}

/// Summary of one pipeline execution. Lives only as long as the run plus the
/// "last run" slot kept by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
    pub fetched_count: usize,
    pub new_count: usize,
    pub existing_count: usize,
    pub upserted_count: usize,
    pub purged_count: usize,
    pub purge_failures: Vec<ChunkFailure>,
    pub warnings: Vec<String>,
    pub outcome: SyncOutcome,
    pub abort_reason: Option<String>,
}

impl SyncRun {
    pub fn begin(mode: SyncMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: Utc::now(),
            finished_at: None,
            elapsed_ms: 0,
            fetched_count: 0,
            new_count: 0,
            existing_count: 0,
            upserted_count: 0,
            purged_count: 0,
            purge_failures: Vec::new(),
            warnings: Vec::new(),
            outcome: SyncOutcome::Success,
            abort_reason: None,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.outcome = SyncOutcome::Failed;
        self.abort_reason = Some(reason.into());
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.outcome = SyncOutcome::Aborted;
        self.abort_reason = Some(reason.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn finish(&mut self) {
        let finished_at = Utc::now();
        self.elapsed_ms = (finished_at - self.started_at).num_milliseconds();
        self.finished_at = Some(finished_at);
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
