use std::collections::BTreeMap;
use std::sync::Arc;

use catsync_core::{extract_keywords, normalize, CatalogRecord, RawCatalogRow};
use catsync_source::CatalogSource;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::SyncError;

/// Deduplicated records plus bookkeeping about what was dropped on the way.
#[derive(Debug, Clone, Default)]
pub struct ExtractedCatalog {
    pub records: Vec<CatalogRecord>,
    pub rows_read: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

pub struct Extractor {
    source: Arc<dyn CatalogSource>,
}

impl Extractor {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self { source }
    }

    /// Pull every priced row and build one record per code. Any upstream
    /// error discards the whole extraction.
    pub async fn fetch(&self) -> Result<Vec<CatalogRecord>, SyncError> {
        let rows = self
            .source
            .fetch_rows()
            .await
            .map_err(|err| SyncError::SourceUnavailable(err.to_string()))?;

        let catalog = build_catalog(rows, Utc::now());
        info!(
            rows = catalog.rows_read,
            records = catalog.records.len(),
            duplicates = catalog.duplicates,
            skipped = catalog.skipped,
            "catalog extracted"
        );
        Ok(catalog.records)
    }
}

/// Normalize rows into records in one pass. Later rows overwrite earlier
/// rows with the same trimmed code.
pub fn build_catalog(
    rows: impl IntoIterator<Item = RawCatalogRow>,
    updated_at: DateTime<Utc>,
) -> ExtractedCatalog {
    let mut by_code: BTreeMap<String, CatalogRecord> = BTreeMap::new();
    let mut rows_read = 0usize;
    let mut duplicates = 0usize;
    let mut skipped = 0usize;

    for row in rows {
        rows_read += 1;
        let code = row.code.trim();
        if code.is_empty() || row.price <= Decimal::ZERO {
            skipped += 1;
            continue;
        }

        let description = row.description.unwrap_or_default();
        let record = CatalogRecord {
            code: code.to_string(),
            normalized_description: normalize(&description),
            keywords: extract_keywords(&description),
            description,
            price: row.price,
            updated_at,
        };
        if by_code.insert(record.code.clone(), record).is_some() {
            duplicates += 1;
            debug!(code, "duplicate code, keeping the later row");
        }
    }

    ExtractedCatalog {
        records: by_code.into_values().collect(),
        rows_read,
        duplicates,
        skipped,
    }
}
