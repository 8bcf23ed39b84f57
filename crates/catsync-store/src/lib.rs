//! Downstream catalog store: the PostgREST client used in production and an
//! in-memory store for offline runs.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use catsync_core::CatalogRecord;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "catsync-store";

/// Column holding the business key in the downstream table.
pub const KEY_COLUMN: &str = "codigo";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

/// Bulk operations offered by the downstream store. All three are safe to
/// retry: re-sending a chunk converges to the same end state.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert-or-overwrite keyed by `code`.
    async fn upsert(&self, records: &[CatalogRecord]) -> Result<(), StoreError>;
    async fn delete_codes(&self, codes: &[String]) -> Result<(), StoreError>;
    async fn list_codes(&self) -> Result<BTreeSet<String>, StoreError>;
}

/// Row shape of the downstream table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamRow {
    #[serde(rename = "codigo")]
    pub code: String,
    #[serde(rename = "descripcion")]
    pub description: String,
    #[serde(rename = "descripcion_normalizada")]
    pub normalized_description: String,
    pub keywords: Vec<String>,
    #[serde(rename = "precio_final")]
    pub price: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl From<&CatalogRecord> for DownstreamRow {
    fn from(record: &CatalogRecord) -> Self {
        Self {
            code: record.code.clone(),
            description: record.description.clone(),
            normalized_description: record.normalized_description.clone(),
            keywords: record.keywords.iter().cloned().collect(),
            price: record.price,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeyRow {
    #[serde(rename = "codigo")]
    code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub table: String,
    pub timeout: Duration,
    pub page_size: usize,
    pub backoff: BackoffPolicy,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            table: "productos_catalogo".to_string(),
            timeout: Duration::from_secs(20),
            page_size: 1000,
            backoff: BackoffPolicy::default(),
        }
    }

    /// `SUPABASE_URL` and `SUPABASE_KEY` are required, the rest have defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("SUPABASE_URL").context("SUPABASE_URL is not set")?;
        let api_key = std::env::var("SUPABASE_KEY").context("SUPABASE_KEY is not set")?;
        let mut config = Self::new(base_url, api_key);
        if let Ok(table) = std::env::var("CATSYNC_SINK_TABLE") {
            config.table = table;
        }
        if let Some(secs) = std::env::var("CATSYNC_SINK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(page_size) = std::env::var("CATSYNC_SINK_PAGE_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.page_size = page_size.max(1);
        }
        Ok(config)
    }
}

#[derive(Debug)]
pub struct RestCatalogStore {
    client: reqwest::Client,
    table_url: String,
    page_size: usize,
    backoff: BackoffPolicy,
}

impl RestCatalogStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&config.api_key)
                .context("api key is not a valid header value")?,
        );
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .context("api key is not a valid header value")?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            table_url: format!(
                "{}/rest/v1/{}",
                config.base_url.trim_end_matches('/'),
                config.table
            ),
            page_size: config.page_size.max(1),
            backoff: config.backoff,
        })
    }

    pub fn table_url(&self) -> &str {
        &self.table_url
    }

    /// Sends the request built by `build`, retrying transient failures with
    /// exponential backoff. `build` is called once per attempt.
    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retrying downstream request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying downstream request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl CatalogStore for RestCatalogStore {
    async fn upsert(&self, records: &[CatalogRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let rows = records.iter().map(DownstreamRow::from).collect::<Vec<_>>();
        let span = info_span!("downstream_upsert", rows = rows.len());
        self.send_with_retry(|| {
            self.client
                .post(&self.table_url)
                .query(&[("on_conflict", KEY_COLUMN)])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&rows)
        })
        .instrument(span)
        .await?;
        Ok(())
    }

    async fn delete_codes(&self, codes: &[String]) -> Result<(), StoreError> {
        if codes.is_empty() {
            return Ok(());
        }
        let filter = in_filter(codes);
        let span = info_span!("downstream_delete", codes = codes.len());
        self.send_with_retry(|| {
            self.client
                .delete(&self.table_url)
                .query(&[(KEY_COLUMN, filter.as_str())])
                .header("Prefer", "return=minimal")
        })
        .instrument(span)
        .await?;
        Ok(())
    }

    async fn list_codes(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut codes = BTreeSet::new();
        let mut offset = 0usize;
        loop {
            let limit = self.page_size.to_string();
            let page_offset = offset.to_string();
            let resp = self
                .send_with_retry(|| {
                    self.client.get(&self.table_url).query(&[
                        ("select", KEY_COLUMN),
                        ("order", "codigo.asc"),
                        ("limit", limit.as_str()),
                        ("offset", page_offset.as_str()),
                    ])
                })
                .await?;
            let page: Vec<KeyRow> = resp.json().await?;
            let page_len = page.len();
            codes.extend(page.into_iter().map(|row| row.code));
            debug!(offset, page_len, "downstream key page read");

            if page_len < self.page_size {
                return Ok(codes);
            }
            offset += page_len;
        }
    }
}

/// PostgREST `in.(...)` filter with every value double-quoted, so codes
/// containing commas, dots or parentheses survive.
pub fn in_filter(codes: &[String]) -> String {
    let quoted = codes
        .iter()
        .map(|code| format!("\"{}\"", code.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({quoted})")
}

/// Keyed map guarded by a mutex. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    rows: Mutex<BTreeMap<String, CatalogRecord>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = CatalogRecord>) -> Self {
        Self {
            rows: Mutex::new(
                records
                    .into_iter()
                    .map(|record| (record.code.clone(), record))
                    .collect(),
            ),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    pub async fn get(&self, code: &str) -> Option<CatalogRecord> {
        self.rows.lock().await.get(code).cloned()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn upsert(&self, records: &[CatalogRecord]) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        for record in records {
            rows.insert(record.code.clone(), record.clone());
        }
        Ok(())
    }

    async fn delete_codes(&self, codes: &[String]) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        for code in codes {
            rows.remove(code);
        }
        Ok(())
    }

    async fn list_codes(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.rows.lock().await.keys().cloned().collect())
    }
}
