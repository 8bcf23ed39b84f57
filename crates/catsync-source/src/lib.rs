//! Upstream catalog source contracts plus the Postgres and fixture-backed
//! implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use catsync_core::{normalize, RawCatalogRow};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "catsync-source";

/// Upper bound on the number of terms a single search may AND together.
pub const MAX_SEARCH_TERMS: usize = 8;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("fixture error: {0}")]
    Fixture(String),
    #[error("invalid table name `{0}`")]
    InvalidTable(String),
    #[error("no upstream configured (set CATSYNC_SOURCE_URL or CATSYNC_SOURCE_FIXTURE)")]
    NotConfigured,
}

/// Read side used by the sync pipeline. Implementations must not mutate
/// upstream state.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Rows with a positive price, in upstream order.
    async fn fetch_rows(&self) -> Result<Vec<RawCatalogRow>, SourceError>;
}

/// Ad-hoc multi-term lookup served straight from the upstream source.
#[async_trait]
pub trait CatalogSearch: Send + Sync {
    async fn search(
        &self,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<SearchHit>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub code: String,
    pub description: String,
    pub price: Decimal,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub database_url: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub table: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            fixture_path: None,
            table: "productos_catalogo".to_string(),
            max_connections: 4,
            connect_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(60),
        }
    }
}

impl SourceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("CATSYNC_SOURCE_URL").ok(),
            fixture_path: std::env::var("CATSYNC_SOURCE_FIXTURE").ok().map(PathBuf::from),
            table: std::env::var("CATSYNC_SOURCE_TABLE").unwrap_or(defaults.table),
            max_connections: std::env::var("CATSYNC_SOURCE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            connect_timeout: std::env::var("CATSYNC_SOURCE_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            query_timeout: std::env::var("CATSYNC_SOURCE_QUERY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.query_timeout),
        }
    }
}

/// Both upstream roles backed by the same implementation.
#[derive(Clone)]
pub struct SourceHandles {
    pub source: Arc<dyn CatalogSource>,
    pub search: Arc<dyn CatalogSearch>,
}

impl SourceHandles {
    pub fn from_backend<T>(backend: T) -> Self
    where
        T: CatalogSource + CatalogSearch + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            source: backend.clone(),
            search: backend,
        }
    }
}

/// Fixture file wins over a database URL so offline runs never reach a server.
pub fn open_from_config(config: &SourceConfig) -> Result<SourceHandles, SourceError> {
    if let Some(path) = &config.fixture_path {
        return Ok(SourceHandles::from_backend(StaticCatalogSource::from_json_file(
            path,
        )?));
    }
    if config.database_url.is_some() {
        return Ok(SourceHandles::from_backend(PgCatalogSource::connect(config)?));
    }
    Err(SourceError::NotConfigured)
}

#[derive(Debug, Clone)]
pub struct PgCatalogSource {
    pool: PgPool,
    table: String,
    query_timeout: Duration,
}

impl PgCatalogSource {
    /// Builds a lazy pool; connection errors surface on the first query.
    pub fn connect(config: &SourceConfig) -> Result<Self, SourceError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or(SourceError::NotConfigured)?;
        let table = validate_table_name(&config.table)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.connect_timeout)
            .connect_lazy(url)?;
        Ok(Self {
            pool,
            table,
            query_timeout: config.query_timeout,
        })
    }

    fn select_prefix(&self) -> String {
        format!(
            "SELECT codigo::text AS code, \
                    descripcion::text AS description, \
                    precio_final::numeric AS price \
               FROM {} \
              WHERE precio_final > 0",
            self.table
        )
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, SourceError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SourceError::Timeout(self.query_timeout)),
        }
    }
}

fn row_to_raw(row: &PgRow) -> Result<RawCatalogRow, sqlx::Error> {
    Ok(RawCatalogRow {
        code: row.try_get("code")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
    })
}

#[async_trait]
impl CatalogSource for PgCatalogSource {
    async fn fetch_rows(&self) -> Result<Vec<RawCatalogRow>, SourceError> {
        let sql = self.select_prefix();
        let span = info_span!("upstream_fetch", table = %self.table);
        let rows = self
            .with_timeout(sqlx::query(&sql).fetch_all(&self.pool))
            .instrument(span)
            .await?;
        debug!(rows = rows.len(), "upstream rows fetched");
        rows.iter()
            .map(row_to_raw)
            .collect::<Result<Vec<_>, _>>()
            .map_err(SourceError::from)
    }
}

#[async_trait]
impl CatalogSearch for PgCatalogSource {
    async fn search(
        &self,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<SearchHit>, SourceError> {
        let mut qb = QueryBuilder::<Postgres>::new(self.select_prefix());
        for term in terms.iter().take(MAX_SEARCH_TERMS) {
            qb.push(" AND descripcion ILIKE ");
            qb.push_bind(format!("%{}%", escape_like(term)));
        }
        qb.push(" ORDER BY descripcion LIMIT ");
        qb.push_bind(limit.max(1) as i64);

        let rows = self.with_timeout(qb.build().fetch_all(&self.pool)).await?;
        rows.iter()
            .map(|row| {
                let raw = row_to_raw(row)?;
                Ok(SearchHit {
                    code: raw.code.trim().to_string(),
                    description: raw.description.unwrap_or_default(),
                    price: raw.price,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(SourceError::from)
    }
}

/// In-memory rows, typically loaded from a JSON fixture for offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalogSource {
    rows: Vec<RawCatalogRow>,
}

impl StaticCatalogSource {
    pub fn new(rows: Vec<RawCatalogRow>) -> Self {
        Self { rows }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        load_fixture_rows(path.as_ref())
            .map(Self::new)
            .map_err(|err| SourceError::Fixture(format!("{err:#}")))
    }

    pub fn rows(&self) -> &[RawCatalogRow] {
        &self.rows
    }
}

fn load_fixture_rows(path: &Path) -> anyhow::Result<Vec<RawCatalogRow>> {
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    async fn fetch_rows(&self) -> Result<Vec<RawCatalogRow>, SourceError> {
        Ok(self
            .rows
            .iter()
            .filter(|row| row.price > Decimal::ZERO)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CatalogSearch for StaticCatalogSource {
    async fn search(
        &self,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<SearchHit>, SourceError> {
        let needles = terms
            .iter()
            .take(MAX_SEARCH_TERMS)
            .map(|t| normalize(t))
            .collect::<Vec<_>>();
        let mut hits = self
            .rows
            .iter()
            .filter(|row| row.price > Decimal::ZERO)
            .filter_map(|row| {
                let description = row.description.clone().unwrap_or_default();
                let haystack = normalize(&description);
                needles
                    .iter()
                    .all(|needle| haystack.contains(needle.as_str()))
                    .then(|| SearchHit {
                        code: row.code.trim().to_string(),
                        description,
                        price: row.price,
                    })
            })
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| a.description.cmp(&b.description));
        hits.truncate(limit.max(1));
        Ok(hits)
    }
}

/// Split a free-text query into distinct search terms.
pub fn search_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query.split_whitespace() {
        if !terms.iter().any(|t| t.eq_ignore_ascii_case(term)) {
            terms.push(term.to_string());
        }
        if terms.len() == MAX_SEARCH_TERMS {
            break;
        }
    }
    terms
}

/// Escape LIKE wildcards so user terms match literally (backslash is the
/// default escape character in Postgres).
pub fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Table names are interpolated into SQL, so only plain (optionally
/// schema-qualified) identifiers are accepted.
pub fn validate_table_name(table: &str) -> Result<String, SourceError> {
    let table = table.trim();
    let valid = !table.is_empty()
        && table.split('.').count() <= 2
        && table.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(table.to_string())
    } else {
        Err(SourceError::InvalidTable(table.to_string()))
    }
}
