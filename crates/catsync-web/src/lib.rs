//! Axum routes for triggering syncs, reporting status and searching the catalog.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use catsync_core::{SyncMode, SyncOutcome, SyncRun};
use catsync_source::{search_terms, CatalogSearch, SearchHit};
use catsync_sync::{SyncError, SyncOrchestrator, SyncState};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "catsync-web";

const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub search: Arc<dyn CatalogSearch>,
    pub search_limit: usize,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, search: Arc<dyn CatalogSearch>) -> Self {
        Self {
            orchestrator,
            search,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub state: SyncState,
    pub purge_enabled: bool,
    pub sync_interval_hours: u64,
    pub last_run: Option<SyncRun>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    mode: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    q: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct SearchBody {
    query: String,
    terms: Vec<String>,
    hits: Vec<SearchHit>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/sync", get(sync_handler).post(sync_handler))
        .route("/search", get(search_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http listener bound");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let config = state.orchestrator.config();
    Json(StatusBody {
        state: state.orchestrator.state(),
        purge_enabled: config.purge_enabled,
        sync_interval_hours: config.sync_interval_hours,
        last_run: state.orchestrator.last_run().await,
    })
    .into_response()
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    let mode = match query.mode.as_deref() {
        None | Some("") => state.orchestrator.config().default_mode(),
        Some(raw) => match raw.parse::<SyncMode>() {
            Ok(mode) => mode,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
        },
    };

    match state.orchestrator.run_sync(mode).await {
        Ok(run) => {
            let status = match run.outcome {
                SyncOutcome::Success | SyncOutcome::Aborted => StatusCode::OK,
                SyncOutcome::Failed => StatusCode::BAD_GATEWAY,
            };
            (status, Json(run)).into_response()
        }
        Err(err @ SyncError::AlreadyRunning) => {
            error_response(StatusCode::CONFLICT, err.to_string())
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let text = query.q.unwrap_or_default();
    let terms = search_terms(&text);
    if terms.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "query parameter `q` is required");
    }
    let limit = query
        .limit
        .unwrap_or(state.search_limit)
        .clamp(1, MAX_SEARCH_LIMIT);

    match state.search.search(&terms, limit).await {
        Ok(hits) => Json(SearchBody {
            query: text.trim().to_string(),
            terms,
            hits,
        })
        .into_response(),
        Err(err) => {
            warn!(error = %err, "catalog search failed");
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use catsync_core::RawCatalogRow;
    use catsync_source::{CatalogSource, SourceError, StaticCatalogSource};
    use catsync_store::MemoryCatalogStore;
    use catsync_sync::SyncConfig;
    use http_body_util::BodyExt;
    use rust_decimal::Decimal;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn rows() -> Vec<RawCatalogRow> {
        vec![
            RawCatalogRow::new(
                "PY-125",
                Some("Placa de Yeso Estándar 12.5mm"),
                Decimal::new(8450, 2),
            ),
            RawCatalogRow::new("MT-70", Some("Perfil Montante 70mm"), Decimal::new(3120, 2)),
            RawCatalogRow::new("SL-70", Some("Perfil Solera 70mm"), Decimal::new(2890, 2)),
        ]
    }

    fn state_with(source: Arc<dyn CatalogSource>, config: SyncConfig) -> AppState {
        let orchestrator = Arc::new(SyncOrchestrator::new(
            config,
            source,
            Arc::new(MemoryCatalogStore::new()),
        ));
        AppState::new(orchestrator, Arc::new(StaticCatalogSource::new(rows())))
    }

    fn static_state() -> AppState {
        state_with(Arc::new(StaticCatalogSource::new(rows())), SyncConfig::default())
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    struct DownSource;

    #[async_trait]
    impl CatalogSource for DownSource {
        async fn fetch_rows(&self) -> Result<Vec<RawCatalogRow>, SourceError> {
            Err(SourceError::NotConfigured)
        }
    }

    struct HeldSource {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CatalogSource for HeldSource {
        async fn fetch_rows(&self) -> Result<Vec<RawCatalogRow>, SourceError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(rows())
        }
    }

    #[tokio::test]
    async fn health_is_ok() {
        let resp = app(static_state()).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn sync_returns_run_and_status_reports_it() {
        let app = app(static_state());
        let resp = app.clone().oneshot(get("/sync")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let run = json_body(resp).await;
        assert_eq!(run["outcome"], "success");
        assert_eq!(run["mode"], "upsert_only");
        assert_eq!(run["upserted_count"], 3);

        let resp = app.oneshot(get("/status")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status = json_body(resp).await;
        assert_eq!(status["state"], "idle");
        assert_eq!(status["last_run"]["run_id"], run["run_id"]);
    }

    #[tokio::test]
    async fn post_sync_accepts_mode_and_rejects_unknown_modes() {
        let app = app(static_state());
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/sync?mode=upsert-and-purge")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        // purge is disabled by default, so the request is downgraded
        let run = json_body(resp).await;
        assert_eq!(run["mode"], "upsert_only");
        assert_eq!(run["warnings"].as_array().unwrap().len(), 1);

        let resp = app.oneshot(get("/sync?mode=everything")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_run_maps_to_bad_gateway() {
        let app = app(state_with(Arc::new(DownSource), SyncConfig::default()));
        let resp = app.oneshot(get("/sync")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let run = json_body(resp).await;
        assert_eq!(run["outcome"], "failed");
        assert!(run["abort_reason"]
            .as_str()
            .unwrap()
            .starts_with("source_unavailable"));
    }

    #[tokio::test]
    async fn sync_while_running_is_a_conflict() {
        let source = Arc::new(HeldSource {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let app = app(state_with(source.clone(), SyncConfig::default()));

        let first = tokio::spawn(app.clone().oneshot(get("/sync")));
        source.entered.notified().await;

        let resp = app.clone().oneshot(get("/status")).await.unwrap();
        assert_eq!(json_body(resp).await["state"], "running");

        let resp = app.clone().oneshot(get("/sync")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["error"], "sync already running");

        source.release.notify_one();
        let resp = first.await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn search_matches_every_term() {
        let resp = app(static_state())
            .oneshot(get("/search?q=perfil%2070mm&limit=5"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let codes = body["hits"]
            .as_array()
            .unwrap()
            .iter()
            .map(|hit| hit["code"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(codes, vec!["MT-70", "SL-70"]);
        assert_eq!(body["terms"], json!(["perfil", "70mm"]));
    }

    #[tokio::test]
    async fn search_without_query_is_rejected() {
        let app = app(static_state());
        let resp = app.clone().oneshot(get("/search")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = app.oneshot(get("/search?q=%20%20")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
