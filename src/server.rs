//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Answer from the whole corpus |
//! | `POST` | `/query/selection` | Answer from the selected text only |
//! | `GET`  | `/sessions/{id}/history` | Page through a session's messages (`?limit=&after=`) |
//! | `GET`  | `/health` | Status, crate version, active corpus version |
//!
//! # Error contract
//!
//! ```json
//! { "error_kind": "rate_limited", "message": "...", "retry_after": 45 }
//! ```
//!
//! `retry_after` is present only for `rate_limited` and is repeated in the
//! `Retry-After` header. Status codes: `invalid_input` 400, `not_found` 404,
//! `rate_limited` 429, `persistence_failed` 500, `retrieval_unavailable` and
//! `generation_unavailable` 503. A refusal is not an error: it is a 200 with
//! `grounded: false` (or `in_selected_text: false`).
//!
//! # Client address
//!
//! The socket peer address identifies the client for rate limiting. Only
//! with `[server].trust_forwarded_for = true` (off by default, for
//! deployments behind a proxy that overwrites the header) does the first
//! `X-Forwarded-For` hop take its place.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the book's web pages
//! can call the API from the browser.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ConnectInfo, Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use book_rag_core::ratelimit::{Clock, InMemoryCounterStore};

use crate::config::Config;
use crate::error::QueryError;
use crate::orchestrator::{
    Components, Orchestrator, QueryRequest, QueryResponse, SelectionRequest, SelectionResponse,
};
use crate::session::HistoryPage;

/// Shared state handed to every handler.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    trust_forwarded_for: bool,
}

/// Wire up production components and serve on `[server].bind` until the
/// process is terminated.
pub async fn run_server(config: &Config) -> Result<()> {
    let counters = Arc::new(InMemoryCounterStore::new());
    let components = Components::from_config(config, counters.clone()).await?;
    spawn_counter_pruner(counters, components.clock.clone(), Duration::from_secs(60));
    let orchestrator = Arc::new(Orchestrator::new(config, components));

    let listener = TcpListener::bind(&config.server.bind).await?;
    serve(listener, orchestrator, config.server.trust_forwarded_for).await
}

/// Serve the API on an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    orchestrator: Arc<Orchestrator>,
    trust_forwarded_for: bool,
) -> Result<()> {
    tracing::info!(
        addr = %listener.local_addr()?,
        corpus_version = orchestrator.corpus_version(),
        "book-rag server listening"
    );
    let app = router(orchestrator, trust_forwarded_for);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub fn router(orchestrator: Arc<Orchestrator>, trust_forwarded_for: bool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(handle_query))
        .route("/query/selection", post(handle_selection))
        .route("/sessions/{id}/history", get(handle_history))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState {
            orchestrator,
            trust_forwarded_for,
        })
}

/// Drop expired rate-limit windows periodically so the map stays bounded.
fn spawn_counter_pruner(
    counters: Arc<InMemoryCounterStore>,
    clock: Arc<dyn Clock>,
    every: Duration,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            counters.prune(clock.now());
            tracing::trace!(live = counters.len(), "pruned rate-limit counters");
        }
    });
}

fn client_addr(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let first_hop = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = first_hop {
            return hop.to_string();
        }
    }
    peer.ip().to_string()
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error_kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

struct AppError(QueryError);

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        AppError(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError(QueryError::InvalidInput(rejection.body_text()))
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError(QueryError::InvalidInput(rejection.body_text()))
    }
}

fn status_for(err: &QueryError) -> StatusCode {
    match err {
        QueryError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        QueryError::NotFound(_) => StatusCode::NOT_FOUND,
        QueryError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        QueryError::RetrievalUnavailable(_) | QueryError::GenerationUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        QueryError::PersistenceFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        let retry_after = err.retry_after_secs();
        let body = ErrorBody {
            error_kind: err.kind(),
            message: err.to_string(),
            retry_after,
        };
        let mut response = (status_for(&err), Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

// ============ POST /query ============

async fn handle_query(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(req) = body?;
    let client = client_addr(&headers, peer, state.trust_forwarded_for);
    let resp = state.orchestrator.query(req, &client).await?;
    Ok(Json(resp))
}

// ============ POST /query/selection ============

async fn handle_selection(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<SelectionRequest>, JsonRejection>,
) -> Result<Json<SelectionResponse>, AppError> {
    let Json(req) = body?;
    let client = client_addr(&headers, peer, state.trust_forwarded_for);
    let resp = state.orchestrator.query_selected_text(req, &client).await?;
    Ok(Json(resp))
}

// ============ GET /sessions/{id}/history ============

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
    after: Option<i64>,
}

async fn handle_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> Result<Json<HistoryPage>, AppError> {
    let Query(params) = params?;
    let page = state
        .orchestrator
        .get_history(&session_id, params.limit, params.after)
        .await?;
    Ok(Json(page))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    corpus_version: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        corpus_version: state.orchestrator.corpus_version().to_string(),
    })
}
