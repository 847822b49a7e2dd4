//! HTTP server: a thin axum adapter over the routing pipeline and the
//! ephemeral engine.
//!
//! Provides [`serve`], which wires up the database, classifier, embedding
//! provider, and background re-extraction worker into a running server. The
//! handlers do request/response translation only; all semantics live in the
//! engine.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::classify;
use crate::config::BranchlineConfig;
use crate::db;
use crate::embedding;
use crate::ephemeral::state_store::InMemoryStateStore;
use crate::ephemeral::{EphemeralEngine, EphemeralMessage, EphemeralRequest, EphemeralState};
use crate::error::{EngineError, StageError};
use crate::model::Role;
use crate::pipeline::{Pipeline, RouteRequest};
use crate::reextract;
use crate::store::sqlite::SqliteStore;
use crate::store::RoutingStore;

struct AppState {
    pipeline: Pipeline,
    ephemeral: EphemeralEngine,
}

/// Open the database and wire both engines. Split from [`serve`] so tests
/// can build the router without binding a socket.
fn build_state(config: &BranchlineConfig) -> Result<Arc<AppState>> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path)?;
    tracing::info!(db = %db_path.display(), "database ready");

    let store: Arc<dyn RoutingStore> = Arc::new(SqliteStore::new(conn));
    let classifier = classify::create_classifier(&config.classifier)?;
    let embedding: Option<Arc<dyn embedding::EmbeddingProvider>> =
        embedding::create_provider(&config.embedding)?.map(Arc::from);
    let reextract = reextract::spawn_worker(store.clone(), classifier.clone());

    let pipeline = Pipeline::new(
        store,
        classifier.clone(),
        embedding.clone(),
        Some(reextract),
        config.routing.clone(),
    );
    let ephemeral = EphemeralEngine::new(
        classifier,
        embedding,
        Arc::new(InMemoryStateStore::new()),
        config.routing.clone(),
    );

    Ok(Arc::new(AppState {
        pipeline,
        ephemeral,
    }))
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/conversations/{conversation_id}/messages",
            post(route_message),
        )
        .route("/v1/ephemeral/route", post(route_ephemeral))
        .with_state(state)
}

/// Start the HTTP server and block until shutdown.
pub async fn serve(config: BranchlineConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = build_state(&config)?;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "routing server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct RouteMessageBody {
    content: String,
    role: Role,
    branch_id: Option<String>,
    #[serde(default = "default_extract_facts")]
    extract_facts: bool,
}

fn default_extract_facts() -> bool {
    true
}

async fn route_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RouteMessageBody>,
) -> Result<Response, ApiError> {
    let tenant_id = tenant_from_headers(&headers)?;

    let outcome = state
        .pipeline
        .route_message(RouteRequest {
            tenant_id,
            conversation_id,
            content: body.content,
            role: body.role,
            branch_id: body.branch_id,
            extract_facts: body.extract_facts,
        })
        .await?;

    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
struct EphemeralBody {
    conversation_id: String,
    messages: Vec<EphemeralMessage>,
    state: Option<EphemeralState>,
    #[serde(default = "default_extract_facts")]
    extract_facts: bool,
}

async fn route_ephemeral(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EphemeralBody>,
) -> Result<Response, ApiError> {
    let outcome = state
        .ephemeral
        .process(EphemeralRequest {
            conversation_id: body.conversation_id,
            messages: body.messages,
            state: body.state,
            extract_facts: body.extract_facts,
        })
        .await?;

    Ok(Json(outcome).into_response())
}

fn tenant_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or(ApiError::MissingTenant)
}

/// HTTP-facing error: engine failures plus header validation.
#[derive(Debug)]
enum ApiError {
    MissingTenant,
    Engine(StageError),
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        Self::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, stage, message) = match &self {
            Self::MissingTenant => (
                StatusCode::BAD_REQUEST,
                None,
                "missing x-tenant-id header".to_string(),
            ),
            Self::Engine(err) => (engine_status(&err.source), Some(err.stage), err.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(%status, %message, "request failed");
        }

        let body = json!({
            "error": message,
            "stage": stage.map(|s| s.as_str()),
        });
        (status, Json(body)).into_response()
    }
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::External(_) | EngineError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        EngineError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}
