//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `PUT`   | `/api/document` | Ingest a rendered document into a project |
//! | `POST`  | `/api/chat` | Answer the last user message (server-sent events) |
//! | `GET`   | `/api/projects` | Projects readable by the caller |
//! | `POST`  | `/api/projects` | Create a project |
//! | `GET`   | `/api/projects/{id}` | Fetch a project |
//! | `PATCH` | `/api/projects/{id}` | Edit a project (owner only) |
//! | `GET`   | `/api/projects/{id}/documents` | Documents of a project |
//! | `GET`   | `/health` | Health check (returns version) |
//!
//! The caller's identity is taken from the `x-user-id` and `x-user-name`
//! headers, set by the authenticating proxy in front of this service.
//!
//! # Error Contract
//!
//! ```json
//! { "success": false, "error": "Missing imagesDir" }
//! ```
//!
//! See [`crate::error`] for the status code of each error kind.
//!
//! # Chat stream
//!
//! `POST /api/chat` answers with `text/event-stream`. Each event's name is
//! its kind (`search_query`, `source`, `text`, `error`, `finish`) and its
//! data is the JSON form of [`ChatEvent`]. Exactly one `error` or `finish`
//! event ends a stream. Closing the connection cancels generation.

use std::convert::Infallible;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use aiha_core::chunk::TextChunk;
use aiha_core::models::{Document, Project};

use crate::chat::{prepare_chat, start_chat_with_token, ChatEvent, ChatRequest};
use crate::context::AppContext;
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::{run_ingest, IngestRequest};
use crate::projects::{self, Identity, NewProject, ProjectUpdate};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";

#[derive(Clone)]
struct AppState {
    ctx: AppContext,
    /// Parent of every chat turn's token; cancelled on shutdown.
    shutdown: CancellationToken,
}

/// Build the router. Exposed so tests can serve it on their own listener.
pub fn router(ctx: AppContext, shutdown: CancellationToken) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/document", put(handle_ingest))
        .route("/api/chat", post(handle_chat))
        .route(
            "/api/projects",
            get(handle_list_projects).post(handle_create_project),
        )
        .route(
            "/api/projects/{id}",
            get(handle_get_project).patch(handle_update_project),
        )
        .route("/api/projects/{id}/documents", get(handle_list_documents))
        .layer(cors)
        .with_state(AppState { ctx, shutdown })
}

/// Serve the API on `[server].bind` until Ctrl-C.
pub async fn run_server(ctx: AppContext) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let shutdown = CancellationToken::new();
    let app = router(ctx, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "AIHA server listening");

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            signal_token.cancel();
        })
        .await?;

    Ok(())
}

/// Read the caller's identity from upstream-set headers. Blank values count
/// as absent.
pub fn identity_from_headers(headers: &HeaderMap) -> Identity {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    Identity {
        user_id: header(USER_ID_HEADER),
        user_name: header(USER_NAME_HEADER),
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> PipelineResult<T> {
    body.map(|Json(v)| v)
        .map_err(|e| PipelineError::validation(format!("Invalid request body: {}", e.body_text())))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ PUT /api/document ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    success: bool,
    document_id: String,
    chunks: Vec<TextChunk>,
}

async fn handle_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> PipelineResult<Json<IngestResponse>> {
    let request = json_body(body)?;
    let caller = identity_from_headers(&headers);
    let outcome = run_ingest(&state.ctx, &caller, &request).await?;
    Ok(Json(IngestResponse {
        success: true,
        document_id: outcome.document_id,
        chunks: outcome.chunks,
    }))
}

// ============ POST /api/chat ============

fn to_sse(event: ChatEvent) -> Event {
    let name = event.name();
    Event::default()
        .event(name)
        .json_data(&event)
        .unwrap_or_else(|e| Event::default().event("error").data(error_data(&e.to_string())))
}

/// JSON payload of an `error` event.
fn error_data(message: &str) -> String {
    serde_json::json!({"type": "error", "message": message}).to_string()
}

async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, PipelineError> {
    let request = json_body(body)?;
    let caller = identity_from_headers(&headers);
    let prepared = prepare_chat(&state.ctx, &caller, request).await?;

    let events = start_chat_with_token(
        state.ctx.clone(),
        prepared,
        state.shutdown.child_token(),
    );
    let stream = events.map(|event| Ok::<_, Infallible>(to_sse(event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ /api/projects ============

async fn handle_list_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> PipelineResult<Json<Vec<Project>>> {
    let caller = identity_from_headers(&headers);
    let list = projects::list_projects(state.ctx.store.as_ref(), &caller).await?;
    Ok(Json(list))
}

async fn handle_create_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<NewProject>, JsonRejection>,
) -> PipelineResult<Response> {
    let input = json_body(body)?;
    let caller = identity_from_headers(&headers);
    let project = projects::create_project(state.ctx.store.as_ref(), &caller, input).await?;
    Ok((axum::http::StatusCode::CREATED, Json(project)).into_response())
}

async fn handle_get_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> PipelineResult<Json<Project>> {
    let caller = identity_from_headers(&headers);
    let project = projects::get_project(state.ctx.store.as_ref(), &caller, &id).await?;
    Ok(Json(project))
}

async fn handle_update_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<ProjectUpdate>, JsonRejection>,
) -> PipelineResult<Json<Project>> {
    let update = json_body(body)?;
    let caller = identity_from_headers(&headers);
    let project = projects::update_project(state.ctx.store.as_ref(), &caller, &id, update).await?;
    Ok(Json(project))
}

async fn handle_list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> PipelineResult<Json<Vec<Document>>> {
    let caller = identity_from_headers(&headers);
    let docs = projects::list_documents(state.ctx.store.as_ref(), &caller, &id).await?;
    Ok(Json(docs))
}
