//! HTTP server over the session engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/sessions` | List active session ids |
//! | `POST`   | `/sessions/{id}/turns` | Run one turn, `{ "query": "..." }` |
//! | `POST`   | `/sessions/{id}/turns/stream` | Run one turn as server-sent events |
//! | `GET`    | `/sessions/{id}/history` | Message log of a session |
//! | `DELETE` | `/sessions/{id}?preserve_system=true` | Clear a session |
//!
//! A turn reply looks like:
//!
//! ```json
//! {
//!   "answer": "The P-40 delivers 40 bar [1].",
//!   "sources": [{ "id": "1", "title": "P-40", "content": "...", "parent_id": "doc-17" }],
//!   "history_trimmed": false,
//!   "status": "answered"
//! }
//! ```
//!
//! The streaming variant emits `delta` events carrying raw model text and
//! ends with one `done` event whose data is the reply above. Closing the
//! connection before `done` cancels the turn.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `session_busy` (409).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::engine::{SessionEngine, TurnEvent, TurnReply};
use crate::error::TurnError;
use crate::models::Message;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    engine: SessionEngine,
}

/// Starts the HTTP server with an engine built from `config`.
///
/// Binds to the address configured in `[server].bind` and runs until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = SessionEngine::from_config(config).await?;
    serve(engine, &config.server.bind).await
}

/// Serve `engine` on `bind_addr` until Ctrl-C, then flush the turn log.
///
/// Idle sessions are swept while the server runs.
pub async fn serve(engine: SessionEngine, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(engine.clone());
    let sweeper = engine.spawn_idle_sweeper();

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = bind_addr, "server listening");
    println!("rags server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    engine.flush_logs().await;
    Ok(())
}

/// The application router, without a listener.
pub fn router(engine: SessionEngine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sessions", get(handle_list_sessions))
        .route("/sessions/{id}", axum::routing::delete(handle_clear_session))
        .route("/sessions/{id}/turns", post(handle_turn))
        .route("/sessions/{id}/turns/stream", post(handle_stream_turn))
        .route("/sessions/{id}/history", get(handle_history))
        .layer(cors)
        .with_state(AppState { engine })
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"session_busy"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<TurnError> for AppError {
    fn from(err: TurnError) -> Self {
        let (status, code) = match &err {
            TurnError::EmptyQuery => (StatusCode::BAD_REQUEST, "bad_request"),
            TurnError::SessionBusy(_) => (StatusCode::CONFLICT, "session_busy"),
            TurnError::UnknownSession(_) => (StatusCode::NOT_FOUND, "not_found"),
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /sessions ============

#[derive(Serialize)]
struct SessionListResponse {
    sessions: Vec<String>,
}

async fn handle_list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.engine.sessions(),
    })
}

// ============ POST /sessions/{id}/turns ============

#[derive(Deserialize)]
struct TurnRequest {
    query: String,
}

async fn handle_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TurnRequest>,
) -> Result<Json<TurnReply>, AppError> {
    let reply = state.engine.start_turn(&id, &req.query).await?;
    Ok(Json(reply))
}

// ============ POST /sessions/{id}/turns/stream ============

async fn handle_stream_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let events = state.engine.stream_turn(&id, &req.query).await?;
    let sse = events.map(|event| Ok(to_sse(event)));
    Ok(Sse::new(sse).keep_alive(KeepAlive::default()))
}

fn to_sse(event: TurnEvent) -> Event {
    match event {
        TurnEvent::Delta(text) => Event::default().event("delta").data(text),
        TurnEvent::Done(reply) => match Event::default().event("done").json_data(&reply) {
            Ok(event) => event,
            Err(e) => Event::default().event("error").data(e.to_string()),
        },
    }
}

// ============ GET /sessions/{id}/history ============

#[derive(Serialize)]
struct HistoryResponse {
    session_id: String,
    messages: Vec<Message>,
}

async fn handle_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, AppError> {
    let messages = state.engine.history(&id).await?;
    Ok(Json(HistoryResponse {
        session_id: id,
        messages,
    }))
}

// ============ DELETE /sessions/{id} ============

#[derive(Deserialize)]
struct ClearParams {
    #[serde(default = "default_preserve_system")]
    preserve_system: bool,
}

fn default_preserve_system() -> bool {
    true
}

#[derive(Serialize)]
struct ClearResponse {
    session_id: String,
    cleared: bool,
    preserve_system: bool,
}

async fn handle_clear_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ClearParams>,
) -> Result<Json<ClearResponse>, AppError> {
    state
        .engine
        .clear_session(&id, params.preserve_system)
        .await?;
    Ok(Json(ClearResponse {
        session_id: id,
        cleared: true,
        preserve_system: params.preserve_system,
    }))
}
