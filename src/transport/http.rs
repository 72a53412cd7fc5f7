//! HTTP boundary of the tunnel
//!
//! Routes, relative to the configured base path:
//! ```text
//! POST   /{session}  {"cmd":"start"}              run the engine for this session
//! POST   /{session}  {"cmd":"sync","seq":n,...}   admit a batch, fetch a page
//! POST   /{session}  {"cmd":"stop"}               ask the engine to exit
//! DELETE /{session}                               destroy the session
//! GET    /{session}                               session diagnostics
//! ```

use super::{Resolver, SystemResolver};
use crate::config::Config;
use crate::protocol::{
    decode_request, encode_reply, Message, Reply, Request, PAGE_SIZE, REORDER_WINDOW,
};
use crate::session::{MemoryStore, SessionId, SessionState, SessionStore};
use crate::tunnel::{EngineConfig, TunnelEngine};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Builder for the tunnel's axum router
pub struct TunnelRouter {
    store: Arc<dyn SessionStore>,
    resolver: Arc<dyn Resolver>,
    engine: EngineConfig,
    page_size: usize,
    reorder_window: u64,
}

impl TunnelRouter {
    /// Router over the given store and resolver with default tuning
    pub fn new(store: Arc<dyn SessionStore>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            store,
            resolver,
            engine: EngineConfig::default(),
            page_size: PAGE_SIZE,
            reorder_window: REORDER_WINDOW,
        }
    }

    /// In-memory sessions and the system resolver, tuned by `config`
    pub fn from_config(config: &Config) -> Self {
        let resolver = SystemResolver::new(Duration::from_millis(config.tunnel.resolve_timeout_ms));
        Self::new(Arc::new(MemoryStore::new()), Arc::new(resolver))
            .engine_config(EngineConfig::from(&config.tunnel))
            .page_size(config.tunnel.page_size)
            .reorder_window(config.tunnel.reorder_window)
    }

    pub fn engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Outbound messages per sync response
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// How far ahead of the next expected sequence number a session
    /// buffers batches
    pub fn reorder_window(mut self, window: u64) -> Self {
        self.reorder_window = window.max(1);
        self
    }

    /// Build the router with sessions mounted under `base`
    pub fn build(self, base: &str) -> Router {
        let state = Arc::new(TunnelState {
            store: self.store,
            resolver: self.resolver,
            engine: self.engine,
            page_size: self.page_size,
            reorder_window: self.reorder_window,
        });

        Router::new()
            .route(
                &session_route(base),
                post(handle_post).delete(handle_delete).get(handle_get),
            )
            .with_state(state)
    }
}

fn session_route(base: &str) -> String {
    format!("{}/{{session}}", base.trim_end_matches('/'))
}

/// Shared state for the tunnel router
struct TunnelState {
    store: Arc<dyn SessionStore>,
    resolver: Arc<dyn Resolver>,
    engine: EngineConfig,
    page_size: usize,
    reorder_window: u64,
}

/// Request-level failures, all answered with `{"cmd":"error"}`
#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Engine task failed: {0}")]
    Engine(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        json_reply(self.status(), &Reply::Error)
    }
}

fn json_reply(status: StatusCode, reply: &Reply) -> Response {
    match encode_reply(reply) {
        Ok(body) => (status, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn parse_session(raw: &str) -> Result<SessionId, ApiError> {
    SessionId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Dispatch a POST by its `cmd`
async fn handle_post(
    State(state): State<Arc<TunnelState>>,
    Path(session): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let session = parse_session(&session)?;
    let request = decode_request(&body).map_err(|e| {
        warn!(%session, "Malformed request: {}", e);
        ApiError::BadRequest(e.to_string())
    })?;

    match request {
        Request::Start => start(&state, session).await,
        Request::Sync { seq, msgs } => sync(&state, session, seq, msgs).await,
        Request::Stop => stop(&state, session).await,
    }
}

/// Create the session and hold the request open while its engine runs.
/// The engine runs in its own task so a client hanging up does not stop it.
async fn start(state: &TunnelState, session: SessionId) -> Result<Response, ApiError> {
    let fresh = SessionState::with_reorder_window(state.reorder_window);
    let Some(generation) = state.store.create(&session, fresh).await else {
        debug!(%session, "Start for existing session ignored");
        return Ok(StatusCode::OK.into_response());
    };

    info!(%session, generation, "Session started");
    let engine = TunnelEngine::new(
        session.clone(),
        generation,
        Arc::clone(&state.store),
        Arc::clone(&state.resolver),
        state.engine.clone(),
    );

    tokio::spawn(engine.run())
        .await
        .map_err(|e| ApiError::Engine(e.to_string()))?;

    info!(%session, "Session engine finished");
    Ok(StatusCode::OK.into_response())
}

/// One sequenced exchange: admit the batch, return the next outbound page
async fn sync(
    state: &TunnelState,
    session: SessionId,
    seq: u64,
    msgs: Vec<Message>,
) -> Result<Response, ApiError> {
    let mut txn = state
        .store
        .load_and_lock(&session)
        .await
        .ok_or_else(|| ApiError::NotFound(session.clone()))?;

    // A rejected batch leaves the session untouched, so nothing is committed
    let result = txn.sync(seq, msgs, state.page_size);
    let reply = match result {
        Ok(reply) => {
            txn.commit().await;
            reply
        }
        Err(e) => {
            debug!(%session, "Sync rejected: {}", e);
            Reply::Error
        }
    };

    Ok(json_reply(StatusCode::OK, &reply))
}

/// Clear the running flag; the engine notices on its next iteration
async fn stop(state: &TunnelState, session: SessionId) -> Result<Response, ApiError> {
    let mut txn = state
        .store
        .load_and_lock(&session)
        .await
        .ok_or_else(|| ApiError::NotFound(session.clone()))?;
    txn.stop();
    txn.commit().await;

    info!(%session, "Session stop requested");
    Ok(StatusCode::OK.into_response())
}

async fn handle_delete(
    State(state): State<Arc<TunnelState>>,
    Path(session): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = parse_session(&session)?;
    if state.store.destroy(&session).await {
        info!(%session, "Session destroyed");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_get(
    State(state): State<Arc<TunnelState>>,
    Path(session): Path<String>,
) -> Result<Response, ApiError> {
    let session = parse_session(&session)?;
    let txn = state
        .store
        .load_and_lock(&session)
        .await
        .ok_or_else(|| ApiError::NotFound(session.clone()))?;
    let snapshot = txn.snapshot();
    drop(txn);

    Ok((StatusCode::OK, axum::Json(snapshot)).into_response())
}
