//! HTTP API for health checks and reconciliation sessions

use crate::chain::ChainRegistry;
use crate::config::ApiConfig;
use crate::coordination::{Operation, OperationKind, Reconciler, RefreshCallback, SessionView};
use crate::error::{ReconcilerError, ReconcilerResult};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    /// Absent when RPC health is not checked (tests, offline tooling)
    pub chains: Option<Arc<ChainRegistry>>,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    reconciler: Arc<Reconciler>,
    chains: Arc<ChainRegistry>,
) -> ReconcilerResult<()> {
    let app = router(AppState {
        reconciler,
        chains: Some(chains),
    });

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ReconcilerError::Internal(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| ReconcilerError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/sessions", get(list_sessions).post(start_session))
        .route(
            "/sessions/:pool/:kind",
            get(get_session).delete(stop_session),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every configured chain reachable over RPC
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let details: Vec<ChainHealth> = match &state.chains {
        Some(chains) => chains
            .health_check()
            .await
            .into_iter()
            .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
            .collect(),
        None => Vec::new(),
    };
    let ready = details.iter().all(|c| c.healthy);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            active_sessions: state.reconciler.active_count(),
            details,
        }),
    )
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let mut sessions: Vec<SessionView> = state
        .reconciler
        .sessions()
        .iter()
        .map(|s| s.view())
        .collect();
    sessions.sort_by_key(|s| s.started_at);
    Json(sessions)
}

async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = request.operation.pool_address;
    let kind = request.operation.kind;
    let refresh: RefreshCallback = Arc::new(move || {
        debug!("Refresh available for {} session of pool {:?}", kind, pool);
    });

    let session = state
        .reconciler
        .track(request.operation, request.tx_hash, refresh)?;
    Ok((StatusCode::CREATED, Json(session.view())))
}

async fn get_session(
    State(state): State<AppState>,
    Path((pool, kind)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let (pool, kind) = parse_key(&pool, &kind)?;
    state
        .reconciler
        .session(pool, kind)
        .map(|s| Json(s.view()))
        .ok_or(ApiError::NotFound)
}

async fn stop_session(
    State(state): State<AppState>,
    Path((pool, kind)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let (pool, kind) = parse_key(&pool, &kind)?;
    if state.reconciler.stop(pool, kind) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

fn parse_key(pool: &str, kind: &str) -> Result<(Address, OperationKind), ApiError> {
    let pool = Address::from_str(pool).map_err(|e| {
        ApiError::Reconciler(ReconcilerError::InvalidOperation(format!(
            "invalid pool address {}: {}",
            pool, e
        )))
    })?;
    Ok((pool, kind.parse()?))
}

// Request and response types

#[derive(Deserialize)]
struct StartSessionRequest {
    #[serde(flatten)]
    operation: Operation,
    /// Originating transaction, when the caller just submitted it
    #[serde(default)]
    tx_hash: Option<H256>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    active_sessions: usize,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
enum ApiError {
    NotFound,
    Reconciler(ReconcilerError),
}

impl From<ReconcilerError> for ApiError {
    fn from(e: ReconcilerError) -> Self {
        ApiError::Reconciler(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "session not found".to_string()),
            ApiError::Reconciler(e @ ReconcilerError::SessionAlreadyActive { .. }) => {
                (StatusCode::CONFLICT, e.to_string())
            }
            ApiError::Reconciler(e) if e.is_configuration() => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            ApiError::Reconciler(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}
