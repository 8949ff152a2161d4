//! HTTP server for health, status, and metrics endpoints
//!
//! - GET /health - Liveness (JSON)
//! - GET /metrics - Prometheus metrics
//! - GET /status - Per-status request counts, uptime
//! - GET /requests/{msg_id} - One tracked request
//! - POST /dev/emit-line - Encrypt and inject an intent (dev only)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::info;

use crate::canonical::BridgeMessage;
use crate::codec::EventCodec;
use crate::db;
use crate::metrics;
use crate::monitors::{ChainEvent, IntakeEvent};

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub codec: Arc<EventCodec>,
    pub intake: mpsc::Sender<IntakeEvent>,
    pub active_key_version: u32,
    pub dev_enabled: bool,
    pub started: Instant,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    uptime_seconds: u64,
    requests: Vec<StatusCount>,
}

#[derive(Serialize)]
struct StatusCount {
    status: String,
    count: i64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

async fn status(State(state): State<AppState>) -> Response {
    let counts = match db::status_counts(&state.db).await {
        Ok(counts) => counts,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    for (status, count) in &counts {
        metrics::set_requests_by_status(status, *count);
    }

    Json(StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        requests: counts
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect(),
    })
    .into_response()
}

async fn get_request(
    State(state): State<AppState>,
    Path(msg_id): Path<String>,
) -> Response {
    match db::get_request(&state.db, &msg_id).await {
        Ok(Some(request)) => Json(request).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no request with msg_id {}", msg_id),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct EmitLineRequest {
    message: BridgeMessage,
    /// Key version to encrypt with; defaults to the active version.
    kv: Option<u32>,
}

#[derive(Serialize)]
struct EmitLineResponse {
    msg_id: String,
    line: String,
}

/// Dev-only: encrypt a canonical message with the active key and feed it
/// into the pipeline exactly as a monitor would.
async fn dev_emit_line(
    State(state): State<AppState>,
    Json(body): Json<EmitLineRequest>,
) -> Response {
    if !state.dev_enabled {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "not found".to_string(),
            }),
        )
            .into_response();
    }

    let kv = body.kv.unwrap_or(state.active_key_version);
    let line = match state.codec.encrypt_to_line(&body.message, kv) {
        Ok(line) => line,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let msg_id = crate::canonical::msg_id_hex(&body.message.msg_id());
    let event = ChainEvent::Intent {
        chain: "dev".to_string(),
        tx_ref: format!("dev:{}", msg_id),
        line: line.clone(),
    };

    // journaled like any monitor observation, so it survives a crash
    // before the processor persists it
    let event_key = format!("dev:{}", msg_id);
    let payload = match serde_json::to_string(&event) {
        Ok(payload) => payload,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };
    let journal_id = match db::insert_chain_event(&state.db, &event_key, "dev", &payload).await {
        // already journaled: the processor (or its recovery pass) owns it
        Ok(None) => return Json(EmitLineResponse { msg_id, line }).into_response(),
        Ok(Some(id)) => id,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    if state
        .intake
        .send(IntakeEvent { journal_id, event })
        .await
        .is_err()
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "pipeline is shutting down".to_string(),
            }),
        )
            .into_response();
    }

    Json(EmitLineResponse { msg_id, line }).into_response()
}

/// Start the API server
pub async fn start_server(
    bind_address: &str,
    port: u16,
    state: AppState,
) -> eyre::Result<()> {
    metrics::UP.set(1.0);

    let dev_enabled = state.dev_enabled;
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/requests/{msg_id}", get(get_request))
        .route("/dev/emit-line", post(dev_emit_line))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("API server listening on {}", addr);
    info!("  /health   - Liveness (JSON)");
    info!("  /metrics  - Prometheus metrics");
    info!("  /status   - Pipeline status counts");
    if dev_enabled {
        info!("  /dev/emit-line - Dev intent injection ENABLED");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
