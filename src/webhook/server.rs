//! Inbound webhook server.
//!
//! Three endpoints: `POST /webhook/results` accepts engine result
//! payloads, `GET /webhook/status` surfaces tracked-job status, and
//! `GET /webhook/health` reports liveness with per-dependency sub-checks.
//! CORS preflight is handled by the layer; unsupported verbs get 405 from
//! the router.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use super::auth::{verify_request, RequestAuth};
use super::client::WebhookClient;
use super::payload::ResultPayload;
use crate::config::AuthConfig;
use crate::queue::QueueManager;
use crate::tracker::JobTracker;

/// Shared state for the webhook server.
#[derive(Clone)]
pub struct GatewayState {
    pub tracker: Arc<JobTracker>,
    pub queue: Arc<QueueManager>,
    pub client: Arc<WebhookClient>,
    pub auth: AuthConfig,
    pub results_tx: mpsc::Sender<ResultPayload>,
    /// Results dropped because the buffer was full.
    pub dropped_results: Arc<AtomicU64>,
}

/// Build the webhook router.
pub fn create_router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("x-signature"),
            header::HeaderName::from_static("x-timestamp"),
        ]);

    Router::new()
        .route("/webhook/results", post(post_results))
        .route("/webhook/status", get(get_status))
        .route("/webhook/health", get(get_health))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the task is aborted.
pub async fn serve(state: GatewayState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    tracing::info!("webhook server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn post_results(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = RequestAuth {
        method: "POST",
        path: "/webhook/results",
        api_key: header_str(&headers, "x-api-key"),
        timestamp: header_str(&headers, "x-timestamp"),
        signature: header_str(&headers, "x-signature"),
        body: &body,
    };
    if let Err(failure) = verify_request(&state.auth, &request, chrono::Utc::now().timestamp()) {
        tracing::warn!(error = %failure, "webhook auth rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": failure.to_string()})),
        )
            .into_response();
    }

    let payload: ResultPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("malformed payload: {e}")})),
            )
                .into_response();
        }
    };
    if let Err(e) = payload.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response();
    }

    let job_id = payload.job_id.clone();
    match state.results_tx.try_send(payload) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "accepted", "jobId": job_id})),
        )
            .into_response(),
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Documented policy: bounded buffer, drop on full. The engine
            // redelivers and the merge is idempotent on job id.
            state.dropped_results.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(job = %job_id, "result buffer full, payload dropped");
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "dropped", "jobId": job_id})),
            )
                .into_response()
        }
        Err(mpsc::error::TrySendError::Closed(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "result consumer is not running"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    #[serde(rename = "jobId")]
    job_id: Option<String>,
}

async fn get_status(
    State(state): State<GatewayState>,
    Query(params): Query<StatusParams>,
) -> Response {
    let Some(job_id) = params.job_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "jobId query parameter is required"})),
        )
            .into_response();
    };
    match state.tracker.get_job(&job_id).await {
        Some(job) => {
            let last_error = job.errors.last().cloned();
            let mut body = serde_json::to_value(&job).unwrap_or_default();
            if let Some(map) = body.as_object_mut() {
                map.insert(
                    "lastError".to_string(),
                    last_error.map(Into::into).unwrap_or(serde_json::Value::Null),
                );
            }
            (StatusCode::OK, Json(body)).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("unknown job: {job_id}")})),
        )
            .into_response(),
    }
}

async fn get_health(State(state): State<GatewayState>) -> Response {
    let client_reachable = state.client.probe().await;
    let tracker_check = state.tracker.is_healthy().await;
    let queue_check = state.queue.is_healthy().await;

    let healthy = client_reachable && tracker_check.is_ok() && queue_check.is_ok();
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "checks": {
            "webhookClient": {
                "healthy": client_reachable,
            },
            "jobTracker": {
                "healthy": tracker_check.is_ok(),
                "error": tracker_check.err(),
            },
            "queueManager": {
                "healthy": queue_check.is_ok(),
                "error": queue_check.err(),
            },
        },
        "droppedResults": state.dropped_results.load(Ordering::Relaxed),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}
