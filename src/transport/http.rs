use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::{Bridge, BridgeReply, RequestFormat};
use crate::config::ServerSettings;
use crate::utils::error::{Error, Result};

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub request_format: RequestFormat,
}

/// Body of every response: `{"status": "success" | "error", "message": ...}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub status: &'static str,
    pub message: Value,
    #[serde(rename = "pendingReplies", skip_serializing_if = "Option::is_none")]
    pub pending_replies: Option<usize>,
}

impl ApiResponse {
    fn success(message: impl Into<Value>) -> Self {
        Self {
            status: "success",
            message: message.into(),
            pending_replies: None,
        }
    }

    fn error(message: impl Into<Value>) -> Self {
        Self {
            status: "error",
            message: message.into(),
            pending_replies: None,
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

/// Status code an error is reported with.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> ApiResult {
    (status_for(err), Json(ApiResponse::error(err.to_string())))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/publish", post(publish))
        .route("/api/publishbroker", post(publish_broker))
        .with_state(state)
}

async fn index() -> ApiResult {
    (StatusCode::OK, Json(ApiResponse::success("hello world")))
}

async fn health(State(state): State<AppState>) -> ApiResult {
    let mut response = ApiResponse::success("Service is healthy");
    response.pending_replies = Some(state.bridge.pending());
    (StatusCode::OK, Json(response))
}

/// Accepts a body without touching the broker.
async fn publish(body: Bytes) -> ApiResult {
    if body.is_empty() {
        return error_response(&Error::InvalidRequest("request body is empty".to_string()));
    }
    (
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(String::from_utf8_lossy(&body).into_owned())),
    )
}

async fn publish_broker(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request = match state.request_format.parse(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected request: {e}");
            return error_response(&e);
        }
    };

    match state.bridge.send(request.payload, &request.request_text).await {
        Ok(reply) => {
            let status = match reply {
                BridgeReply::Forwarded { .. } => StatusCode::ACCEPTED,
                _ => StatusCode::OK,
            };
            let message = serde_json::to_value(&reply).unwrap_or_default();
            (status, Json(ApiResponse::success(message)))
        }
        Err(e) => {
            warn!("Bridge request failed: {e}");
            error_response(&e)
        }
    }
}

pub async fn bind(settings: &ServerSettings) -> Result<TcpListener> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);
    Ok(listener)
}

/// Serves until `shutdown` is cancelled, then drains in-flight requests.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("HTTP server stopped");
    Ok(())
}
