//! HTTP handlers for the chat and admin surfaces

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::Stream;
use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::info;

use super::types::{
    ErrorEnvelope, ForceOverrideRequest, ProviderStatusEntry, ProvidersResponse, StatusResponse,
    ThresholdsResponse,
};
use super::AppState;
use crate::health::CircuitState;
use crate::pipeline::{ChatRequest, PipelineError, StreamFrame};
use crate::routing::ThresholdsUpdate;

/// Handler-level failure, rendered as the stable error envelope.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn validation(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation",
            message,
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: "missing or invalid admin credential".to_string(),
        }
    }

    fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorEnvelope::new(self.code, self.message)),
        )
            .into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Validation(message) => ApiError::validation(message),
        }
    }
}

/// Frame receiver that cancels the request when the client goes away:
/// dropping the SSE body drops this stream, which drops the guard, which
/// fires the pipeline's cancellation token.
struct FrameStream {
    rx: mpsc::Receiver<StreamFrame>,
    _guard: DropGuard,
}

impl Stream for FrameStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                let event = Event::default()
                    .json_data(&frame)
                    .unwrap_or_else(|_| Event::default().data("{}"));
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// `POST /v1/chat` — unary JSON or an SSE token stream depending on
/// `flags.stream`.
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if request.flags.stream {
        let cancel = CancellationToken::new();
        let rx = state
            .pipeline
            .clone()
            .handle_stream(request, cancel.clone())
            .map_err(ApiError::from)?;
        let stream = FrameStream {
            rx,
            _guard: cancel.drop_guard(),
        };
        Ok(Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        let response = state
            .pipeline
            .handle_unary(request)
            .await
            .map_err(ApiError::from)?;
        Ok(Json(response).into_response())
    }
}

/// `GET /providers` — health summary for every provider in the current
/// table. Read-only, no credential required.
pub async fn get_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    let set = state.pipeline.registry().snapshot();
    let mut providers = HashMap::new();
    for provider in set.iter() {
        let descriptor = provider.descriptor();
        let snapshot = state.pipeline.health().snapshot(&descriptor.name);
        let status = match snapshot.state {
            CircuitState::Closed => "healthy",
            CircuitState::HalfOpen => "probing",
            CircuitState::Open => "unavailable",
        };
        providers.insert(
            descriptor.name.clone(),
            ProviderStatusEntry {
                status: status.to_string(),
                tier: descriptor.tier,
                p95_latency_ms: snapshot.p95_latency_ms,
                error_rate: snapshot.error_rate,
                circuit_state: snapshot.state,
            },
        );
    }
    Json(ProvidersResponse {
        router_active: !set.is_empty(),
        providers,
        timestamp: Utc::now(),
    })
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = &state.admin_token;
    if expected.is_empty() {
        return Err(ApiError::unauthorized());
    }
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

/// `POST /admin/router/set-thresholds`
pub async fn set_thresholds(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<ThresholdsUpdate>,
) -> Result<Json<ThresholdsResponse>, ApiError> {
    authorize(&state, &headers)?;
    let current = state
        .pipeline
        .engine()
        .update_thresholds(update)
        .map_err(|e| ApiError::validation(e.to_string()))?;
    info!("router thresholds updated");
    Ok(Json(ThresholdsResponse {
        current_thresholds: current,
    }))
}

/// `GET /admin/router/thresholds`
pub async fn get_thresholds(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ThresholdsResponse>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(ThresholdsResponse {
        current_thresholds: (*state.pipeline.engine().thresholds()).clone(),
    }))
}

/// `POST /admin/budget/reset`
pub async fn reset_budget(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    authorize(&state, &headers)?;
    state.pipeline.budget().reset_day();
    Ok(Json(StatusResponse {
        status: "budget_reset".to_string(),
    }))
}

/// `GET /admin/budget`
pub async fn get_budget(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let snapshot = state.pipeline.budget().snapshot();
    serde_json::to_value(snapshot)
        .map(Json)
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// `POST /admin/router/reload-secrets` — re-reads descriptors and
/// credentials, swapping the provider table atomically. In-flight
/// requests finish on their captured snapshot.
pub async fn reload_providers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    authorize(&state, &headers)?;
    let settings = crate::config::Settings::load(state.config_path.as_deref())
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state
        .pipeline
        .reload_providers(&settings.descriptors())
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(StatusResponse {
        status: "reloaded".to_string(),
    }))
}

/// `POST /admin/router/force-override`
pub async fn force_override(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ForceOverrideRequest>,
) -> Result<Json<ThresholdsResponse>, ApiError> {
    authorize(&state, &headers)?;
    if let Some(name) = &request.provider {
        let set = state.pipeline.registry().snapshot();
        if set.get(name).is_none() {
            return Err(ApiError::validation(format!(
                "unknown provider: {}",
                name
            )));
        }
    }
    let current = state
        .pipeline
        .engine()
        .set_forced_override(request.provider);
    Ok(Json(ThresholdsResponse {
        current_thresholds: current,
    }))
}

/// `GET /admin/metrics`
pub async fn get_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.pipeline.metrics().snapshot()))
}

/// Liveness probe.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
