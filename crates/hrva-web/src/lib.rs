//! Axum HTTP API: health check and the agent-backed query endpoint.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use hrva_core::{QueryAgent, StubAgent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hrva-web";

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<dyn QueryAgent>,
}

impl AppState {
    pub fn new(agent: Arc<dyn QueryAgent>) -> Self {
        Self { agent }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Arc::new(StubAgent))
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HRVA_WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("HRVA_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

/// User question in Russian or English.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryRequest {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryResponse {
    pub request_id: String,
    pub answer: String,
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/v1", Router::new().route("/query", post(query_handler)))
        .with_state(Arc::new(state))
}

/// Bind `host:port`; `host` may be an IP address or a resolvable name.
pub async fn bind(config: &WebConfig) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;
    Ok(listener)
}

pub async fn serve(config: WebConfig, state: AppState) -> anyhow::Result<()> {
    let listener = bind(&config).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env(), AppState::default()).await
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return error_response(rejection.status(), rejection.body_text()),
    };
    if request.text.is_empty() {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "text: should have at least 1 character".to_string(),
        );
    }

    let request_id = Uuid::new_v4().to_string();
    match state.agent.answer(&request.text).await {
        Ok(result) => {
            info!(%request_id, chars = request.text.chars().count(), "answered query");
            Json(QueryResponse {
                request_id,
                answer: result.answer,
                metadata: result.metadata,
            })
            .into_response()
        }
        Err(err) => {
            error!(%request_id, error = %err, "agent failed");
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, detail: String) -> Response {
    (status, Json(ErrorBody { detail })).into_response()
}
