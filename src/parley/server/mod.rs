// SPDX-License-Identifier: MIT

//! HTTP surface over a [`FlowEngine`]

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::parley::engine::{AdvanceResponse, FlowEngine};
use crate::parley::error::ParleyError;
use crate::parley::flow::nodes::ExternalInput;

pub async fn serve(
    engine: Arc<FlowEngine>,
    port: u16,
    sweep_every: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    spawn_sweeper(engine.clone(), sweep_every);

    let app = router(engine);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    log::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(engine: Arc<FlowEngine>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/flows", get(list_flows))
        .route("/api/flows/{flow_id}/advance", post(advance))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/cancel", post(cancel))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Fire wait deadlines and idle timeouts in the background
pub fn spawn_sweeper(engine: Arc<FlowEngine>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match engine.sweep(chrono::Utc::now()).await {
                Ok(fired) if !fired.is_empty() => {
                    log::info!("Sweep advanced {} sessions", fired.len())
                }
                Ok(_) => {}
                Err(e) => log::error!("Sweep failed: {}", e),
            }
        }
    })
}

/// A [`ParleyError`] rendered as a JSON response
struct ApiError(ParleyError);

impl From<ParleyError> for ApiError {
    fn from(e: ParleyError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ParleyError::FlowNotFound(_) | ParleyError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ParleyError::SessionNotWaiting { .. }
            | ParleyError::FlowMismatch { .. }
            | ParleyError::State(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_flows(State(engine): State<Arc<FlowEngine>>) -> Json<Value> {
    let flows: Vec<Value> = engine
        .catalog()
        .flows()
        .map(|graph| {
            json!({
                "id": graph.id(),
                "name": graph.definition().name,
                "nodes": graph.nodes().count(),
                "strategy": graph.strategy_hint(),
            })
        })
        .collect();
    Json(json!(flows))
}

#[derive(Debug, Default, Deserialize)]
struct AdvanceRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    input: Option<ExternalInput>,
}

#[tracing::instrument(skip(engine, request))]
async fn advance(
    State(engine): State<Arc<FlowEngine>>,
    Path(flow_id): Path<String>,
    Json(request): Json<AdvanceRequest>,
) -> Result<Json<AdvanceResponse>, ApiError> {
    let response = engine
        .advance(&flow_id, request.session_id.as_deref(), request.input)
        .await?;
    Ok(Json(response))
}

async fn get_session(
    State(engine): State<Arc<FlowEngine>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = engine.session(&id).await?;
    Ok(Json(json!({
        "meta": session.meta,
        "context": session.context,
    })))
}

#[tracing::instrument(skip(engine))]
async fn cancel(
    State(engine): State<Arc<FlowEngine>>,
    Path(id): Path<String>,
) -> Result<Json<AdvanceResponse>, ApiError> {
    Ok(Json(engine.cancel(&id).await?))
}
